//! Quality gate evaluation and phase exit verdicts.
//!
//! Gates never throw to signal failure: evaluation produces a `Verdict`
//! value the controller acts on. Thresholds are progressive, so each rework
//! iteration of a phase raises the effective threshold along a configured
//! monotone scale, multiplied by a per-phase strictness modifier. An
//! unrecognised exit criterion fails the phase (fail-safe), and bypasses
//! require an ADR reference, are audit-logged, and are refused outright for
//! the built-in non-bypassable gates.

use crate::dag::builder::PhaseLayout;
use crate::errors::EngineError;
use crate::runner::MetricValue;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Gates that may never be bypassed, whatever the policy document says.
pub const NON_BYPASSABLE_GATES: &[&str] = &["security", "build_success"];

/// Aggregated gate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Warning,
    Fail,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Warning => "warning",
            Self::Fail => "fail",
        };
        write!(f, "{s}")
    }
}

/// Severity of a single gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSeverity {
    /// A failing blocking gate fails the verdict
    Blocking,
    /// Recorded but never changes pass/fail
    Warning,
}

/// One quality gate: a named metric compared against a progressive threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub base_threshold: f64,
    pub severity: GateSeverity,
    #[serde(default)]
    pub bypassable: bool,
}

impl GateSpec {
    pub fn blocking(name: &str, base_threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            base_threshold,
            severity: GateSeverity::Blocking,
            bypassable: false,
        }
    }

    pub fn warning(name: &str, base_threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            base_threshold,
            severity: GateSeverity::Warning,
            bypassable: false,
        }
    }

    pub fn with_bypassable(mut self, bypassable: bool) -> Self {
        self.bypassable = bypassable;
        self
    }
}

/// Outcome of evaluating one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub severity: GateSeverity,
    pub effective_threshold: f64,
    /// The observed metric; None when the executor reported nothing numeric
    pub observed: Option<f64>,
    pub passed: bool,
    pub bypassed: bool,
}

/// Per-subject (persona or phase) gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub subject: String,
    pub verdict: Verdict,
    pub gates: Vec<GateResult>,
}

impl GateReport {
    fn from_results(subject: &str, gates: Vec<GateResult>) -> Self {
        let mut verdict = Verdict::Pass;
        for g in &gates {
            if !g.passed && !g.bypassed {
                match g.severity {
                    GateSeverity::Blocking => {
                        verdict = Verdict::Fail;
                        break;
                    }
                    GateSeverity::Warning => verdict = Verdict::Warning,
                }
            } else if g.bypassed && verdict == Verdict::Pass {
                verdict = Verdict::Warning;
            }
        }
        Self {
            subject: subject.to_string(),
            verdict,
            gates,
        }
    }

    pub fn failing_blocking_gates(&self) -> impl Iterator<Item = &GateResult> {
        self.gates
            .iter()
            .filter(|g| !g.passed && !g.bypassed && g.severity == GateSeverity::Blocking)
    }
}

/// Global defaults plus per-persona gate overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterContract {
    #[serde(default)]
    pub default_gates: Vec<GateSpec>,
    #[serde(default)]
    pub persona_gates: HashMap<String, Vec<GateSpec>>,
}

impl MasterContract {
    /// Gates applying to a persona: its own gates shadow same-name defaults.
    pub fn gates_for(&self, persona_id: &str) -> Vec<&GateSpec> {
        let own = self.persona_gates.get(persona_id);
        let mut out: Vec<&GateSpec> = Vec::new();
        if let Some(own) = own {
            out.extend(own.iter());
        }
        for default in &self.default_gates {
            if !out.iter().any(|g| g.name == default.name) {
                out.push(default);
            }
        }
        out
    }
}

/// Phase entry criterion, evaluated against the context store and prior
/// phase outcomes before the slice is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "criterion", rename_all = "snake_case")]
pub enum EntryCriterion {
    /// All earlier phases are completed
    PriorPhasesCompleted,
    /// An artifact with this label exists in the context store
    RequiredArtifact { label: String },
    /// Preserved from the policy document but not recognised; always fails
    Unknown { name: String },
}

/// Phase exit criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "criterion", rename_all = "snake_case")]
pub enum ExitCriterion {
    /// Every non-optional node in the phase is terminal-good
    Completeness,
    /// A phase-level gate against aggregated metrics
    Gate(GateSpec),
    /// An externally computed signal consumed from the metrics map; the
    /// engine consumes the value (>= 0.5 passes), it never computes it
    Signal { name: String },
    /// Preserved from the policy document but not recognised; fails the
    /// phase (fail-safe)
    Unknown { name: String },
}

/// Per-phase service-level objectives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSlo {
    pub phase_id: String,
    pub ordinal: u32,
    #[serde(default)]
    pub entry_criteria: Vec<EntryCriterion>,
    #[serde(default)]
    pub exit_criteria: Vec<ExitCriterion>,
    /// Strictness multiplier; terminal phases typically raise it
    #[serde(default = "default_modifier")]
    pub modifier: f64,
}

fn default_modifier() -> f64 {
    1.0
}

impl PhaseSlo {
    pub fn new(phase_id: &str, ordinal: u32) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            ordinal,
            entry_criteria: Vec::new(),
            exit_criteria: vec![ExitCriterion::Completeness],
            modifier: 1.0,
        }
    }

    pub fn with_entry(mut self, criteria: Vec<EntryCriterion>) -> Self {
        self.entry_criteria = criteria;
        self
    }

    pub fn with_exit(mut self, criteria: Vec<ExitCriterion>) -> Self {
        self.exit_criteria = criteria;
        self
    }

    pub fn with_modifier(mut self, modifier: f64) -> Self {
        self.modifier = modifier;
        self
    }
}

/// The phase SLO document: ordered phases plus the progressive scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSlos {
    phases: Vec<PhaseSlo>,
    /// Threshold multipliers per iteration; clamped at the last entry
    scale: Vec<f64>,
}

impl PhaseSlos {
    /// Validate ordering and scale monotonicity at construction, so the
    /// engine never re-checks at evaluation time.
    pub fn new(mut phases: Vec<PhaseSlo>, scale: Vec<f64>) -> Result<Self, EngineError> {
        if scale.is_empty() {
            return Err(EngineError::Other(anyhow::anyhow!(
                "progressive scale must not be empty"
            )));
        }
        if scale.windows(2).any(|w| w[1] < w[0]) {
            return Err(EngineError::Other(anyhow::anyhow!(
                "progressive scale must be non-decreasing: {scale:?}"
            )));
        }
        phases.sort_by_key(|p| p.ordinal);
        Ok(Self { phases, scale })
    }

    /// The conventional scale when a policy document does not supply one.
    pub fn default_scale() -> Vec<f64> {
        vec![0.60, 0.70, 0.80, 0.90, 0.95]
    }

    pub fn layout(&self) -> PhaseLayout {
        PhaseLayout::new(self.phases.iter().map(|p| p.phase_id.clone()).collect())
    }

    pub fn slo(&self, phase_id: &str) -> Option<&PhaseSlo> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }

    pub fn phases(&self) -> &[PhaseSlo] {
        &self.phases
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn modifier(&self, phase_id: &str) -> f64 {
        self.slo(phase_id).map_or(1.0, |s| s.modifier)
    }
}

/// The parsed, validated policy object the kernel consumes. Loading and
/// YAML parsing live outside the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBundle {
    pub contract: MasterContract,
    pub slos: PhaseSlos,
}

/// threshold = base · scale[min(i, len-1)] · modifier
pub fn effective_threshold(base: f64, scale: &[f64], iteration: u32, modifier: f64) -> f64 {
    let idx = (iteration as usize).min(scale.len().saturating_sub(1));
    let s = scale.get(idx).copied().unwrap_or(1.0);
    base * s * modifier
}

/// Phase exit evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseVerdict {
    pub phase_id: String,
    pub iteration: u32,
    pub verdict: Verdict,
    pub gates: Vec<GateResult>,
    /// Subjects (node ids) whose own verdict failed
    pub failing_subjects: Vec<String>,
    /// Unrecognised criteria that forced the fail-safe verdict
    pub unknown_criteria: Vec<String>,
    /// Whether the completeness criterion held
    pub complete: bool,
}

/// Evaluates persona gates and phase exit criteria.
pub struct PolicyEngine {
    bundle: PolicyBundle,
}

impl PolicyEngine {
    pub fn new(bundle: PolicyBundle) -> Self {
        Self { bundle }
    }

    pub fn bundle(&self) -> &PolicyBundle {
        &self.bundle
    }

    pub fn layout(&self) -> PhaseLayout {
        self.bundle.slos.layout()
    }

    /// Evaluate a persona's gates at a given phase iteration.
    ///
    /// A blocking gate with no numeric observation fails (fail-safe); a
    /// warning gate with no observation records a warning.
    pub fn evaluate_persona(
        &self,
        persona_id: &str,
        phase_id: &str,
        iteration: u32,
        metrics: &HashMap<String, MetricValue>,
        bypassed: &HashSet<String>,
    ) -> GateReport {
        let modifier = self.bundle.slos.modifier(phase_id);
        let scale = self.bundle.slos.scale();
        let gates = self
            .bundle
            .contract
            .gates_for(persona_id)
            .into_iter()
            .map(|spec| {
                let threshold =
                    effective_threshold(spec.base_threshold, scale, iteration, modifier);
                let observed = metrics.get(&spec.name).and_then(MetricValue::as_number);
                let passed = observed.is_some_and(|v| v >= threshold);
                GateResult {
                    gate: spec.name.clone(),
                    severity: spec.severity,
                    effective_threshold: threshold,
                    observed,
                    passed,
                    bypassed: bypassed.contains(&spec.name),
                }
            })
            .collect();
        GateReport::from_results(persona_id, gates)
    }

    /// Aggregate per-node verdicts and phase-level criteria into the exit
    /// verdict. The phase cannot pass while required outputs are missing or
    /// any blocking gate fails, whatever the per-node success flags say.
    pub fn evaluate_phase_exit(
        &self,
        phase_id: &str,
        iteration: u32,
        node_reports: &[GateReport],
        complete: bool,
        phase_metrics: &HashMap<String, MetricValue>,
        bypassed: &HashSet<String>,
    ) -> PhaseVerdict {
        let modifier = self.bundle.slos.modifier(phase_id);
        let scale = self.bundle.slos.scale();
        let mut gates = Vec::new();
        let mut unknown = Vec::new();
        let mut completeness_required = false;

        if let Some(slo) = self.bundle.slos.slo(phase_id) {
            for criterion in &slo.exit_criteria {
                match criterion {
                    ExitCriterion::Completeness => completeness_required = true,
                    ExitCriterion::Gate(spec) => {
                        let threshold =
                            effective_threshold(spec.base_threshold, scale, iteration, modifier);
                        let observed =
                            phase_metrics.get(&spec.name).and_then(MetricValue::as_number);
                        gates.push(GateResult {
                            gate: spec.name.clone(),
                            severity: spec.severity,
                            effective_threshold: threshold,
                            observed,
                            passed: observed.is_some_and(|v| v >= threshold),
                            bypassed: bypassed.contains(&spec.name),
                        });
                    }
                    ExitCriterion::Signal { name } => {
                        let observed = phase_metrics.get(name).and_then(MetricValue::as_number);
                        gates.push(GateResult {
                            gate: name.clone(),
                            severity: GateSeverity::Blocking,
                            effective_threshold: 0.5,
                            observed,
                            passed: observed.is_some_and(|v| v >= 0.5),
                            bypassed: bypassed.contains(name),
                        });
                    }
                    ExitCriterion::Unknown { name } => unknown.push(name.clone()),
                }
            }
        } else {
            unknown.push(phase_id.to_string());
        }

        let failing_subjects: Vec<String> = node_reports
            .iter()
            .filter(|r| r.verdict == Verdict::Fail)
            .map(|r| r.subject.clone())
            .collect();

        let gate_fail = gates
            .iter()
            .any(|g| !g.passed && !g.bypassed && g.severity == GateSeverity::Blocking);
        let gate_warn = gates.iter().any(|g| (!g.passed && !g.bypassed) || g.bypassed);
        let node_warn = node_reports.iter().any(|r| r.verdict == Verdict::Warning);

        let verdict = if !unknown.is_empty()
            || gate_fail
            || !failing_subjects.is_empty()
            || (completeness_required && !complete)
        {
            Verdict::Fail
        } else if gate_warn || node_warn {
            Verdict::Warning
        } else {
            Verdict::Pass
        };

        PhaseVerdict {
            phase_id: phase_id.to_string(),
            iteration,
            verdict,
            gates,
            failing_subjects,
            unknown_criteria: unknown,
            complete,
        }
    }

    /// Whether a bypass of `gate` is permitted at all. The caller records
    /// the ADR reference in the audit log and on the event stream.
    pub fn check_bypass(&self, gate: &str) -> Result<(), EngineError> {
        if NON_BYPASSABLE_GATES.contains(&gate) {
            return Err(EngineError::BypassRejected {
                gate: gate.to_string(),
            });
        }
        let declared = self
            .bundle
            .contract
            .default_gates
            .iter()
            .chain(self.bundle.contract.persona_gates.values().flatten())
            .find(|g| g.name == gate);
        match declared {
            Some(spec) if spec.bypassable => Ok(()),
            _ => Err(EngineError::BypassRejected {
                gate: gate.to_string(),
            }),
        }
    }
}
