//! Phase records and the phase controller.
//!
//! A phase runs as one unit: entry gate → DAG slice → exit gate. On a
//! failing exit verdict the controller composes a rework plan (the failing
//! nodes plus, by default, their transitive dependents within the phase),
//! resets those nodes and re-runs the slice under a raised threshold. The
//! phase can never complete while required outputs are missing or a blocking
//! gate fails, whatever the per-node success flags claim.

use crate::breaker::{FailureCategory, FailureReport};
use crate::dag::builder::NodeIndex;
use crate::dag::builder::WorkflowDag;
use crate::dag::executor::{DagExecutor, SliceOutcome};
use crate::dag::node::NodeState;
use crate::errors::EngineError;
use crate::events::EventKind;
use crate::policy::{EntryCriterion, GateReport, PhaseVerdict, PolicyEngine, Verdict};
use crate::runner::MetricValue;
use crate::supervisor::ExecutionContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle state of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Pending,
    InProgress,
    AwaitingRework,
    Completed,
    Blocked,
}

impl PhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Blocked)
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::AwaitingRework => "awaiting_rework",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

/// Persistent per-phase record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase_id: String,
    pub ordinal: u32,
    pub iteration_index: u32,
    pub state: PhaseState,
}

impl PhaseRecord {
    pub fn new(phase_id: &str, ordinal: u32) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            ordinal,
            iteration_index: 0,
            state: PhaseState::Pending,
        }
    }
}

/// How much of a phase a rework plan resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReworkScope {
    /// Only the nodes whose outputs caused the failure
    FailingOnly,
    /// Failing nodes plus their transitive dependents within the phase
    #[default]
    WithDependents,
}

/// How a phase run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    Blocked,
    Paused,
    Cancelled,
}

/// Nodes to reset for rework: failing nodes widened per the scope policy.
/// Falls back to the whole slice when a phase-level failure has no
/// attributable subject.
pub fn compute_rework_set(
    dag: &WorkflowDag,
    scope: &[NodeIndex],
    failing: &[NodeIndex],
    rework_scope: ReworkScope,
) -> Vec<NodeIndex> {
    if failing.is_empty() {
        return scope.to_vec();
    }
    match rework_scope {
        ReworkScope::FailingOnly => {
            let mut out = failing.to_vec();
            out.sort_unstable();
            out.dedup();
            out
        }
        ReworkScope::WithDependents => dag.transitive_dependents_within_phase(failing),
    }
}

/// Drives one phase through entry gate → slice → exit gate, bounded by the
/// per-phase iteration budget.
pub struct PhaseController {
    policy: Arc<PolicyEngine>,
    max_iterations: u32,
    rework_scope: ReworkScope,
}

impl PhaseController {
    pub fn new(policy: Arc<PolicyEngine>, max_iterations: u32, rework_scope: ReworkScope) -> Self {
        Self {
            policy,
            max_iterations,
            rework_scope,
        }
    }

    /// Run the phase to a terminal outcome, or stop on pause/cancel.
    pub async fn run_phase(
        &self,
        ctx: &ExecutionContext,
        phase_id: &str,
    ) -> Result<PhaseOutcome, EngineError> {
        // Idempotent re-entry after resume: a completed phase stays done.
        {
            let state = ctx.state.lock().await;
            let record = Self::record(&state, phase_id)?;
            if record.state == PhaseState::Completed {
                return Ok(PhaseOutcome::Completed);
            }
        }

        if !self.entry_criteria_hold(ctx, phase_id).await? {
            let mut state = ctx.state.lock().await;
            Self::record_mut(&mut state, phase_id)?.state = PhaseState::Blocked;
            ctx.events.publish(EventKind::PhaseBlocked {
                phase_id: phase_id.to_string(),
                reason: "entry criteria not met".into(),
            });
            state.execution.touch();
            ctx.persist(&state)?;
            return Ok(PhaseOutcome::Blocked);
        }

        loop {
            let (scope, iteration) = {
                let mut state = ctx.state.lock().await;
                let scope = state.dag.phase_nodes(phase_id);
                let record = Self::record_mut(&mut state, phase_id)?;
                record.state = PhaseState::InProgress;
                let iteration = record.iteration_index;
                state.execution.current_phase = Some(phase_id.to_string());
                state.execution.touch();
                ctx.events.publish(EventKind::PhaseEntered {
                    phase_id: phase_id.to_string(),
                    iteration,
                });
                ctx.persist(&state)?;
                (scope, iteration)
            };

            match DagExecutor::run_slice(ctx, &scope).await? {
                SliceOutcome::AllTerminal => {}
                SliceOutcome::Paused => return Ok(PhaseOutcome::Paused),
                SliceOutcome::Cancelled => return Ok(PhaseOutcome::Cancelled),
            }

            let verdict = self.exit_verdict(ctx, phase_id, iteration, &scope).await?;

            match verdict.verdict {
                Verdict::Pass | Verdict::Warning => {
                    let mut state = ctx.state.lock().await;
                    Self::record_mut(&mut state, phase_id)?.state = PhaseState::Completed;
                    state
                        .last_verdicts
                        .insert(phase_id.to_string(), verdict.clone());
                    ctx.events.publish(EventKind::PhaseExited {
                        phase_id: phase_id.to_string(),
                        verdict: verdict.verdict.to_string(),
                    });
                    state.execution.touch();
                    ctx.persist(&state)?;
                    return Ok(PhaseOutcome::Completed);
                }
                Verdict::Fail => {
                    let mut state = ctx.state.lock().await;
                    state
                        .last_verdicts
                        .insert(phase_id.to_string(), verdict.clone());

                    // Unknown criteria cannot be reworked away (fail-safe),
                    // and an exhausted budget blocks the phase.
                    let budget_left = iteration + 1 < self.max_iterations;
                    if !verdict.unknown_criteria.is_empty() || !budget_left {
                        // A gate-only block (all work present, thresholds
                        // unmet) is a policy failure, never retried.
                        if verdict.complete && verdict.unknown_criteria.is_empty() {
                            let failed_node = verdict
                                .failing_subjects
                                .first()
                                .cloned()
                                .unwrap_or_else(|| phase_id.to_string());
                            state.last_failure = Some(FailureReport {
                                failed_node: failed_node.clone(),
                                persona_id: failed_node,
                                category: FailureCategory::QualityGate,
                                recoverable: false,
                                attempt: iteration + 1,
                                artifact_paths: Vec::new(),
                                message: format!(
                                    "blocking gates failed at iteration {iteration}"
                                ),
                                created_at: chrono::Utc::now(),
                            });
                        }
                        Self::record_mut(&mut state, phase_id)?.state = PhaseState::Blocked;
                        ctx.events.publish(EventKind::PhaseBlocked {
                            phase_id: phase_id.to_string(),
                            reason: if verdict.unknown_criteria.is_empty() {
                                format!("exit gate failed after {} iterations", iteration + 1)
                            } else {
                                format!(
                                    "unknown exit criteria: {}",
                                    verdict.unknown_criteria.join(", ")
                                )
                            },
                        });
                        state.execution.touch();
                        ctx.persist(&state)?;
                        return Ok(PhaseOutcome::Blocked);
                    }

                    let failing: Vec<NodeIndex> = scope
                        .iter()
                        .copied()
                        .filter(|&i| {
                            let node = state.dag.node(i);
                            verdict.failing_subjects.contains(&node.node_id)
                                || matches!(node.state, NodeState::Failed | NodeState::Skipped)
                        })
                        .collect();
                    let rework =
                        compute_rework_set(&state.dag, &scope, &failing, self.rework_scope);
                    let rework_ids: Vec<String> = rework
                        .iter()
                        .map(|&i| state.dag.node(i).node_id.clone())
                        .collect();
                    for &i in &rework {
                        state.dag.node_mut(i).reset_for_rework();
                    }

                    let record = Self::record_mut(&mut state, phase_id)?;
                    record.iteration_index += 1;
                    let next_iteration = record.iteration_index;
                    ctx.events.publish(EventKind::PhaseRework {
                        phase_id: phase_id.to_string(),
                        iteration: next_iteration,
                        nodes: rework_ids,
                    });
                    state.execution.touch();
                    ctx.persist(&state)?;
                    tracing::info!(
                        phase_id,
                        iteration = next_iteration,
                        reworked = rework.len(),
                        "phase exit failed, reworking"
                    );
                }
            }
        }
    }

    /// Entry criteria: evaluated against prior phase outcomes and the
    /// context store. An unknown criterion fails (fail-safe).
    async fn entry_criteria_hold(
        &self,
        ctx: &ExecutionContext,
        phase_id: &str,
    ) -> Result<bool, EngineError> {
        let Some(slo) = self.policy.bundle().slos.slo(phase_id).cloned() else {
            return Ok(false);
        };
        let state = ctx.state.lock().await;
        for criterion in &slo.entry_criteria {
            let holds = match criterion {
                EntryCriterion::PriorPhasesCompleted => {
                    let ordinal = Self::record(&state, phase_id)?.ordinal;
                    state
                        .phases
                        .iter()
                        .filter(|p| p.ordinal < ordinal)
                        .all(|p| p.state == PhaseState::Completed)
                }
                EntryCriterion::RequiredArtifact { label } => !ctx
                    .context
                    .list(
                        &state.execution.execution_id,
                        &crate::context::ArtifactFilter {
                            label: Some(label.clone()),
                            ..Default::default()
                        },
                    )
                    .is_empty(),
                EntryCriterion::Unknown { name } => {
                    tracing::warn!(phase_id, criterion = %name, "unknown entry criterion");
                    false
                }
            };
            if !holds {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate per-node gates and the phase exit criteria, publishing gate
    /// events along the way.
    async fn exit_verdict(
        &self,
        ctx: &ExecutionContext,
        phase_id: &str,
        iteration: u32,
        scope: &[NodeIndex],
    ) -> Result<PhaseVerdict, EngineError> {
        let mut state = ctx.state.lock().await;

        let mut node_reports: Vec<GateReport> = Vec::new();
        let mut phase_metrics: HashMap<String, Vec<f64>> = HashMap::new();
        let mut complete = true;

        for &i in scope {
            let node = state.dag.node(i);
            match node.state {
                NodeState::Completed => {
                    for (name, value) in &node.metrics {
                        if let Some(n) = value.as_number() {
                            phase_metrics.entry(name.clone()).or_default().push(n);
                        }
                    }
                    let report = self.policy.evaluate_persona(
                        &node.persona_id,
                        phase_id,
                        iteration,
                        &node.metrics,
                        &state.bypassed_gates,
                    );
                    for gate in &report.gates {
                        let kind = if gate.passed || gate.bypassed {
                            EventKind::GatePass {
                                gate: gate.gate.clone(),
                                subject: report.subject.clone(),
                            }
                        } else {
                            EventKind::GateFail {
                                gate: gate.gate.clone(),
                                subject: report.subject.clone(),
                                threshold: gate.effective_threshold,
                                observed: gate.observed,
                            }
                        };
                        ctx.events.publish(kind);
                    }
                    node_reports.push(report);
                }
                // Reused nodes satisfied their gates in the source
                // execution; they count toward completeness as-is.
                NodeState::Reused => {}
                _ => complete = false,
            }
        }

        let aggregated: HashMap<String, MetricValue> = phase_metrics
            .into_iter()
            .map(|(name, values)| {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                (name, MetricValue::Number(mean))
            })
            .collect();

        let verdict = self.policy.evaluate_phase_exit(
            phase_id,
            iteration,
            &node_reports,
            complete,
            &aggregated,
            &state.bypassed_gates,
        );

        for gate in &verdict.gates {
            let kind = if gate.passed || gate.bypassed {
                EventKind::GatePass {
                    gate: gate.gate.clone(),
                    subject: phase_id.to_string(),
                }
            } else {
                EventKind::GateFail {
                    gate: gate.gate.clone(),
                    subject: phase_id.to_string(),
                    threshold: gate.effective_threshold,
                    observed: gate.observed,
                }
            };
            ctx.events.publish(kind);
        }

        state.execution.touch();
        Ok(verdict)
    }

    fn record<'a>(
        state: &'a crate::supervisor::ExecState,
        phase_id: &str,
    ) -> Result<&'a PhaseRecord, EngineError> {
        state
            .phases
            .iter()
            .find(|p| p.phase_id == phase_id)
            .ok_or_else(|| EngineError::UnknownPhase {
                execution_id: state.execution.execution_id.clone(),
                phase_id: phase_id.to_string(),
            })
    }

    fn record_mut<'a>(
        state: &'a mut crate::supervisor::ExecState,
        phase_id: &str,
    ) -> Result<&'a mut PhaseRecord, EngineError> {
        let execution_id = state.execution.execution_id.clone();
        state
            .phases
            .iter_mut()
            .find(|p| p.phase_id == phase_id)
            .ok_or_else(|| EngineError::UnknownPhase {
                execution_id,
                phase_id: phase_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PersonaCatalog;
    use crate::dag::builder::{PhaseLayout, WorkflowBuilder};

    fn dag() -> WorkflowDag {
        use crate::dag::builder::tests::spec;
        let specs = vec![
            spec("requirement_analyst", "requirements", vec![], false),
            spec("api_designer", "implementation", vec!["requirement_analyst"], true),
            spec("backend_developer", "implementation", vec!["api_designer"], true),
            spec("frontend_developer", "implementation", vec!["api_designer"], true),
            spec("qa_engineer", "testing", vec!["backend_developer"], false),
        ];
        let ids: Vec<String> = specs.iter().map(|s| s.persona_id.clone()).collect();
        let catalog = PersonaCatalog::new(specs).unwrap();
        let layout = PhaseLayout::new(vec![
            "requirements".into(),
            "implementation".into(),
            "testing".into(),
        ]);
        WorkflowBuilder::new(&catalog, layout).build(&ids).unwrap()
    }

    #[test]
    fn test_phase_state_terminal() {
        assert!(!PhaseState::Pending.is_terminal());
        assert!(!PhaseState::InProgress.is_terminal());
        assert!(!PhaseState::AwaitingRework.is_terminal());
        assert!(PhaseState::Completed.is_terminal());
        assert!(PhaseState::Blocked.is_terminal());
    }

    #[test]
    fn test_rework_set_with_dependents() {
        let dag = dag();
        let scope = dag.phase_nodes("implementation");
        let designer = dag.index_of("api_designer").unwrap();
        let backend = dag.index_of("backend_developer").unwrap();
        let frontend = dag.index_of("frontend_developer").unwrap();

        let set = compute_rework_set(&dag, &scope, &[designer], ReworkScope::WithDependents);
        assert!(set.contains(&designer));
        assert!(set.contains(&backend));
        assert!(set.contains(&frontend));
        // qa_engineer lives in a later phase and is untouched.
        assert!(!set.contains(&dag.index_of("qa_engineer").unwrap()));
    }

    #[test]
    fn test_rework_set_failing_only() {
        let dag = dag();
        let scope = dag.phase_nodes("implementation");
        let backend = dag.index_of("backend_developer").unwrap();

        let set = compute_rework_set(&dag, &scope, &[backend], ReworkScope::FailingOnly);
        assert_eq!(set, vec![backend]);
    }

    #[test]
    fn test_rework_set_falls_back_to_whole_slice() {
        let dag = dag();
        let scope = dag.phase_nodes("implementation");
        let set = compute_rework_set(&dag, &scope, &[], ReworkScope::WithDependents);
        assert_eq!(set, scope);
    }

    #[test]
    fn test_phase_record_serialization() {
        let record = PhaseRecord::new("implementation", 1);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"state\":\"pending\""));
        let back: PhaseRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
