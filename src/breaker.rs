//! Circuit breaker state and structured failure reports.
//!
//! One breaker exists per (execution, persona). After a run of consecutive
//! blocking failures the breaker opens and dispatch for that persona pauses
//! for a cooldown; the first dispatch afterwards is a single half-open probe.
//! Breaker state is persisted in the checkpoint, so a restart restores the
//! cooldown timer against the wall clock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Failure taxonomy shared by the executor callback, the retry wrapper and
/// the phase controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Syntax,
    TestFailure,
    ContractViolation,
    Timeout,
    QualityGate,
    DependencyMissing,
    ExecutorError,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Syntax => "syntax",
            Self::TestFailure => "test_failure",
            Self::ContractViolation => "contract_violation",
            Self::Timeout => "timeout",
            Self::QualityGate => "quality_gate",
            Self::DependencyMissing => "dependency_missing",
            Self::ExecutorError => "executor_error",
        };
        write!(f, "{s}")
    }
}

/// Machine-readable report for a node failure, persisted in the checkpoint
/// and consumed by the phase controller when composing rework plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub failed_node: String,
    pub persona_id: String,
    pub category: FailureCategory,
    pub recoverable: bool,
    pub attempt: u32,
    /// Canonical paths of artifacts present when the failure was recorded
    #[serde(default)]
    pub artifact_paths: Vec<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl FailureReport {
    /// Operator-facing recommendations derived from the failure shape.
    pub fn recommendations(&self) -> Vec<String> {
        let mut out = Vec::new();
        match self.category {
            FailureCategory::ContractViolation => out.push(format!(
                "Node '{}' violated its output contract; review the persona's output mapping",
                self.failed_node
            )),
            FailureCategory::Timeout => out.push(format!(
                "Node '{}' timed out on attempt {}; consider raising its timeout",
                self.failed_node, self.attempt
            )),
            FailureCategory::QualityGate => out.push(
                "Blocking quality gates failed; consider raising the phase iteration budget"
                    .to_string(),
            ),
            _ => out.push(format!(
                "Node '{}' failed with {}; inspect the executor logs",
                self.failed_node, self.category
            )),
        }
        if !self.recoverable {
            out.push("Failure is unrecoverable; rework or manual intervention required".into());
        }
        out
    }
}

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPosition {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Admission decision for a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; dispatch freely.
    Allowed,
    /// Breaker half-open; this dispatch is the single probe.
    Probe,
    /// Breaker open; hold dispatch for the remaining cooldown.
    Hold { remaining: Duration },
}

/// Per-(execution, persona) circuit breaker. Serialised into the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub persona_id: String,
    pub position: BreakerPosition,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_secs: u64,
    /// Consecutive failures required to open
    pub threshold: u32,
    /// True while a half-open probe is in flight
    #[serde(default)]
    pub probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(persona_id: &str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            persona_id: persona_id.to_string(),
            position: BreakerPosition::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown_secs: cooldown.as_secs(),
            threshold: threshold.max(1),
            probe_in_flight: false,
        }
    }

    /// Decide whether a dispatch may proceed at `now`, promoting an expired
    /// open breaker to half-open. A `Probe` admission reserves the single
    /// half-open slot; the caller must report the outcome.
    pub fn admit(&mut self, now: DateTime<Utc>) -> Admission {
        match self.position {
            BreakerPosition::Closed => Admission::Allowed,
            BreakerPosition::Open => {
                let opened = self.opened_at.unwrap_or(now);
                let elapsed = now.signed_duration_since(opened);
                let cooldown = ChronoDuration::seconds(self.cooldown_secs as i64);
                if elapsed >= cooldown {
                    self.position = BreakerPosition::HalfOpen;
                    self.probe_in_flight = true;
                    Admission::Probe
                } else {
                    let remaining = (cooldown - elapsed)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    Admission::Hold { remaining }
                }
            }
            BreakerPosition::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Hold {
                        remaining: Duration::from_secs(1),
                    }
                } else {
                    self.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Record a successful execution. A half-open probe success closes the
    /// breaker; any success resets the failure run.
    pub fn record_success(&mut self) -> bool {
        let was_half_open = self.position == BreakerPosition::HalfOpen;
        self.position = BreakerPosition::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
        was_half_open
    }

    /// Record a blocking failure at `now`. Returns true if the breaker
    /// opened (or reopened) as a result.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        match self.position {
            BreakerPosition::HalfOpen => {
                // Probe failed: reopen with a fresh cooldown.
                self.position = BreakerPosition::Open;
                self.opened_at = Some(now);
                self.probe_in_flight = false;
                self.consecutive_failures += 1;
                true
            }
            BreakerPosition::Open => {
                self.consecutive_failures += 1;
                false
            }
            BreakerPosition::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.position = BreakerPosition::Open;
                    self.opened_at = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }
}
