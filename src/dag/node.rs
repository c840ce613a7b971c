//! Node records and the node state machine.
//!
//! A node is a single scheduled execution of a persona within the workflow
//! DAG. State transitions are validated: the kernel refuses to move a node
//! along an edge the state machine does not declare.

use crate::catalog::{BackoffOverride, IoContract, PersonaSpec};
use crate::errors::EngineError;
use crate::runner::MetricValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Lifecycle state of a node.
///
/// ```text
/// pending → ready → running → completed
///                        ↘→ failed   (retries exhausted or unrecoverable)
///                        ↘→ ready    (recoverable failure, after backoff)
/// pending ──────────────→ reused    (reuse decision before scheduling)
/// pending/ready ────────→ skipped   (a dependency failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Reused,
}

impl NodeState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Reused)
    }

    /// Terminal-good states satisfy dependents.
    pub fn is_terminal_good(&self) -> bool {
        matches!(self, Self::Completed | Self::Reused)
    }

    fn allows(&self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Reused)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Ready)
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Reused => "reused",
        };
        write!(f, "{s}")
    }
}

/// A single scheduled execution of a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub phase_id: String,
    pub persona_id: String,
    /// Node ids that must be terminal-good before this node runs
    pub dependencies: Vec<String>,
    pub parallel_capable: bool,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_retries: u32,
    pub input_contract: IoContract,
    pub output_contract: IoContract,
    pub executor_selector: String,
    /// Wave index within the phase; dispatch prefers lower waves
    pub wave: usize,
    pub state: NodeState,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Metrics reported by the most recent successful attempt
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, MetricValue>,
    /// Per-persona retry backoff override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffOverride>,
}

impl Node {
    /// Seed a node from its persona spec. One node per persona; the node id
    /// is the persona id.
    pub fn from_spec(spec: &PersonaSpec) -> Self {
        Self {
            node_id: spec.persona_id.clone(),
            phase_id: spec.phase_id.clone(),
            persona_id: spec.persona_id.clone(),
            dependencies: Vec::new(),
            parallel_capable: spec.parallel_capable,
            timeout: spec.timeout(),
            max_retries: spec.max_retries,
            input_contract: spec.inputs.clone(),
            output_contract: spec.outputs.clone(),
            executor_selector: spec.executor_selector.clone(),
            wave: 0,
            state: NodeState::Pending,
            attempt_count: 0,
            started_at: None,
            completed_at: None,
            error: None,
            metrics: HashMap::new(),
            backoff: spec.backoff.clone(),
        }
    }

    /// Move the node to `next`, validating the state machine.
    pub fn transition(&mut self, next: NodeState) -> Result<(), EngineError> {
        if !self.state.allows(next) {
            return Err(EngineError::InvalidTransition {
                node_id: self.node_id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Reset for a rework iteration: back to pending with a fresh attempt
    /// budget. Artifacts from prior iterations stay immutable in the store.
    pub fn reset_for_rework(&mut self) {
        self.state = NodeState::Pending;
        self.attempt_count = 0;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.metrics.clear();
    }

    /// Attempts remaining before the node fails terminally.
    pub fn attempts_left(&self) -> u32 {
        (self.max_retries + 1).saturating_sub(self.attempt_count)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
