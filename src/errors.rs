//! Typed error hierarchy for the Maestro-Hive kernel.
//!
//! Three top-level enums cover the three subsystems:
//! - `BuildError` — workflow validation failures; the execution never starts
//! - `StorageError` — artifact and checkpoint persistence failures
//! - `EngineError` — scheduling, control-surface and invariant failures

use thiserror::Error;

/// Validation errors raised while building a workflow DAG.
///
/// None of these are recoverable: a workflow that fails validation is
/// rejected before any node is scheduled.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Cycle detected in persona dependencies. Involved personas: {personas:?}")]
    WorkflowCycle { personas: Vec<String> },

    #[error("Persona '{persona}' requires '{dependency}' which is not in the workflow")]
    MissingDependency { persona: String, dependency: String },

    #[error(
        "Persona '{persona}' (phase '{phase}') depends on '{dependency}' in later phase '{dependency_phase}'"
    )]
    CrossPhaseDependency {
        persona: String,
        phase: String,
        dependency: String,
        dependency_phase: String,
    },

    #[error("Duplicate persona '{persona}' in workflow")]
    DuplicatePersona { persona: String },

    #[error("Persona '{persona}' is not present in the catalog")]
    UnknownPersona { persona: String },

    #[error("Persona '{persona}' is assigned to unknown phase '{phase}'")]
    UnknownPhase { persona: String, phase: String },

    #[error("Blueprint '{blueprint}' is not present in the catalog")]
    UnknownBlueprint { blueprint: String },

    #[error("Workflow has no personas")]
    EmptyWorkflow,
}

/// Errors from the artifact and checkpoint stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O failure at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot at {path} failed digest validation")]
    CorruptSnapshot { path: std::path::PathBuf },

    #[error("Snapshot schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("Artifact '{key}' not found for execution '{execution_id}'")]
    ArtifactNotFound { execution_id: String, key: String },

    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode record at {path}: {source}")]
    Decode {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the execution engine and its control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No executor callback configured; refusing to start")]
    MissingExecutor,

    #[error("Unknown execution '{execution_id}'")]
    UnknownExecution { execution_id: String },

    #[error("Execution '{execution_id}' is {status} and accepts no further transitions")]
    Terminal { execution_id: String, status: String },

    #[error("Invalid node transition {from} -> {to} for node '{node_id}'")]
    InvalidTransition {
        node_id: String,
        from: String,
        to: String,
    },

    #[error("Rework of completed phase '{phase_id}' rejected without force_reopen")]
    ReworkRejected { phase_id: String },

    #[error("Unknown phase '{phase_id}' for execution '{execution_id}'")]
    UnknownPhase {
        execution_id: String,
        phase_id: String,
    },

    #[error("Gate '{gate}' is not bypassable")]
    BypassRejected { gate: String },

    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// CLI exit code taxonomy: 1 user/validation, 2 policy, 3 internal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Build(_)
            | Self::MissingExecutor
            | Self::UnknownExecution { .. }
            | Self::UnknownPhase { .. }
            | Self::ReworkRejected { .. }
            | Self::Terminal { .. } => 1,
            Self::BypassRejected { .. } => 2,
            Self::InvalidTransition { .. }
            | Self::InternalConsistency(_)
            | Self::Storage(_)
            | Self::Other(_) => 3,
        }
    }
}
