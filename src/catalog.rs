//! Persona and blueprint catalogs.
//!
//! Personas are data, not subclasses: a `PersonaSpec` carries everything the
//! scheduler needs (dependencies, parallelism, timeout, retries, contracts)
//! plus an opaque executor selector matched by the executor callback. The
//! catalogs are read-only lookups loaded once at startup; catalog mutation is
//! out of scope.

use crate::errors::BuildError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Required and optional artifact names a persona consumes or produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoContract {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

impl IoContract {
    /// Artifact names missing from `produced` against the required set.
    pub fn missing_from<'a>(&'a self, produced: &[String]) -> Vec<&'a str> {
        self.required
            .iter()
            .filter(|name| !produced.iter().any(|p| p == *name))
            .map(String::as_str)
            .collect()
    }
}

/// Per-persona retry backoff tuning. Falls back to engine defaults when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffOverride {
    /// Initial delay in milliseconds.
    pub base_ms: u64,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Upper bound in milliseconds.
    pub max_ms: u64,
}

/// A single persona: an AI-agent role with a declared contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaSpec {
    /// Persona id (e.g., "backend_developer")
    pub persona_id: String,
    /// Phase this persona always runs in
    pub phase_id: String,
    /// Persona ids that must be terminal-good before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether siblings with the same dependency set may run concurrently
    #[serde(default)]
    pub parallel_capable: bool,
    /// Base executor timeout in seconds
    pub timeout_secs: u64,
    /// Retries after the first attempt (attempt_count <= max_retries + 1)
    #[serde(default)]
    pub max_retries: u32,
    /// Inputs resolved from the context store before execution
    #[serde(default)]
    pub inputs: IoContract,
    /// Outputs the executor must produce
    #[serde(default)]
    pub outputs: IoContract,
    /// Opaque selector matched by the executor callback
    pub executor_selector: String,
    /// Optional per-persona backoff override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffOverride>,
}

impl PersonaSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Read-only lookup keyed by persona id.
#[derive(Debug, Clone, Default)]
pub struct PersonaCatalog {
    personas: HashMap<String, PersonaSpec>,
}

impl PersonaCatalog {
    /// Build a catalog, rejecting duplicate persona ids.
    pub fn new(specs: Vec<PersonaSpec>) -> Result<Self, BuildError> {
        let mut personas = HashMap::with_capacity(specs.len());
        for spec in specs {
            if personas.contains_key(&spec.persona_id) {
                return Err(BuildError::DuplicatePersona {
                    persona: spec.persona_id,
                });
            }
            personas.insert(spec.persona_id.clone(), spec);
        }
        Ok(Self { personas })
    }

    /// Load a catalog from a JSON file (a list of persona specs).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read persona catalog: {}", path.display()))?;
        let specs: Vec<PersonaSpec> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse persona catalog: {}", path.display()))?;
        Self::new(specs).map_err(Into::into)
    }

    pub fn get(&self, persona_id: &str) -> Option<&PersonaSpec> {
        self.personas.get(persona_id)
    }

    pub fn contains(&self, persona_id: &str) -> bool {
        self.personas.contains_key(persona_id)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.personas.keys().map(String::as_str)
    }
}

/// Hint for how a blueprint's workflow prefers to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModeHint {
    #[default]
    Balanced,
    MaxParallel,
    Sequential,
}

/// A named persona set with an optional execution-mode hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub blueprint_id: String,
    pub personas: Vec<String>,
    #[serde(default)]
    pub mode_hint: ExecutionModeHint,
}

/// Read-only lookup keyed by blueprint id.
#[derive(Debug, Clone, Default)]
pub struct BlueprintCatalog {
    blueprints: HashMap<String, Blueprint>,
}

impl BlueprintCatalog {
    pub fn new(blueprints: Vec<Blueprint>) -> Self {
        Self {
            blueprints: blueprints
                .into_iter()
                .map(|b| (b.blueprint_id.clone(), b))
                .collect(),
        }
    }

    /// Load a catalog from a JSON file (a list of blueprints).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read blueprint catalog: {}", path.display()))?;
        let blueprints: Vec<Blueprint> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse blueprint catalog: {}", path.display()))?;
        Ok(Self::new(blueprints))
    }

    pub fn get(&self, blueprint_id: &str) -> Option<&Blueprint> {
        self.blueprints.get(blueprint_id)
    }

    /// Resolve a blueprint to its persona set.
    pub fn resolve(&self, blueprint_id: &str) -> Result<&Blueprint, BuildError> {
        self.get(blueprint_id).ok_or_else(|| BuildError::UnknownBlueprint {
            blueprint: blueprint_id.to_string(),
        })
    }
}

/// Per-persona reuse decision, produced externally (similarity services are
/// out of scope; the kernel consumes the prebuilt map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReuseDecision {
    /// Import artifacts from a prior execution instead of running the persona.
    Reuse { source_ref: String },
    /// Run the persona normally.
    Execute,
}

/// The full reuse decision map for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReusePlan {
    #[serde(default)]
    pub decisions: HashMap<String, ReuseDecision>,
}

impl ReusePlan {
    pub fn decision_for(&self, persona_id: &str) -> &ReuseDecision {
        self.decisions
            .get(persona_id)
            .unwrap_or(&ReuseDecision::Execute)
    }

    /// Persona ids marked for reuse, with their source refs.
    pub fn reuse_targets(&self) -> impl Iterator<Item = (&str, &str)> {
        self.decisions.iter().filter_map(|(id, d)| match d {
            ReuseDecision::Reuse { source_ref } => Some((id.as_str(), source_ref.as_str())),
            ReuseDecision::Execute => None,
        })
    }
}
