//! Persona-level artifact reuse.
//!
//! Before the scheduler starts, personas marked `Reuse` in the decision map
//! have their prior artifacts fetched from an external source, hash-verified
//! and materialised into this execution's context store; the corresponding
//! node moves straight to `Reused` and satisfies dependents exactly like a
//! completed node. A hash mismatch downgrades the persona to normal
//! execution rather than importing damaged outputs.

use crate::catalog::ReusePlan;
use crate::context::hash_file;
use crate::dag::node::NodeState;
use crate::errors::EngineError;
use crate::events::EventKind;
use crate::runner::{ArtifactPayload, PayloadSource};
use crate::supervisor::ExecutionContext;
use async_trait::async_trait;
use std::path::PathBuf;

/// One artifact offered for reuse, with the hash recorded at its source.
#[derive(Debug, Clone)]
pub struct ReusableArtifact {
    pub name: String,
    pub path: PathBuf,
    pub expected_sha256: String,
    pub labels: Vec<String>,
    pub contract_version: Option<String>,
}

/// External artifact store resolving a `source_ref` into concrete files.
/// Implementations live outside the kernel (a prior execution's store, an
/// artifact registry); the kernel only verifies and imports.
#[async_trait]
pub trait ReuseSource: Send + Sync {
    async fn resolve(&self, source_ref: &str) -> anyhow::Result<Vec<ReusableArtifact>>;
}

/// Applies a reuse decision map to a freshly built DAG.
pub struct ReuseCoordinator;

impl ReuseCoordinator {
    /// For every persona marked for reuse: resolve, verify, materialise,
    /// and mark the node `Reused`. Verification failures downgrade the
    /// persona to execution and emit `reuse_downgraded`.
    pub async fn apply(
        ctx: &ExecutionContext,
        plan: &ReusePlan,
        source: &dyn ReuseSource,
    ) -> Result<(), EngineError> {
        for (persona_id, source_ref) in plan.reuse_targets() {
            let node_idx = {
                let state = ctx.state.lock().await;
                match state.dag.index_of(persona_id) {
                    Some(idx) if state.dag.node(idx).state == NodeState::Pending => Some(idx),
                    _ => None,
                }
            };
            let Some(idx) = node_idx else {
                continue;
            };

            let artifacts = match source.resolve(source_ref).await {
                Ok(artifacts) => artifacts,
                Err(e) => {
                    Self::downgrade(ctx, persona_id, &format!("source resolution failed: {e}"));
                    continue;
                }
            };

            // Verify every hash before importing anything.
            let mut mismatch = None;
            for artifact in &artifacts {
                match hash_file(&artifact.path) {
                    Ok((sha256, _)) if sha256 == artifact.expected_sha256 => {}
                    Ok((sha256, _)) => {
                        mismatch = Some(format!(
                            "artifact '{}' hash {} does not match recorded {}",
                            artifact.name, sha256, artifact.expected_sha256
                        ));
                        break;
                    }
                    Err(e) => {
                        mismatch = Some(format!("artifact '{}' unreadable: {e}", artifact.name));
                        break;
                    }
                }
            }
            if let Some(reason) = mismatch {
                Self::downgrade(ctx, persona_id, &reason);
                continue;
            }

            // Materialise under this execution's canonical paths.
            let (execution_id, phase_id) = {
                let state = ctx.state.lock().await;
                let node = state.dag.node(idx);
                (state.execution.execution_id.clone(), node.phase_id.clone())
            };
            let mut import_failed = false;
            for artifact in &artifacts {
                let payload = ArtifactPayload {
                    name: artifact.name.clone(),
                    source: PayloadSource::File {
                        path: artifact.path.clone(),
                    },
                    labels: artifact.labels.clone(),
                    contract_version: artifact.contract_version.clone(),
                };
                if let Err(e) = ctx
                    .context
                    .put(&execution_id, &phase_id, 0, persona_id, &payload)
                    .await
                {
                    Self::downgrade(ctx, persona_id, &format!("import failed: {e}"));
                    import_failed = true;
                    break;
                }
            }
            if import_failed {
                continue;
            }

            let mut state = ctx.state.lock().await;
            let node = state.dag.node_mut(idx);
            node.transition(NodeState::Reused)?;
            node.completed_at = Some(chrono::Utc::now());
            ctx.events.publish(EventKind::NodeReused {
                node_id: persona_id.to_string(),
                source_ref: source_ref.to_string(),
            });
            state.execution.touch();
            ctx.persist(&state)?;
            tracing::info!(persona_id, source_ref, "persona reused from prior artifacts");
        }
        Ok(())
    }

    fn downgrade(ctx: &ExecutionContext, persona_id: &str, reason: &str) {
        tracing::warn!(persona_id, reason, "reuse downgraded to execution");
        ctx.events.publish(EventKind::ReuseDowngraded {
            persona_id: persona_id.to_string(),
            reason: reason.to_string(),
        });
    }
}
