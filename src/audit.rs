//! Append-only audit log.
//!
//! Gate bypasses, forced rework and phase overrides are recorded as one JSON
//! line each. The log is never rewritten; readers get entries back in append
//! order.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What happened, with enough context to reconstruct the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditAction {
    GateBypass {
        gate: String,
        adr_ref: String,
        phase_id: String,
        iteration: u32,
    },
    ReworkForced {
        phase_id: String,
        force_reopen: bool,
    },
    PhaseOverride {
        phase_id: String,
        reason: String,
    },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub execution_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub action: AuditAction,
}

/// File-backed JSONL audit log.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit directory {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Append one entry and flush it to disk.
    pub fn append(&self, execution_id: &str, action: AuditAction) -> Result<AuditEntry> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            execution_id: execution_id.to_string(),
            at: Utc::now(),
            action,
        };
        let line = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open audit log {}", self.path.display()))?;
        writeln!(file, "{line}").context("Failed to write audit entry")?;
        file.sync_all().context("Failed to sync audit log")?;
        Ok(entry)
    }

    /// All entries in append order. An absent file is an empty log.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read audit log {}", self.path.display())
                });
            }
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("Failed to parse audit entry"))
            .collect()
    }

    /// The most recent `n` entries.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEntry>> {
        let mut all = self.read_all()?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }
}
