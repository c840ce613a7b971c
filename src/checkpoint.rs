//! Durable execution snapshots.
//!
//! One directory per execution under the checkpoint root:
//!
//! ```text
//! {root}/{execution_id}/
//!   checkpoint.json        # latest snapshot + sha256 footer
//!   checkpoint.prev.json   # rotated previous snapshot
//!   events.log             # append-only event mirror (optional)
//! ```
//!
//! `save` writes to a temp file, fsyncs, rotates the previous snapshot and
//! renames into place, so a torn write can never replace a valid snapshot.
//! `load` validates the embedded SHA-256 over the payload and falls back to
//! the rotated snapshot when the latest one is damaged.

use crate::breaker::{CircuitBreaker, FailureReport};
use crate::dag::node::Node;
use crate::errors::StorageError;
use crate::phase::PhaseRecord;
use crate::supervisor::ExecutionRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;

const CHECKPOINT: &str = "checkpoint.json";
const CHECKPOINT_PREV: &str = "checkpoint.prev.json";
const DIGEST_FIELD: &str = "sha256";

/// Everything needed to reconstruct an execution's logical state: node
/// states and attempts, phase iterations, breaker timers and the event
/// cursor. A restart never re-executes a node recorded as completed or
/// reused here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub execution: ExecutionRecord,
    pub phases: Vec<PhaseRecord>,
    pub nodes: Vec<Node>,
    pub breakers: Vec<CircuitBreaker>,
    pub event_cursor: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureReport>,
    /// Gate names with a recorded bypass for this execution
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypassed_gates: Vec<String>,
}

/// Durable key-value store over execution snapshots.
pub struct CheckpointStore {
    root: PathBuf,
    io_retries: u32,
}

impl CheckpointStore {
    pub fn open(root: &Path, io_retries: u32) -> Result<Self, StorageError> {
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        Ok(Self {
            root: root.to_path_buf(),
            io_retries: io_retries.max(1),
        })
    }

    pub fn execution_dir(&self, execution_id: &str) -> PathBuf {
        self.root.join(execution_id)
    }

    /// Location of the optional JSONL event mirror for an execution.
    pub fn events_log_path(&self, execution_id: &str) -> PathBuf {
        self.execution_dir(execution_id).join("events.log")
    }

    /// Persist a snapshot atomically, rotating the previous one.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut last_err = None;
        for attempt in 0..self.io_retries {
            match self.try_save(snapshot) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        execution_id = %snapshot.execution.execution_id,
                        attempt,
                        error = %e,
                        "checkpoint save attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("io_retries >= 1"))
    }

    fn try_save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let dir = self.execution_dir(&snapshot.execution.execution_id);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let dest = dir.join(CHECKPOINT);
        let prev = dir.join(CHECKPOINT_PREV);
        let tmp = dir.join(format!(".{CHECKPOINT}.tmp"));

        let encoded = encode_with_digest(snapshot)?;
        {
            let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
            use std::io::Write;
            file.write_all(&encoded).map_err(|e| io_err(&tmp, e))?;
            file.sync_all().map_err(|e| io_err(&tmp, e))?;
        }

        // Rotate only once the replacement is fully on disk.
        if dest.exists() {
            fs::rename(&dest, &prev).map_err(|e| io_err(&prev, e))?;
        }
        fs::rename(&tmp, &dest).map_err(|e| io_err(&dest, e))?;
        File::open(&dir)
            .and_then(|f| f.sync_all())
            .map_err(|e| io_err(&dir, e))?;
        Ok(())
    }

    /// Load the most recent valid snapshot, if any.
    pub fn load(&self, execution_id: &str) -> Result<Option<Snapshot>, StorageError> {
        let dir = self.execution_dir(execution_id);
        let dest = dir.join(CHECKPOINT);
        let prev = dir.join(CHECKPOINT_PREV);

        let dest_err = match read_validated(&dest) {
            Ok(Some(snapshot)) => return Ok(Some(snapshot)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    execution_id,
                    error = %e,
                    "latest checkpoint invalid, trying rotated snapshot"
                );
                Some(e)
            }
        };

        match read_validated(&prev) {
            Ok(Some(snapshot)) => Ok(Some(snapshot)),
            // No fallback: surface the latest file's failure, if any.
            Ok(None) => match dest_err {
                Some(e) => Err(e),
                None => Ok(None),
            },
            Err(_) => Err(StorageError::CorruptSnapshot { path: dest }),
        }
    }

    /// Execution ids with a checkpoint under the root.
    pub fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))? {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            if entry.path().join(CHECKPOINT).exists()
                && let Some(name) = entry.file_name().to_str()
            {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Remove an execution's checkpoint directory entirely.
    pub fn delete(&self, execution_id: &str) -> Result<(), StorageError> {
        let dir = self.execution_dir(execution_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(())
    }
}

/// Serialise with a `sha256` footer over the canonicalised payload.
fn encode_with_digest(snapshot: &Snapshot) -> Result<Vec<u8>, StorageError> {
    // Canonicalise through Value so save and load digest identical bytes.
    let value = serde_json::to_value(snapshot).map_err(StorageError::Encode)?;
    let payload = serde_json::to_vec(&value).map_err(StorageError::Encode)?;
    let digest = hex::encode(Sha256::digest(&payload));

    let mut envelope = match value {
        serde_json::Value::Object(map) => map,
        _ => unreachable!("snapshot serialises to an object"),
    };
    envelope.insert(DIGEST_FIELD.into(), serde_json::Value::String(digest));
    serde_json::to_vec_pretty(&serde_json::Value::Object(envelope)).map_err(StorageError::Encode)
}

/// Read and validate one snapshot file. `Ok(None)` when absent.
fn read_validated(path: &Path) -> Result<Option<Snapshot>, StorageError> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };

    let mut value: serde_json::Value =
        serde_json::from_slice(&content).map_err(|e| StorageError::Decode {
            path: path.to_path_buf(),
            source: e,
        })?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| StorageError::CorruptSnapshot {
            path: path.to_path_buf(),
        })?;
    let recorded = map
        .remove(DIGEST_FIELD)
        .and_then(|v| v.as_str().map(String::from))
        .ok_or_else(|| StorageError::CorruptSnapshot {
            path: path.to_path_buf(),
        })?;

    let payload = serde_json::to_vec(&value).map_err(StorageError::Encode)?;
    let digest = hex::encode(Sha256::digest(&payload));
    if digest != recorded {
        return Err(StorageError::CorruptSnapshot {
            path: path.to_path_buf(),
        });
    }

    let snapshot: Snapshot =
        serde_json::from_value(value).map_err(|e| StorageError::Decode {
            path: path.to_path_buf(),
            source: e,
        })?;
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(StorageError::SchemaVersion {
            found: snapshot.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(Some(snapshot))
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ExecutionStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn snapshot(execution_id: &str) -> Snapshot {
        Snapshot {
            schema_version: SCHEMA_VERSION,
            execution: ExecutionRecord {
                execution_id: execution_id.to_string(),
                requirement: "Build a REST API".into(),
                blueprint_id: None,
                status: ExecutionStatus::Running,
                current_phase: Some("implementation".into()),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            phases: Vec::new(),
            nodes: Vec::new(),
            breakers: Vec::new(),
            event_cursor: 17,
            last_failure: None,
            bypassed_gates: Vec::new(),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path(), 3).unwrap();

        let snap = snapshot("exec-1");
        store.save(&snap).unwrap();
        let loaded = store.load("exec-1").unwrap().unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path(), 3).unwrap();
        assert!(store.load("ghost").unwrap().is_none());
    }

    #[test]
    fn test_rotation_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path(), 3).unwrap();

        let mut snap = snapshot("exec-1");
        store.save(&snap).unwrap();
        snap.event_cursor = 42;
        store.save(&snap).unwrap();

        let prev = store.execution_dir("exec-1").join(CHECKPOINT_PREV);
        assert!(prev.exists());
        let loaded = store.load("exec-1").unwrap().unwrap();
        assert_eq!(loaded.event_cursor, 42);
    }

    #[test]
    fn test_corrupt_latest_falls_back_to_rotated() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path(), 3).unwrap();

        let mut snap = snapshot("exec-1");
        store.save(&snap).unwrap();
        snap.event_cursor = 99;
        store.save(&snap).unwrap();

        // Truncate the latest file mid-write.
        let dest = store.execution_dir("exec-1").join(CHECKPOINT);
        let content = fs::read(&dest).unwrap();
        fs::write(&dest, &content[..content.len() / 2]).unwrap();

        let loaded = store.load("exec-1").unwrap().unwrap();
        // The rotated snapshot (cursor 17) survives.
        assert_eq!(loaded.event_cursor, 17);
    }

    #[test]
    fn test_tampered_payload_fails_digest() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path(), 3).unwrap();
        store.save(&snapshot("exec-1")).unwrap();

        let dest = store.execution_dir("exec-1").join(CHECKPOINT);
        let content = fs::read_to_string(&dest).unwrap();
        let tampered = content.replace("\"event_cursor\": 17", "\"event_cursor\": 999");
        fs::write(&dest, tampered).unwrap();

        // No rotated snapshot exists, so the corruption surfaces.
        assert!(matches!(
            store.load("exec-1"),
            Err(StorageError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path(), 3).unwrap();
        store.save(&snapshot("exec-b")).unwrap();
        store.save(&snapshot("exec-a")).unwrap();

        assert_eq!(store.list().unwrap(), vec!["exec-a", "exec-b"]);
        store.delete("exec-a").unwrap();
        assert_eq!(store.list().unwrap(), vec!["exec-b"]);
    }

    #[test]
    fn test_unsupported_schema_version_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path(), 3).unwrap();
        let mut snap = snapshot("exec-1");
        snap.schema_version = 99;
        store.save(&snap).unwrap();

        // Digest is valid but the schema version is not ours; with no
        // rotated fallback this reports corruption at the latest path.
        assert!(store.load("exec-1").is_err());
    }
}
