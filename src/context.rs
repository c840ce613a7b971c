//! Append-only artifact store, one namespace per execution.
//!
//! Every artifact lands at the canonical path
//! `{execution_id}/{iteration}/{node_id}/{name}` under the artifact root,
//! hashed with SHA-256 in streaming fashion and written atomically
//! (temp file + fsync + rename). A `.meta.json` sidecar records the version
//! history; overwriting a path with different content appends a
//! hash-distinct version record and consumers see the most recent one.

use crate::errors::StorageError;
use crate::runner::{ArtifactPayload, PayloadSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

const HASH_CHUNK: usize = 64 * 1024;

/// Immutable metadata for one stored artifact version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub name: String,
    /// `{execution_id}/{iteration}/{node_id}/{name}`
    pub canonical_path: String,
    /// Absolute location on this host
    pub stored_path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub producer_node: String,
    pub phase_id: String,
    pub iteration: u32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_version: Option<String>,
    /// Monotonic per-path version, starting at 1
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

/// Lookup key for `get`.
#[derive(Debug, Clone)]
pub enum ArtifactKey {
    /// Exact canonical path
    Path(String),
    /// Most recent artifact matching (phase, optional producer, label)
    Labeled {
        phase_id: String,
        node_id: Option<String>,
        label: String,
    },
}

/// Filter for `list`. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub phase_id: Option<String>,
    pub node_id: Option<String>,
    pub label: Option<String>,
    pub iteration: Option<u32>,
}

impl ArtifactFilter {
    fn matches(&self, meta: &ArtifactMeta) -> bool {
        self.phase_id.as_ref().is_none_or(|p| *p == meta.phase_id)
            && self.node_id.as_ref().is_none_or(|n| *n == meta.producer_node)
            && self.label.as_ref().is_none_or(|l| meta.labels.contains(l))
            && self.iteration.is_none_or(|i| i == meta.iteration)
    }
}

type VersionIndex = HashMap<String, Vec<ArtifactMeta>>;

/// Disk-backed artifact store with an in-memory index.
pub struct ContextStore {
    root: PathBuf,
    /// execution_id -> canonical_path -> version history (oldest first)
    index: Mutex<HashMap<String, VersionIndex>>,
    /// Serialises concurrent writes to the same canonical path
    path_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContextStore {
    /// Open the store, rebuilding the index from metadata sidecars on disk.
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        let store = Self {
            root: root.to_path_buf(),
            index: Mutex::new(HashMap::new()),
            path_locks: Mutex::new(HashMap::new()),
        };
        store.rescan()?;
        Ok(store)
    }

    /// Rebuild the in-memory index from `.meta.json` sidecars.
    fn rescan(&self) -> Result<(), StorageError> {
        let mut index = self.index.lock().expect("context index lock poisoned");
        index.clear();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json")
                || !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".meta.json"))
            {
                continue;
            }
            let content = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
            let versions: Vec<ArtifactMeta> =
                serde_json::from_str(&content).map_err(|e| StorageError::Decode {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            if let Some(latest) = versions.last() {
                let execution_id = latest
                    .canonical_path
                    .split('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                index
                    .entry(execution_id)
                    .or_default()
                    .insert(latest.canonical_path.clone(), versions);
            }
        }
        Ok(())
    }

    fn lock_for(&self, canonical: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.path_locks
            .lock()
            .expect("path lock table poisoned")
            .entry(canonical.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Store one artifact. The write is durable before this returns.
    pub async fn put(
        &self,
        execution_id: &str,
        phase_id: &str,
        iteration: u32,
        node_id: &str,
        payload: &ArtifactPayload,
    ) -> Result<ArtifactMeta, StorageError> {
        let canonical = format!("{execution_id}/{iteration}/{node_id}/{}", payload.name);
        let path_lock = self.lock_for(&canonical);
        let _guard = path_lock.lock().await;

        let dest = self.root.join(&canonical);
        let dir = dest.parent().expect("artifact path has a parent");
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let tmp = dir.join(format!(
            ".{}.tmp-{}",
            payload.name,
            uuid::Uuid::new_v4().simple()
        ));
        let (sha256, size) = match &payload.source {
            PayloadSource::Inline { content } => {
                write_hashed(&tmp, content.as_bytes())?
            }
            PayloadSource::File { path } => copy_hashed(path, &tmp)?,
        };

        // Idempotent overwrite: identical content keeps the current record.
        if let Some(existing) = self.latest(execution_id, &canonical)
            && existing.sha256 == sha256
        {
            let _ = fs::remove_file(&tmp);
            return Ok(existing);
        }

        fs::rename(&tmp, &dest).map_err(|e| io_err(&dest, e))?;
        sync_dir(dir)?;

        let version = self
            .latest(execution_id, &canonical)
            .map_or(1, |m| m.version + 1);
        let meta = ArtifactMeta {
            name: payload.name.clone(),
            canonical_path: canonical.clone(),
            stored_path: dest,
            sha256,
            size,
            producer_node: node_id.to_string(),
            phase_id: phase_id.to_string(),
            iteration,
            labels: payload.labels.clone(),
            contract_version: payload.contract_version.clone(),
            version,
            created_at: Utc::now(),
        };

        self.append_version(execution_id, meta.clone())?;
        Ok(meta)
    }

    fn append_version(&self, execution_id: &str, meta: ArtifactMeta) -> Result<(), StorageError> {
        let sidecar = self
            .root
            .join(format!("{}.meta.json", meta.canonical_path));
        let mut index = self.index.lock().expect("context index lock poisoned");
        let versions = index
            .entry(execution_id.to_string())
            .or_default()
            .entry(meta.canonical_path.clone())
            .or_default();
        versions.push(meta);

        let encoded =
            serde_json::to_vec_pretty(&versions).map_err(StorageError::Encode)?;
        let tmp = sidecar.with_extension("json.tmp");
        fs::write(&tmp, &encoded).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &sidecar).map_err(|e| io_err(&sidecar, e))?;
        Ok(())
    }

    fn latest(&self, execution_id: &str, canonical: &str) -> Option<ArtifactMeta> {
        self.index
            .lock()
            .expect("context index lock poisoned")
            .get(execution_id)?
            .get(canonical)?
            .last()
            .cloned()
    }

    /// Fetch the most recent version for a key.
    pub fn get(&self, execution_id: &str, key: &ArtifactKey) -> Result<ArtifactMeta, StorageError> {
        let found = match key {
            ArtifactKey::Path(canonical) => self.latest(execution_id, canonical),
            ArtifactKey::Labeled {
                phase_id,
                node_id,
                label,
            } => {
                let filter = ArtifactFilter {
                    phase_id: Some(phase_id.clone()),
                    node_id: node_id.clone(),
                    label: Some(label.clone()),
                    iteration: None,
                };
                self.list(execution_id, &filter)
                    .into_iter()
                    .max_by_key(|m| m.created_at)
            }
        };
        found.ok_or_else(|| StorageError::ArtifactNotFound {
            execution_id: execution_id.to_string(),
            key: match key {
                ArtifactKey::Path(p) => p.clone(),
                ArtifactKey::Labeled { label, .. } => label.clone(),
            },
        })
    }

    /// Most recent versions matching the filter, in canonical-path order.
    pub fn list(&self, execution_id: &str, filter: &ArtifactFilter) -> Vec<ArtifactMeta> {
        let index = self.index.lock().expect("context index lock poisoned");
        let Some(paths) = index.get(execution_id) else {
            return Vec::new();
        };
        let mut out: Vec<ArtifactMeta> = paths
            .values()
            .filter_map(|versions| versions.last())
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.canonical_path.cmp(&b.canonical_path));
        out
    }

    /// Most recent artifacts produced by the given nodes, across iterations.
    pub fn produced_by(&self, execution_id: &str, node_ids: &[String]) -> Vec<ArtifactMeta> {
        node_ids
            .iter()
            .flat_map(|node_id| {
                self.list(
                    execution_id,
                    &ArtifactFilter {
                        node_id: Some(node_id.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    /// Recompute the stored file's hash and compare against the record.
    pub fn verify(&self, meta: &ArtifactMeta) -> Result<bool, StorageError> {
        let (sha256, size) = hash_file(&meta.stored_path)?;
        Ok(sha256 == meta.sha256 && size == meta.size)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(|e| io_err(dir, e))
}

fn write_hashed(dest: &Path, bytes: &[u8]) -> Result<(String, u64), StorageError> {
    let mut hasher = Sha256::new();
    let mut file = File::create(dest).map_err(|e| io_err(dest, e))?;
    for chunk in bytes.chunks(HASH_CHUNK) {
        hasher.update(chunk);
        file.write_all(chunk).map_err(|e| io_err(dest, e))?;
    }
    file.sync_all().map_err(|e| io_err(dest, e))?;
    Ok((hex::encode(hasher.finalize()), bytes.len() as u64))
}

fn copy_hashed(src: &Path, dest: &Path) -> Result<(String, u64), StorageError> {
    let mut reader = File::open(src).map_err(|e| io_err(src, e))?;
    let mut file = File::create(dest).map_err(|e| io_err(dest, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(|e| io_err(src, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).map_err(|e| io_err(dest, e))?;
        size += n as u64;
    }
    file.sync_all().map_err(|e| io_err(dest, e))?;
    Ok((hex::encode(hasher.finalize()), size))
}

pub(crate) fn hash_file(path: &Path) -> Result<(String, u64), StorageError> {
    let mut reader = File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}
