//! Trusted-identity store: name → encoding, persisted as a JSON file.
//!
//! The file holds two parallel arrays (`encodings`, `names`) in insertion
//! order. Writes go through a temp file in the same directory followed by a
//! rename, so a failed save never leaves a truncated store behind.

use crate::types::{Encoding, IdentityMatch, IdentityRecord};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read identity store {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write identity store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("identity store {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("identity already exists: {0}")]
    DuplicateName(String),
    #[error("refusing to store an invalid encoding for {0}")]
    InvalidEncoding(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    encodings: Vec<Encoding>,
    names: Vec<String>,
}

/// In-memory identity gallery backed by a durable file.
///
/// Reads (`best_match`, `records`) share a read lock; `add`, `remove` and
/// `save` hold the write lock across the durable write.
///
/// Writes merge with the file's current contents, so identities added or
/// removed by another process are kept. Reads use the snapshot taken at the
/// last load or write.
pub struct IdentityStore {
    path: PathBuf,
    records: RwLock<Vec<IdentityRecord>>,
}

impl IdentityStore {
    /// Load the store from `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = read_records(&path)?;
        tracing::info!(path = %path.display(), identities = records.len(), "identity store loaded");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of all records in insertion order.
    pub fn records(&self) -> Vec<IdentityRecord> {
        self.read().clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().iter().any(|r| r.name == name)
    }

    /// Durably overwrite the store file with the current records.
    pub fn save(&self) -> Result<(), StoreError> {
        let records = self.write();
        write_records(&self.path, &records)
    }

    /// Append a record and persist it.
    ///
    /// All-or-nothing: in-memory state only changes once the file write has
    /// succeeded.
    pub fn add(&self, name: &str, encoding: Encoding) -> Result<(), StoreError> {
        self.update(|records| insert(records, name.to_string(), encoding))?;
        tracing::info!(name, "identity added");
        Ok(())
    }

    /// Add a record under a generated `"{prefix}_{unix_ts}"` name, returning it.
    ///
    /// On a name collision a numeric suffix is appended (`_2`, `_3`, ...).
    pub fn add_generated(&self, prefix: &str, encoding: Encoding) -> Result<String, StoreError> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let base = format!("{prefix}_{ts}");
        let name = self.update(|records| {
            let mut name = base.clone();
            let mut n = 2;
            while records.iter().any(|r| r.name == name) {
                name = format!("{base}_{n}");
                n += 1;
            }
            insert(records, name.clone(), encoding)?;
            Ok(name)
        })?;
        tracing::info!(name = %name, "identity added");
        Ok(name)
    }

    /// Remove the record named `name`. Returns `false` if it was not present.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self.update(|records| {
            let Some(idx) = records.iter().position(|r| r.name == name) else {
                return Ok(false);
            };
            records.remove(idx);
            Ok(true)
        })?;
        if removed {
            tracing::info!(name, "identity removed");
        }
        Ok(removed)
    }

    /// Apply `change` to the records currently on disk and persist the result.
    ///
    /// The file may have been rewritten by another process (the CLI next to
    /// the daemon) since this store loaded it. Memory is replaced only after
    /// the write succeeds.
    fn update<T>(
        &self,
        change: impl FnOnce(&mut Vec<IdentityRecord>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut records = self.write();
        let mut next = read_records(&self.path)?;
        let out = change(&mut next)?;
        write_records(&self.path, &next)?;
        *records = next;
        Ok(out)
    }

    /// Find the closest stored identity to `query`.
    ///
    /// Returns the name only if the minimum distance is strictly below
    /// `threshold`. Ties keep the first-inserted record. Records whose
    /// encoding cannot be compared with the query are skipped.
    pub fn best_match(&self, query: &Encoding, threshold: f32) -> Option<IdentityMatch> {
        let records = self.read();
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in records.iter().enumerate() {
            let Some(distance) = record.encoding.distance(query) else {
                tracing::warn!(
                    name = %record.name,
                    stored_dim = record.encoding.len(),
                    query_dim = query.len(),
                    "skipping identity with unusable encoding"
                );
                continue;
            };
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance < threshold => Some(IdentityMatch {
                name: records[idx].name.clone(),
                distance,
            }),
            _ => None,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<IdentityRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<IdentityRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn insert(
    records: &mut Vec<IdentityRecord>,
    name: String,
    encoding: Encoding,
) -> Result<(), StoreError> {
    if !encoding.is_valid() {
        return Err(StoreError::InvalidEncoding(name));
    }
    if records.iter().any(|r| r.name == name) {
        return Err(StoreError::DuplicateName(name));
    }
    records.push(IdentityRecord { name, encoding });
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<IdentityRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let data = fs::read(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let file: StoreFile = serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if file.encodings.len() != file.names.len() {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            message: format!(
                "{} encodings but {} names",
                file.encodings.len(),
                file.names.len()
            ),
        });
    }

    Ok(file
        .names
        .into_iter()
        .zip(file.encodings)
        .map(|(name, encoding)| IdentityRecord { name, encoding })
        .collect())
}

fn write_records(path: &Path, records: &[IdentityRecord]) -> Result<(), StoreError> {
    let write_err = |source: std::io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_err)?;

    let file = StoreFile {
        encodings: records.iter().map(|r| r.encoding.clone()).collect(),
        names: records.iter().map(|r| r.name.clone()).collect(),
    };
    let body = serde_json::to_vec(&file).map_err(|e| write_err(e.into()))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    tmp.write_all(&body).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    tracing::debug!(path = %path.display(), identities = records.len(), "identity store saved");
    Ok(())
}
