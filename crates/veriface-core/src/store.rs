//! Persistent embedding store with backup-before-overwrite and atomic replace.
//!
//! The store is a single JSON blob holding two index-aligned arrays,
//! `embeddings` and `names`. A save first copies the current file into the
//! backup directory as `<stem>_<YYYYMMDD_HHMMSS>.<ext>`, then writes the new
//! blob to a temporary file next to the store and renames it into place, so
//! a concurrent reader sees either the old or the new store, never a partial
//! one.

use crate::types::{Embedding, IdentityRecord, StoreState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const BACKUP_TIMESTAMP_LEN: usize = 15;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("corrupt embedding store {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("embedding {index} ({label}) has non-finite values")]
    NonFinite { index: usize, label: String },
    #[error("failed to serialize embedding store: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// On-disk layout: two flat, index-aligned sequences.
#[derive(Serialize, Deserialize)]
struct PersistedStore {
    embeddings: Vec<Vec<f32>>,
    names: Vec<String>,
}

/// Outcome of a successful [`EmbeddingStore::save`].
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    /// Backup of the previous store, if one existed.
    pub backup: Option<PathBuf>,
    pub records: usize,
}

/// File-backed embedding store.
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    path: PathBuf,
    backup_dir: PathBuf,
    /// Maximum number of backups kept after a save; `None` keeps all of them.
    retention: Option<usize>,
}

impl EmbeddingStore {
    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
            retention: None,
        }
    }

    /// Keep at most `retention` backups. The backup made by the current save
    /// always survives, so `Some(0)` behaves like `Some(1)`.
    pub fn with_retention(mut self, retention: Option<usize>) -> Self {
        self.retention = retention.map(|n| n.max(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Load the persisted state. A missing store file yields an empty state.
    pub fn load(&self) -> Result<StoreState, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no embedding store yet");
                return Ok(StoreState::new());
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let persisted: PersistedStore =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;

        if persisted.embeddings.len() != persisted.names.len() {
            return Err(self.corrupt(format!(
                "{} embeddings but {} names",
                persisted.embeddings.len(),
                persisted.names.len()
            )));
        }

        if let Some(first) = persisted.embeddings.first() {
            let dim = first.len();
            if let Some(pos) = persisted.embeddings.iter().position(|e| e.len() != dim) {
                return Err(self.corrupt(format!(
                    "embedding {pos} has dimension {}, expected {dim}",
                    persisted.embeddings[pos].len()
                )));
            }
        }

        let state: StoreState = persisted
            .names
            .into_iter()
            .zip(persisted.embeddings)
            .map(|(label, values)| IdentityRecord {
                label,
                embedding: Embedding::new(values),
            })
            .collect();

        tracing::info!(
            path = %self.path.display(),
            records = state.len(),
            identities = state.label_counts().len(),
            "loaded embedding store"
        );
        Ok(state)
    }

    /// Load the persisted state, treating a corrupt store as empty.
    pub fn load_or_empty(&self) -> Result<StoreState, StoreError> {
        match self.load() {
            Err(StoreError::Corrupt { path, reason }) => {
                tracing::warn!(
                    path = %path.display(),
                    %reason,
                    "embedding store is corrupt; continuing with an empty store"
                );
                Ok(StoreState::new())
            }
            other => other,
        }
    }

    /// Back up the current store (if any) and atomically replace it with `state`.
    pub fn save(&self, state: &StoreState) -> Result<SaveOutcome, StoreError> {
        // JSON has no NaN/inf; such a blob would not load back.
        if let Some((index, record)) = state
            .records()
            .iter()
            .enumerate()
            .find(|(_, r)| !r.embedding.is_finite())
        {
            return Err(StoreError::NonFinite {
                index,
                label: record.label.clone(),
            });
        }

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| StoreError::io(&parent, e))?;

        let backup = if self.path.exists() {
            Some(self.write_backup()?)
        } else {
            None
        };

        let persisted = PersistedStore {
            embeddings: state
                .records()
                .iter()
                .map(|r| r.embedding.values.clone())
                .collect(),
            names: state.records().iter().map(|r| r.label.clone()).collect(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| StoreError::io(&parent, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &persisted)?;
            writer.flush().map_err(|e| StoreError::io(&self.path, e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(&self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::io(&self.path, e.error))?;

        tracing::info!(
            path = %self.path.display(),
            records = state.len(),
            backup = ?backup,
            "saved embedding store"
        );

        if let Some(keep) = self.retention {
            self.prune_backups(keep);
        }

        Ok(SaveOutcome {
            backup,
            records: state.len(),
        })
    }

    /// Backups of this store, oldest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.backup_dir, e)),
        };

        let (stem, ext) = self.name_parts();
        let prefix = format!("{stem}_");
        let mut keyed = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.backup_dir, e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let rest = match &ext {
                Some(ext) => match rest.strip_suffix(&format!(".{ext}")) {
                    Some(r) => r,
                    None => continue,
                },
                None => rest,
            };
            if let Some(key) = parse_backup_key(rest) {
                keyed.push((key, path));
            }
        }

        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(keyed.into_iter().map(|(_, path)| path).collect())
    }

    fn write_backup(&self) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.backup_dir).map_err(|e| StoreError::io(&self.backup_dir, e))?;

        let (stem, ext) = self.name_parts();
        let timestamp = chrono::Local::now().format(BACKUP_TIMESTAMP_FORMAT).to_string();
        let file_name = |n: u32| {
            let base = if n == 0 {
                format!("{stem}_{timestamp}")
            } else {
                format!("{stem}_{timestamp}_{n}")
            };
            match &ext {
                Some(ext) => format!("{base}.{ext}"),
                None => base,
            }
        };

        // Same-second saves get a numeric suffix so no backup is ever overwritten.
        let mut n = 0;
        let mut backup = self.backup_dir.join(file_name(n));
        while backup.exists() {
            n += 1;
            backup = self.backup_dir.join(file_name(n));
        }

        fs::copy(&self.path, &backup).map_err(|e| StoreError::io(&backup, e))?;
        tracing::info!(
            from = %self.path.display(),
            to = %backup.display(),
            "backed up embedding store"
        );
        Ok(backup)
    }

    fn prune_backups(&self, keep: usize) {
        let backups = match self.backups() {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(error = %err, "could not list backups for pruning");
                return;
            }
        };
        let excess = backups.len().saturating_sub(keep);
        for old in backups.into_iter().take(excess) {
            match fs::remove_file(&old) {
                Ok(()) => tracing::info!(path = %old.display(), "pruned old backup"),
                Err(err) => {
                    tracing::warn!(path = %old.display(), error = %err, "failed to prune backup")
                }
            }
        }
    }

    fn name_parts(&self) -> (String, Option<String>) {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let ext = self
            .path
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        (stem, ext)
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Parse `YYYYMMDD_HHMMSS[_N]` into a sortable key.
fn parse_backup_key(rest: &str) -> Option<(String, u32)> {
    let timestamp = rest.get(..BACKUP_TIMESTAMP_LEN)?;
    chrono::NaiveDateTime::parse_from_str(timestamp, BACKUP_TIMESTAMP_FORMAT).ok()?;
    let suffix = &rest[BACKUP_TIMESTAMP_LEN..];
    let n = if suffix.is_empty() {
        0
    } else {
        suffix.strip_prefix('_')?.parse().ok()?
    };
    Some((timestamp.to_string(), n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state() -> StoreState {
        let mut state = StoreState::new();
        state.push("alice", Embedding::new(vec![0.1, 0.2, 0.3]));
        state.push("bob", Embedding::new(vec![-0.4, 0.5, 0.6]));
        state.push("alice", Embedding::new(vec![0.15, 0.25, 0.35]));
        state
    }

    fn open_temp_store() -> (EmbeddingStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = EmbeddingStore::new(
            dir.path().join("known_faces.json"),
            dir.path().join("model_backups"),
        );
        (store, dir)
    }

    #[test]
    fn test_load_missing_store_is_empty() {
        let (store, _dir) = open_temp_store();
        let state = store.load().unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let (store, _dir) = open_temp_store();
        let state = sample_state();
        let outcome = store.save(&state).unwrap();
        assert!(outcome.backup.is_none());
        assert_eq!(outcome.records, 3);
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn test_each_overwrite_creates_one_backup() {
        let (store, _dir) = open_temp_store();
        store.save(&sample_state()).unwrap();
        assert!(store.backups().unwrap().is_empty());

        let mut previous = 0;
        for _ in 0..3 {
            let outcome = store.save(&sample_state()).unwrap();
            let backups = store.backups().unwrap();
            assert_eq!(backups.len(), previous + 1);
            assert_eq!(backups.last(), outcome.backup.as_ref());
            previous = backups.len();
        }
    }

    #[test]
    fn test_backup_holds_previous_contents() {
        let (store, _dir) = open_temp_store();
        store.save(&sample_state()).unwrap();
        let before = fs::read(store.path()).unwrap();

        let mut next = StoreState::new();
        next.push("carol", Embedding::new(vec![1.0, 1.0, 1.0]));
        let outcome = store.save(&next).unwrap();

        let backup = outcome.backup.unwrap();
        let name = backup.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("known_faces_"));
        assert!(name.ends_with(".json"));
        assert_eq!(fs::read(&backup).unwrap(), before);
        assert_eq!(store.load().unwrap(), next);
    }

    #[test]
    fn test_corrupt_blob_is_reported() {
        let (store, _dir) = open_temp_store();
        fs::write(store.path(), b"{not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));
        assert!(store.load_or_empty().unwrap().is_empty());
    }

    #[test]
    fn test_misaligned_sequences_are_corrupt() {
        let (store, _dir) = open_temp_store();
        fs::write(
            store.path(),
            br#"{"embeddings": [[0.1, 0.2]], "names": ["alice", "bob"]}"#,
        )
        .unwrap();
        match store.load() {
            Err(StoreError::Corrupt { reason, .. }) => assert!(reason.contains("1 embeddings")),
            other => panic!("expected corrupt store, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_dimensions_are_corrupt() {
        let (store, _dir) = open_temp_store();
        fs::write(
            store.path(),
            br#"{"embeddings": [[0.1, 0.2], [0.3]], "names": ["alice", "bob"]}"#,
        )
        .unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_retention_prunes_oldest_backups() {
        let (store, _dir) = open_temp_store();
        let store = store.with_retention(Some(2));
        for _ in 0..5 {
            store.save(&sample_state()).unwrap();
        }
        assert_eq!(store.backups().unwrap().len(), 2);
    }

    #[test]
    fn test_zero_retention_keeps_latest_backup() {
        let (store, _dir) = open_temp_store();
        let store = store.with_retention(Some(0));
        store.save(&sample_state()).unwrap();
        let outcome = store.save(&sample_state()).unwrap();

        let backup = outcome.backup.unwrap();
        assert!(backup.exists());
        assert_eq!(store.backups().unwrap(), vec![backup]);
    }

    #[test]
    fn test_non_finite_embedding_is_rejected_before_backup() {
        let (store, _dir) = open_temp_store();
        store.save(&sample_state()).unwrap();
        let before = fs::read(store.path()).unwrap();

        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let mut state = sample_state();
            state.push("mallory", Embedding::new(vec![bad, 0.5, 0.5]));
            match store.save(&state) {
                Err(StoreError::NonFinite { index, label }) => {
                    assert_eq!(index, 3);
                    assert_eq!(label, "mallory");
                }
                other => panic!("expected non-finite error, got {other:?}"),
            }
        }

        assert_eq!(fs::read(store.path()).unwrap(), before);
        assert!(store.backups().unwrap().is_empty());
        assert_eq!(store.load().unwrap(), sample_state());
    }

    #[test]
    fn test_backups_ignore_unrelated_files() {
        let (store, _dir) = open_temp_store();
        fs::create_dir_all(store.backup_dir()).unwrap();
        fs::write(store.backup_dir().join("known_faces_old.json"), b"{}").unwrap();
        fs::write(store.backup_dir().join("notes.txt"), b"").unwrap();
        fs::write(store.backup_dir().join("known_faces_20240101_120000.json"), b"{}").unwrap();
        let backups = store.backups().unwrap();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn test_parse_backup_key_orders_suffixes_numerically() {
        let mut keys = vec![
            parse_backup_key("20240101_120000_10").unwrap(),
            parse_backup_key("20240101_120000_2").unwrap(),
            parse_backup_key("20240101_120000").unwrap(),
            parse_backup_key("20231231_235959").unwrap(),
        ];
        keys.sort();
        let suffixes: Vec<u32> = keys.iter().map(|k| k.1).collect();
        assert_eq!(suffixes, vec![0, 0, 2, 10]);
        assert_eq!(keys[0].0, "20231231_235959");
        assert!(parse_backup_key("old").is_none());
        assert!(parse_backup_key("20240101_120000x").is_none());
    }
}
