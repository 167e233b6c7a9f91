//! Step-indexed checkpoint store with single-latest retention.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<step>/info.json          index: step, created_at, name -> file
//! <root>/<step>/<name>.<hash>.bin  one blob per saved value
//! ```
//!
//! `info.json` is written last and atomically, so a step directory without
//! it is an uncommitted save and is never restored. After a successful
//! commit every other subdirectory of the root is deleted. A later save of
//! the same step replaces an uncommitted directory, and a successful load
//! removes uncommitted directories above the restored step.

use crate::error::CheckpointError;
use crate::persistence::{atomic_write_json, write_new_synced};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the index file that commits a checkpoint.
pub const INDEX_FILE: &str = "info.json";

/// Error type returned by restore handlers.
pub type RestoreError = Box<dyn std::error::Error + Send + Sync>;

/// What to do with a checkpointed value nobody restores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePolicy {
    /// Fail the load before anything is restored.
    #[default]
    Strict,
    /// Restore what can be restored and warn about the rest.
    SkipUnknown,
}

/// The committed index of one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub step: u64,
    pub created_at: DateTime<Utc>,
    /// Logical value name -> file name inside the step directory.
    pub files: BTreeMap<String, String>,
}

/// Supplies the named blobs to save.
pub trait ValueSource {
    fn snapshot(&self) -> Vec<(String, Vec<u8>)>;
}

/// Receives restored blobs by name.
pub trait ValueSink {
    fn accepts(&self, name: &str) -> bool;
    fn restore(&mut self, name: &str, blob: Vec<u8>) -> Result<(), RestoreError>;
}

impl ValueSource for BTreeMap<String, Vec<u8>> {
    fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl ValueSink for BTreeMap<String, Vec<u8>> {
    fn accepts(&self, _name: &str) -> bool {
        true
    }

    fn restore(&mut self, name: &str, blob: Vec<u8>) -> Result<(), RestoreError> {
        self.insert(name.to_string(), blob);
        Ok(())
    }
}

type Handler<'a> = Box<dyn FnMut(&[u8]) -> Result<(), RestoreError> + 'a>;

/// A [`ValueSink`] built from one closure per value name.
#[derive(Default)]
pub struct RestoreRegistry<'a> {
    handlers: BTreeMap<String, Handler<'a>>,
}

impl<'a> RestoreRegistry<'a> {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn on(
        mut self,
        name: impl Into<String>,
        handler: impl FnMut(&[u8]) -> Result<(), RestoreError> + 'a,
    ) -> Self {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl ValueSink for RestoreRegistry<'_> {
    fn accepts(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    fn restore(&mut self, name: &str, blob: Vec<u8>) -> Result<(), RestoreError> {
        match self.handlers.get_mut(name) {
            Some(handler) => handler(&blob),
            None => Err(format!("no handler for '{name}'").into()),
        }
    }
}

/// Deterministic, collision-free file name for a value name.
///
/// The readable prefix is a sanitized copy of the name; the hash keeps names
/// that sanitize to the same prefix apart.
pub fn blob_file_name(name: &str) -> String {
    let readable: String = name
        .chars()
        .take(48)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Sha256::digest(name.as_bytes());
    let hash = format!("{digest:x}");
    format!("{readable}.{}.bin", &hash[..16])
}

/// Directory-backed checkpoint persistence.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    policy: RestorePolicy,
    restored_step: Option<u64>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            policy: RestorePolicy::default(),
            restored_step: None,
        }
    }

    pub fn with_policy(mut self, policy: RestorePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> RestorePolicy {
        self.policy
    }

    /// Step of the last successful load, if any.
    pub fn restored_step(&self) -> Option<u64> {
        self.restored_step
    }

    pub fn step_dir(&self, step: u64) -> PathBuf {
        self.root.join(step.to_string())
    }

    /// Save `values` as the checkpoint for `step` and delete all others.
    ///
    /// Returns the committed step directory.
    pub fn save<K, V, I>(&self, step: u64, values: I) -> Result<PathBuf, CheckpointError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        std::fs::create_dir_all(&self.root)?;
        let dir = self.step_dir(step);
        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if dir.join(INDEX_FILE).exists() {
                    return Err(CheckpointError::AlreadyExists { step, path: dir });
                }
                // Left behind by a save that never committed.
                tracing::debug!(step, path = %dir.display(), "Replacing uncommitted checkpoint");
                std::fs::remove_dir_all(&dir)?;
                std::fs::create_dir(&dir)?;
            }
            Err(e) => return Err(e.into()),
        }

        let files = match write_step(&dir, step, values) {
            Ok(files) => files,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %cleanup,
                        "Failed to remove partial checkpoint"
                    );
                }
                return Err(e.into());
            }
        };

        tracing::info!(step, files, path = %dir.display(), "Checkpoint saved");
        self.prune(step);
        Ok(dir)
    }

    /// Save the snapshot of a [`ValueSource`].
    pub fn save_source(
        &self,
        step: u64,
        source: &dyn ValueSource,
    ) -> Result<PathBuf, CheckpointError> {
        self.save(step, source.snapshot())
    }

    /// Numerically named step directories, ascending. Empty if the root is missing.
    pub fn steps(&self) -> io::Result<Vec<u64>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut steps = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(step) = name.to_str().and_then(parse_step) {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    pub fn read_index(&self, step: u64) -> Result<CheckpointIndex, CheckpointError> {
        let path = self.step_dir(step).join(INDEX_FILE);
        let content = std::fs::read_to_string(&path)?;
        let corrupt = |message: String| CheckpointError::CorruptIndex {
            path: path.clone(),
            message,
        };
        let index: CheckpointIndex =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
        if index.step != step {
            return Err(corrupt(format!(
                "index is for step {} but lives in directory {step}",
                index.step
            )));
        }
        if let Some(file) = index.files.values().find(|f| !is_plain_file_name(f)) {
            return Err(corrupt(format!("file entry '{file}' is not a plain file name")));
        }
        Ok(index)
    }

    /// The highest committed checkpoint. Uncommitted directories are skipped.
    pub fn latest(&self) -> Result<Option<CheckpointIndex>, CheckpointError> {
        for step in self.steps()?.into_iter().rev() {
            if self.step_dir(step).join(INDEX_FILE).is_file() {
                return self.read_index(step).map(Some);
            }
            tracing::debug!(step, "Skipping uncommitted checkpoint directory");
        }
        Ok(None)
    }

    /// Restore the latest checkpoint into `sink`.
    ///
    /// Returns the restored step, or `None` when there is nothing to restore.
    /// All blobs are read, and under [`RestorePolicy::Strict`] every name is
    /// checked, before the first value is handed to the sink.
    pub fn try_load(&mut self, sink: &mut dyn ValueSink) -> Result<Option<u64>, CheckpointError> {
        let Some(index) = self.latest()? else {
            return Ok(None);
        };
        let dir = self.step_dir(index.step);

        let mut blobs = Vec::with_capacity(index.files.len());
        for (name, file) in &index.files {
            blobs.push((name.as_str(), std::fs::read(dir.join(file))?));
        }

        if self.policy == RestorePolicy::Strict
            && let Some((name, _)) = blobs.iter().find(|(name, _)| !sink.accepts(name))
        {
            return Err(CheckpointError::RestoreMismatch {
                name: name.to_string(),
            });
        }

        for (name, blob) in blobs {
            if !sink.accepts(name) {
                tracing::warn!(name, step = index.step, "No restore handler, skipping value");
                continue;
            }
            sink.restore(name, blob)
                .map_err(|e| CheckpointError::Restore {
                    name: name.to_string(),
                    message: e.to_string(),
                })?;
        }

        self.restored_step = Some(index.step);
        tracing::info!(step = index.step, path = %dir.display(), "Checkpoint restored");
        self.remove_uncommitted_after(index.step);
        Ok(Some(index.step))
    }

    /// Like [`CheckpointStore::try_load`], but reports failure as `false` so
    /// that the caller can fall back to a fresh run.
    pub fn load(&mut self, sink: &mut dyn ValueSink) -> bool {
        match self.try_load(sink) {
            Ok(Some(_)) => true,
            Ok(None) => {
                tracing::debug!(root = %self.root.display(), "No checkpoint to restore");
                false
            }
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "Failed to load checkpoint");
                false
            }
        }
    }

    /// Delete every step directory. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, CheckpointError> {
        let mut removed = 0;
        for step in self.steps()? {
            std::fs::remove_dir_all(self.step_dir(step))?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, root = %self.root.display(), "Checkpoints cleared");
        }
        Ok(removed)
    }

    /// Best-effort removal of every subdirectory of the root except the
    /// directory of `keep`. Plain files in the root are left alone.
    fn prune(&self, keep: u64) {
        let keep = keep.to_string();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list old checkpoints");
                return;
            }
        };
        for entry in entries.flatten() {
            if entry.file_name().to_str() == Some(keep.as_str())
                || !entry.file_type().is_ok_and(|t| t.is_dir())
            {
                continue;
            }
            remove_best_effort(&entry.path());
        }
    }

    /// Best-effort removal of uncommitted step directories above `step`, so
    /// that a resumed run can save those steps again.
    fn remove_uncommitted_after(&self, step: u64) {
        let steps = match self.steps() {
            Ok(steps) => steps,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list checkpoint directories");
                return;
            }
        };
        for later in steps.into_iter().filter(|s| *s > step) {
            let dir = self.step_dir(later);
            if !dir.join(INDEX_FILE).exists() {
                remove_best_effort(&dir);
            }
        }
    }
}

fn remove_best_effort(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => tracing::debug!(path = %dir.display(), "Removed old checkpoint"),
        Err(e) => tracing::warn!(
            path = %dir.display(),
            error = %e,
            "Failed to remove old checkpoint"
        ),
    }
}

fn write_step<K, V, I>(dir: &Path, step: u64, values: I) -> io::Result<usize>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<[u8]>,
{
    let mut files = BTreeMap::new();
    for (name, blob) in values {
        let name = name.as_ref();
        let file = blob_file_name(name);
        if files.contains_key(name) {
            std::fs::remove_file(dir.join(&file))?;
        }
        write_new_synced(&dir.join(&file), blob.as_ref())?;
        files.insert(name.to_string(), file);
    }
    let count = files.len();
    let index = CheckpointIndex {
        step,
        created_at: Utc::now(),
        files,
    };
    atomic_write_json(&dir.join(INDEX_FILE), &index)?;
    Ok(count)
}

/// Only canonical decimal names count as steps (`"7"`, not `"007"`).
fn parse_step(name: &str) -> Option<u64> {
    let step: u64 = name.parse().ok()?;
    (step.to_string() == name).then_some(step)
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && name != INDEX_FILE
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn values(pairs: &[(&str, &str)]) -> Vec<(String, Vec<u8>)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_blob_file_name_is_stable_and_distinct() {
        let a = blob_file_name("layer/1.weight");
        let b = blob_file_name("layer_1_weight");
        assert_eq!(a, blob_file_name("layer/1.weight"));
        assert!(a.starts_with("layer_1_weight."));
        assert!(a.ends_with(".bin"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store
            .save(5, values(&[("w", "\u{0}\u{1}\u{2}"), ("b", "bias")]))
            .unwrap();

        let mut restored: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut store = store;
        assert!(store.load(&mut restored));
        assert_eq!(restored["w"], vec![0, 1, 2]);
        assert_eq!(restored["b"], b"bias".to_vec());
        assert_eq!(store.restored_step(), Some(5));
    }

    #[test]
    fn test_save_existing_step_fails() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(1, values(&[("x", "1")])).unwrap();
        let err = store.save(1, values(&[("x", "2")])).unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyExists { step: 1, .. }));
    }

    #[test]
    fn test_save_replaces_uncommitted_directory_of_same_step() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let partial = dir.path().join("6");
        std::fs::create_dir(&partial).unwrap();
        std::fs::write(partial.join("half.bin"), b"torn").unwrap();

        store.save(6, values(&[("x", "6")])).unwrap();
        assert!(!partial.join("half.bin").exists());
        assert!(partial.join(INDEX_FILE).exists());
    }

    #[test]
    fn test_save_removes_every_sibling_directory() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        std::fs::create_dir(dir.path().join("notes")).unwrap();
        std::fs::create_dir(dir.path().join("007")).unwrap();
        std::fs::write(dir.path().join("README"), b"keep").unwrap();

        store.save(2, values(&[("x", "2")])).unwrap();
        assert!(!dir.path().join("notes").exists());
        assert!(!dir.path().join("007").exists());
        assert!(dir.path().join("README").exists());
        assert_eq!(store.steps().unwrap(), vec![2]);
    }

    #[test]
    fn test_save_keeps_only_latest() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(1, values(&[("x", "1")])).unwrap();
        store.save(2, values(&[("x", "2")])).unwrap();
        assert_eq!(store.steps().unwrap(), vec![2]);
    }

    #[test]
    fn test_load_missing_root_returns_false() {
        let dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(dir.path().join("nope"));
        let mut restored: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        assert!(!store.load(&mut restored));
        assert!(restored.is_empty());
        assert_eq!(store.restored_step(), None);
    }

    #[test]
    fn test_uncommitted_directory_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(3, values(&[("x", "three")])).unwrap();
        std::fs::create_dir(dir.path().join("9")).unwrap();

        let mut store = store;
        let mut restored: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        assert_eq!(store.try_load(&mut restored).unwrap(), Some(3));
        assert_eq!(restored["x"], b"three".to_vec());
    }

    #[test]
    fn test_corrupt_index_is_fatal() {
        let dir = TempDir::new().unwrap();
        let step_dir = dir.path().join("4");
        std::fs::create_dir_all(&step_dir).unwrap();
        std::fs::write(step_dir.join(INDEX_FILE), "{not json").unwrap();

        let mut store = CheckpointStore::new(dir.path());
        let mut restored: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let err = store.try_load(&mut restored).unwrap_err();
        assert!(matches!(err, CheckpointError::CorruptIndex { .. }));
        assert!(!store.load(&mut restored));
        assert!(step_dir.join(INDEX_FILE).exists());
    }

    #[test]
    fn test_index_with_path_traversal_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let step_dir = dir.path().join("2");
        std::fs::create_dir_all(&step_dir).unwrap();
        let index = CheckpointIndex {
            step: 2,
            created_at: Utc::now(),
            files: BTreeMap::from([("x".to_string(), "../secret".to_string())]),
        };
        atomic_write_json(&step_dir.join(INDEX_FILE), &index).unwrap();

        let store = CheckpointStore::new(dir.path());
        assert!(matches!(
            store.read_index(2),
            Err(CheckpointError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_strict_policy_restores_nothing_on_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(dir.path());
        store
            .save(1, values(&[("known", "k"), ("unknown", "u")]))
            .unwrap();

        let mut seen = Vec::new();
        let mut registry = RestoreRegistry::new().on("known", |blob: &[u8]| {
            seen.push(blob.to_vec());
            Ok(())
        });
        let err = store.try_load(&mut registry).unwrap_err();
        drop(registry);
        assert!(matches!(err, CheckpointError::RestoreMismatch { name } if name == "unknown"));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_skip_unknown_policy_restores_known_values() {
        let dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(dir.path()).with_policy(RestorePolicy::SkipUnknown);
        store
            .save(1, values(&[("known", "k"), ("unknown", "u")]))
            .unwrap();

        let mut seen = Vec::new();
        let mut registry = RestoreRegistry::new().on("known", |blob: &[u8]| {
            seen.push(blob.to_vec());
            Ok(())
        });
        assert_eq!(store.try_load(&mut registry).unwrap(), Some(1));
        drop(registry);
        assert_eq!(seen, vec![b"k".to_vec()]);
    }

    #[test]
    fn test_restore_handler_error_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(dir.path());
        store.save(1, values(&[("w", "short")])).unwrap();

        let mut registry =
            RestoreRegistry::new().on("w", |_blob: &[u8]| Err("shape mismatch".into()));
        let err = store.try_load(&mut registry).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_clear_removes_all_steps() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(1, values(&[("x", "1")])).unwrap();
        std::fs::create_dir(dir.path().join("7")).unwrap();
        std::fs::create_dir(dir.path().join("notes")).unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.steps().unwrap().is_empty());
        assert!(dir.path().join("notes").exists());
    }

    #[test]
    fn test_parse_step_requires_canonical_names() {
        assert_eq!(parse_step("12"), Some(12));
        assert_eq!(parse_step("012"), None);
        assert_eq!(parse_step("-1"), None);
        assert_eq!(parse_step("latest"), None);
    }
}
