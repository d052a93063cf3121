//! Durable per-source collector state.
//!
//! One state file per `(source, owner)` pair under the configured cache
//! directory, serialized as JSON. Writes go through a temp file and an
//! atomic rename; a missing or corrupt file degrades to the default
//! state with a warning, so a collector can always start.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use super::{CollectorError, Result};

/// Loads and saves one collector's durable state.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// State file path: `cache_dir/<source>.<owner>.state`.
    pub fn new(cache_dir: &Path, source: &str, owner: &str) -> Self {
        Self {
            path: cache_dir.join(format!("{}.{}.state", source, owner)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last saved state, or `None` on first run / unreadable file.
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                info!(path = %self.path.display(), reason = %e, "no saved state, starting fresh");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "could not parse saved state, falling back to default"
                );
                None
            }
        }
    }

    /// Last saved state, or the provided default.
    pub fn load_or_else<T: DeserializeOwned>(&self, default: impl FnOnce() -> T) -> T {
        self.load().unwrap_or_else(default)
    }

    /// Atomically persist `state` (temp file + rename).
    pub fn save<T: Serialize>(&self, state: &T) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| CollectorError::State("state path has no parent".to_string()))?;
        create_private_dir(dir)?;

        let serialized = serde_json::to_vec(state)
            .map_err(|e| CollectorError::State(format!("cannot serialize state: {}", e)))?;

        let tmp_path = self.path.with_extension("state.tmp");
        fs::write(&tmp_path, &serialized)?;
        fs::rename(&tmp_path, &self.path)?;
        info!(path = %self.path.display(), "saved state");
        Ok(())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if !dir.is_dir() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct SampleState {
        newest_row_time: String,
        newest_rows: BTreeSet<String>,
        rows_count: u64,
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "testsource.testchannel", "SampleCollector");
        let state = SampleState {
            newest_row_time: "2019-07-13".to_string(),
            newest_rows: BTreeSet::from(["\"ham\",\"2019-07-13\"".to_string()]),
            rows_count: 7,
        };
        store.save(&state).unwrap();
        let loaded: SampleState = store.load().unwrap();
        assert_eq!(loaded, state);
        assert!(store
            .path()
            .to_string_lossy()
            .ends_with("testsource.testchannel.SampleCollector.state"));
    }

    #[test]
    fn test_missing_and_corrupt_files_fall_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "s.c", "X");
        assert!(store.load::<SampleState>().is_none());

        fs::write(store.path(), b"{not json").unwrap();
        assert!(store.load::<SampleState>().is_none());
        let fallback = store.load_or_else(|| SampleState {
            newest_row_time: String::new(),
            newest_rows: BTreeSet::new(),
            rows_count: 0,
        });
        assert_eq!(fallback.rows_count, 0);
    }

    #[test]
    fn test_save_creates_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("cache");
        let store = StateStore::new(&nested, "s.c", "X");
        store
            .save(&SampleState {
                newest_row_time: "t".into(),
                newest_rows: BTreeSet::new(),
                rows_count: 1,
            })
            .unwrap();
        assert!(store.path().is_file());
    }
}
