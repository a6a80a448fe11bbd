//! Persisted scheduler state.
//!
//! Per-plan accumulated activity seconds and holdoff deadlines, stored as
//! JSON:
//!
//! ```json
//! { "activity": { "home": 3600 }, "holdoff": { "home": 1718000000.5 } }
//! ```
//!
//! Activity increments are frequent and cheap to lose, so they are flushed
//! at most once per write interval. Activity resets and holdoffs are written
//! through immediately.

use crate::error::{RebadeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Default minimum time between debounced writes.
pub const DEFAULT_WRITE_INTERVAL_SECS: u64 = 300;

/// On-disk layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StateFile {
    /// Plan name to accumulated activity seconds.
    #[serde(default)]
    activity: BTreeMap<String, u64>,
    /// Plan name to holdoff deadline (seconds since the epoch).
    #[serde(default)]
    holdoff: BTreeMap<String, f64>,
}

/// File-backed activity and holdoff record.
#[derive(Debug)]
pub struct StateStore {
    /// Backing file; `None` keeps state in memory only.
    path: Option<PathBuf>,
    state: StateFile,
    write_interval: Duration,
    /// Time of the oldest unflushed mutation.
    dirty_since: Option<Instant>,
}

impl StateStore {
    /// Load state from `path`.
    ///
    /// A missing or unparsable file yields empty state; this never fails.
    pub fn load(path: impl Into<PathBuf>, write_interval: Duration) -> Self {
        let path = path.into();
        let state = read_state(&path);
        Self {
            path: Some(path),
            state,
            write_interval,
            dirty_since: None,
        }
    }

    /// State that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: StateFile::default(),
            write_interval: Duration::from_secs(DEFAULT_WRITE_INTERVAL_SECS),
            dirty_since: None,
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Accumulated activity of `name`, starting a fresh counter at zero.
    pub fn get_activity(&mut self, name: &str) -> u64 {
        if !self.state.activity.contains_key(name) {
            self.state.activity.insert(name.to_owned(), 0);
            self.mark_dirty();
        }
        self.state.activity[name]
    }

    /// Add `secs` of activity to `name`. Written on the debounce schedule.
    pub fn add_activity(&mut self, name: &str, secs: u64) {
        let counter = self.state.activity.entry(name.to_owned()).or_insert(0);
        *counter = counter.saturating_add(secs);
        self.mark_dirty();
        self.flush_if_due();
    }

    /// Reset the activity of `name` to zero and write through.
    pub fn reset_activity(&mut self, name: &str) -> Result<()> {
        self.state.activity.insert(name.to_owned(), 0);
        self.mark_dirty();
        self.flush()
    }

    /// Holdoff deadline of `name`; `0.0` when none was ever set.
    pub fn get_holdoff(&self, name: &str) -> f64 {
        self.state.holdoff.get(name).copied().unwrap_or(0.0)
    }

    /// Exclude `name` from execution until `until` (seconds since the epoch)
    /// and write through.
    pub fn set_holdoff(&mut self, name: &str, until: f64) -> Result<()> {
        self.state.holdoff.insert(name.to_owned(), until);
        self.mark_dirty();
        self.flush()
    }

    /// Whether there are unflushed mutations.
    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    /// Write pending mutations now.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty_since.is_none() {
            return Ok(());
        }
        if let Some(path) = &self.path {
            write_state(path, &self.state)?;
            debug!("persisted scheduler state to {}", path.display());
        }
        self.dirty_since = None;
        Ok(())
    }

    fn mark_dirty(&mut self) {
        if self.dirty_since.is_none() {
            self.dirty_since = Some(Instant::now());
        }
    }

    fn flush_if_due(&mut self) {
        let Some(since) = self.dirty_since else {
            return;
        };
        if since.elapsed() < self.write_interval {
            return;
        }
        if let Err(e) = self.flush() {
            error!("cannot persist scheduler state: {e}");
        }
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("cannot persist scheduler state on shutdown: {e}");
        }
    }
}

fn read_state(path: &Path) -> StateFile {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StateFile::default(),
        Err(e) => {
            warn!("cannot read state file {}, starting empty: {e}", path.display());
            return StateFile::default();
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(state) => state,
        Err(e) => {
            warn!("ignoring malformed state file {}: {e}", path.display());
            StateFile::default()
        }
    }
}

fn write_state(path: &Path, state: &StateFile) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| RebadeError::State(format!("cannot create state directory: {e}")))?;
    }

    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec(state)
        .map_err(|e| RebadeError::State(format!("cannot serialize state: {e}")))?;
    std::fs::write(&tmp_path, json)
        .map_err(|e| RebadeError::State(format!("cannot write state temp file: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| RebadeError::State(format!("cannot finalize state file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn on_disk(path: &Path) -> StateFile {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::load(dir.path().join("state.json"), Duration::ZERO);
        assert_eq!(store.get_activity("x"), 0);
        assert_eq!(store.get_holdoff("x"), 0.0);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let mut store = StateStore::load(&path, Duration::ZERO);
        assert_eq!(store.get_activity("x"), 0);

        std::fs::write(&path, r#"{"activity": {"x": -5}}"#).unwrap();
        let mut store = StateStore::load(&path, Duration::ZERO);
        assert_eq!(store.get_activity("x"), 0);
    }

    #[test]
    fn activity_increments_are_debounced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = StateStore::load(&path, Duration::from_secs(60));

        store.add_activity("home", 30);
        store.add_activity("home", 30);
        assert!(!path.exists());
        assert!(store.is_dirty());
        assert_eq!(store.get_activity("home"), 60);

        // Pretend the first unflushed change is older than the interval.
        store.dirty_since = Instant::now().checked_sub(Duration::from_secs(61));
        assert!(store.dirty_since.is_some());
        store.add_activity("home", 30);
        assert!(!store.is_dirty());
        assert_eq!(on_disk(&path).activity["home"], 90);
    }

    #[test]
    fn zero_interval_writes_every_increment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = StateStore::load(&path, Duration::ZERO);
        store.add_activity("home", 20);
        assert_eq!(on_disk(&path).activity["home"], 20);
    }

    #[test]
    fn reset_and_holdoff_write_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = StateStore::load(&path, Duration::from_secs(3600));

        store.add_activity("home", 500);
        store.reset_activity("home").unwrap();
        assert_eq!(on_disk(&path).activity["home"], 0);

        store.set_holdoff("home", 1_700_000_000.5).unwrap();
        assert_eq!(on_disk(&path).holdoff["home"], 1_700_000_000.5);
        assert!(!store.is_dirty());
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        {
            let mut store = StateStore::load(&path, Duration::from_secs(3600));
            store.add_activity("home", 120);
            store.set_holdoff("work", 42.0).unwrap();
        }
        let mut store = StateStore::load(&path, Duration::from_secs(3600));
        assert_eq!(store.get_activity("home"), 120);
        assert_eq!(store.get_holdoff("work"), 42.0);
        assert!(!dir.path().join("nested").join("state.tmp").exists());
    }

    #[test]
    fn dropping_flushes_pending_increments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let mut store = StateStore::load(&path, Duration::from_secs(3600));
            store.add_activity("home", 7);
            assert!(!path.exists());
        }
        assert_eq!(on_disk(&path).activity["home"], 7);
    }

    #[test]
    fn in_memory_store_never_touches_disk() {
        let mut store = StateStore::in_memory();
        store.add_activity("home", 10);
        store.reset_activity("home").unwrap();
        assert!(store.path().is_none());
        assert_eq!(store.get_activity("home"), 0);
    }
}
