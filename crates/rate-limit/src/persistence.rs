//! Snapshot persistence for limiter state.
//!
//! Each limiter owns two flat JSON maps keyed by the identity's string form:
//! one for window state and one for cooldowns. Files are rewritten in full
//! on every flush. In-memory state stays authoritative; a failed read or
//! write is logged and never surfaces to the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};
use turnstile_common::{Identity, PersistenceConfig, TurnstileError, TurnstileResult};

/// Point-in-time copy of one limiter's maps.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<W, C> {
    pub windows: BTreeMap<Identity, W>,
    pub cooldowns: BTreeMap<Identity, C>,
}

impl<W, C> Default for Snapshot<W, C> {
    fn default() -> Self {
        Self {
            windows: BTreeMap::new(),
            cooldowns: BTreeMap::new(),
        }
    }
}

/// The pair of files backing one limiter.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    windows_path: PathBuf,
    cooldowns_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: &Path, windows_file: &str, cooldowns_file: &str) -> Self {
        Self {
            windows_path: dir.join(windows_file),
            cooldowns_path: dir.join(cooldowns_file),
        }
    }

    pub fn windows_path(&self) -> &Path {
        &self.windows_path
    }

    pub fn cooldowns_path(&self) -> &Path {
        &self.cooldowns_path
    }

    /// Read both files. Missing files yield empty maps; unreadable files and
    /// individual bad entries are logged and skipped.
    pub fn load<W: DeserializeOwned, C: DeserializeOwned>(&self) -> Snapshot<W, C> {
        Snapshot {
            windows: load_map(&self.windows_path),
            cooldowns: load_map(&self.cooldowns_path),
        }
    }

    pub fn save<W: Serialize, C: Serialize>(&self, snapshot: &Snapshot<W, C>) -> TurnstileResult<()> {
        write_map(&self.windows_path, &snapshot.windows)?;
        write_map(&self.cooldowns_path, &snapshot.cooldowns)?;
        Ok(())
    }
}

fn load_map<T: DeserializeOwned>(path: &Path) -> BTreeMap<Identity, T> {
    let mut out = BTreeMap::new();

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return out,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read limiter snapshot");
            return out;
        }
    };

    let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&content) {
        Ok(raw) => raw,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to parse limiter snapshot");
            return out;
        }
    };

    for (key, value) in raw {
        let identity = match key.parse::<Identity>() {
            Ok(identity) => identity,
            Err(_) => {
                warn!(path = %path.display(), key = %key, "skipping snapshot entry with invalid identity");
                continue;
            }
        };
        match serde_json::from_value(value) {
            Ok(record) => {
                out.insert(identity, record);
            }
            Err(e) => {
                warn!(path = %path.display(), identity, error = %e, "skipping malformed snapshot entry");
            }
        }
    }

    debug!(path = %path.display(), entries = out.len(), "loaded limiter snapshot");
    out
}

fn write_map<T: Serialize>(path: &Path, map: &BTreeMap<Identity, T>) -> TurnstileResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let keyed: BTreeMap<String, &T> = map.iter().map(|(k, v)| (k.to_string(), v)).collect();
    let json = serde_json::to_string_pretty(&keyed)?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        TurnstileError::Persistence(format!("failed to replace {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Flush policy wrapper around an optional [`SnapshotStore`].
///
/// A zero interval writes through on every mutation. Otherwise mutations
/// only mark the state dirty, and a write happens at most once per interval
/// (inline on the next mutation past the deadline, from the maintenance
/// task, or from an explicit flush at shutdown).
pub struct Persistence {
    store: Option<SnapshotStore>,
    interval: Duration,
    dirty: AtomicBool,
    last_flush: Mutex<Instant>,
    write_lock: Mutex<()>,
}

impl Persistence {
    pub fn new(store: SnapshotStore, flush_interval: Duration) -> Self {
        Self {
            store: Some(store),
            interval: flush_interval,
            dirty: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
            write_lock: Mutex::new(()),
        }
    }

    /// In-memory only.
    pub fn disabled() -> Self {
        Self {
            store: None,
            interval: Duration::ZERO,
            dirty: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
            write_lock: Mutex::new(()),
        }
    }

    /// Build from config using the given file names under `config.dir`.
    pub fn from_config(config: &PersistenceConfig, windows_file: &str, cooldowns_file: &str) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        Self::new(
            SnapshotStore::new(&config.dir, windows_file, cooldowns_file),
            Duration::from_millis(config.flush_interval_ms),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn load<W: DeserializeOwned, C: DeserializeOwned>(&self) -> Snapshot<W, C> {
        match &self.store {
            Some(store) => store.load(),
            None => Snapshot::default(),
        }
    }

    /// Record a mutation. Returns `true` when the caller should flush now.
    pub fn mark_dirty(&self) -> bool {
        if self.store.is_none() {
            return false;
        }
        self.dirty.store(true, Ordering::Release);
        if self.interval.is_zero() {
            return true;
        }
        match self.last_flush.lock() {
            Ok(last) => last.elapsed() >= self.interval,
            Err(_) => true,
        }
    }

    /// Write a snapshot produced by `build`.
    ///
    /// The snapshot is built under the write lock so concurrent flushes can
    /// never land an older copy over a newer one.
    pub fn flush_with<W, C, F>(&self, build: F)
    where
        W: Serialize,
        C: Serialize,
        F: FnOnce() -> Snapshot<W, C>,
    {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        self.dirty.store(false, Ordering::Release);
        let snapshot = build();

        match store.save(&snapshot) {
            Ok(()) => {
                debug!(
                    windows = snapshot.windows.len(),
                    cooldowns = snapshot.cooldowns.len(),
                    "flushed limiter snapshot"
                );
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                error!(
                    path = %store.windows_path().display(),
                    error = %e,
                    "failed to persist limiter snapshot"
                );
            }
        }

        if let Ok(mut last) = self.last_flush.lock() {
            *last = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), "w.json", "c.json");
        let snapshot: Snapshot<Vec<u64>, u64> = store.load();
        assert!(snapshot.windows.is_empty());
        assert!(snapshot.cooldowns.is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(&dir.path().join("nested"), "w.json", "c.json");

        let mut snapshot: Snapshot<Vec<u64>, u64> = Snapshot::default();
        snapshot.windows.insert(42, vec![1, 2, 3]);
        snapshot.cooldowns.insert(-7, 99);
        store.save(&snapshot).unwrap();

        let raw = std::fs::read_to_string(store.windows_path()).unwrap();
        assert!(raw.contains("\"42\""));

        let loaded: Snapshot<Vec<u64>, u64> = store.load();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn bad_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), "w.json", "c.json");
        std::fs::write(
            store.windows_path(),
            r#"{"42": [1, 2], "not-a-number": [3], "7": "garbage"}"#,
        )
        .unwrap();
        std::fs::write(store.cooldowns_path(), "{ this is not json").unwrap();

        let loaded: Snapshot<Vec<u64>, u64> = store.load();
        assert_eq!(loaded.windows.len(), 1);
        assert_eq!(loaded.windows[&42], vec![1, 2]);
        assert!(loaded.cooldowns.is_empty());
    }

    #[test]
    fn write_through_requests_flush_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(
            SnapshotStore::new(dir.path(), "w.json", "c.json"),
            Duration::ZERO,
        );
        assert!(persistence.mark_dirty());
        persistence.flush_with(Snapshot::<u64, u64>::default);
        assert!(!persistence.is_dirty());
        assert!(persistence.mark_dirty());
    }

    #[test]
    fn debounced_defers_until_interval() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(
            SnapshotStore::new(dir.path(), "w.json", "c.json"),
            Duration::from_secs(3600),
        );
        assert!(!persistence.mark_dirty());
        assert!(persistence.is_dirty());

        persistence.flush_with(Snapshot::<u64, u64>::default);
        assert!(!persistence.is_dirty());
        assert!(dir.path().join("w.json").exists());
    }

    #[test]
    fn disabled_never_flushes() {
        let persistence = Persistence::disabled();
        assert!(!persistence.mark_dirty());
        assert!(!persistence.is_dirty());
        let snapshot: Snapshot<u64, u64> = persistence.load();
        assert!(snapshot.windows.is_empty());
    }

    #[test]
    fn debounced_flushes_once_interval_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(
            SnapshotStore::new(dir.path(), "w.json", "c.json"),
            Duration::from_millis(50),
        );

        // Inside the interval: mutations only mark state dirty.
        assert!(!persistence.mark_dirty());
        assert!(!persistence.mark_dirty());

        std::thread::sleep(Duration::from_millis(80));
        assert!(persistence.mark_dirty());

        persistence.flush_with(Snapshot::<u64, u64>::default);
        assert!(!persistence.is_dirty());
        assert!(dir.path().join("w.json").exists());

        // The flush restarts the interval.
        assert!(!persistence.mark_dirty());
        assert!(persistence.is_dirty());
    }
}
