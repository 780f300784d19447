use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Remote URL to duration in seconds. `0.0` marks a failed probe.
pub type DurationMap = HashMap<String, f64>;

pub const CACHE_FILE_NAME: &str = "audio_durations.json";

/// Sentinel stored for URLs whose probe produced no value.
pub const FAILED_PROBE_SENTINEL: f64 = 0.0;

/// Persistent URL → duration mapping.
///
/// Several processes may share one store, so `save` merges into whatever is
/// stored instead of overwriting it, and never leaves a half-written mapping
/// behind.
pub trait DurationCacheStore: Send + Sync {
    /// Loads the whole mapping. Never fails: a missing or unreadable store
    /// is an empty mapping.
    fn load(&self) -> DurationMap;

    /// Merges `map` into the stored mapping (see [`merge_durations`]).
    fn save(&self, map: &DurationMap) -> Result<()>;
}

/// Folds `newer` into `base`. Entries in `newer` win, except that a failure
/// sentinel never overwrites a real duration.
pub fn merge_durations(base: &mut DurationMap, newer: &DurationMap) {
    for (url, seconds) in newer {
        match base.get(url) {
            Some(existing)
                if *existing > FAILED_PROBE_SENTINEL
                    && *seconds <= FAILED_PROBE_SENTINEL => {}
            _ => {
                base.insert(url.clone(), *seconds);
            }
        }
    }
}

/// A JSON object on local disk, re-read and rewritten whole under a lock on
/// every save.
#[derive(Debug, Clone)]
pub struct JsonFileCacheStore {
    path: PathBuf,
}

impl JsonFileCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/audio_durations.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(CACHE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                parent.to_path_buf()
            }
            _ => PathBuf::from("."),
        }
    }
}

impl DurationCacheStore for JsonFileCacheStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn load(&self) -> DurationMap {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No duration cache yet");
                return DurationMap::new();
            }
            Err(e) => {
                warn!("Failed to read duration cache: {}", e);
                return DurationMap::new();
            }
        };

        match serde_json::from_str::<DurationMap>(&contents) {
            Ok(map) => {
                debug!("Loaded {} cached durations", map.len());
                map
            }
            Err(e) => {
                warn!("Ignoring corrupt duration cache: {}", e);
                DurationMap::new()
            }
        }
    }

    #[instrument(skip(self, map), fields(path = %self.path.display(), entries = map.len()), err)]
    fn save(&self, map: &DurationMap) -> Result<()> {
        let dir = self.parent_dir();
        std::fs::create_dir_all(&dir).with_context(|| {
            format!("Failed to create cache directory {}", dir.display())
        })?;

        // Advisory lock against other processes saving the same file.
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .context("Failed to open cache lock file")?;
        lock_file
            .lock_exclusive()
            .context("Failed to lock duration cache")?;

        // Keep entries other processes saved since we loaded.
        let mut merged = self.load();
        merge_durations(&mut merged, map);

        let sorted: BTreeMap<&String, &f64> = merged.iter().collect();
        let tmp = tempfile::NamedTempFile::new_in(&dir)
            .context("Failed to create temporary cache file")?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, &sorted)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to replace {}: {}",
                self.path.display(),
                e.error
            )
        })?;

        lock_file.unlock()?;
        debug!("Saved duration cache");
        Ok(())
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    map: Mutex<DurationMap>,
    saves: AtomicUsize,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(map: DurationMap) -> Self {
        Self {
            map: Mutex::new(map),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl DurationCacheStore for MemoryCacheStore {
    fn load(&self) -> DurationMap {
        self.map.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn save(&self, map: &DurationMap) -> Result<()> {
        let mut stored = self
            .map
            .lock()
            .map_err(|_| anyhow::anyhow!("memory cache lock poisoned"))?;
        merge_durations(&mut stored, map);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCacheStore::in_dir(dir.path().join("nested"));

        let mut map = DurationMap::new();
        map.insert("https://a.amazonaws.com/1.webm".to_string(), 45.3);
        map.insert("https://a.amazonaws.com/2.webm".to_string(), 0.0);

        store.save(&map).unwrap();
        assert_eq!(store.load(), map);
        assert!(store.path().exists());
    }

    #[test]
    fn empty_map_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCacheStore::in_dir(dir.path());
        store.save(&DurationMap::new()).unwrap();
        assert_eq!(store.load(), DurationMap::new());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCacheStore::in_dir(dir.path().join("absent"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCacheStore::in_dir(dir.path());
        std::fs::write(store.path(), "{\"https://x\": \"oops\"").unwrap();
        assert!(store.load().is_empty());

        std::fs::write(store.path(), "[1, 2, 3]").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn save_keeps_entries_written_by_another_store() {
        let dir = tempfile::tempdir().unwrap();
        let ours = JsonFileCacheStore::in_dir(dir.path());
        let theirs = JsonFileCacheStore::in_dir(dir.path());

        let mut first = DurationMap::new();
        first.insert("https://a.amazonaws.com/old".to_string(), 1.0);
        theirs.save(&first).unwrap();

        let mut second = DurationMap::new();
        second.insert("https://a.amazonaws.com/new".to_string(), 2.0);
        ours.save(&second).unwrap();

        let mut expected = first.clone();
        expected.insert("https://a.amazonaws.com/new".to_string(), 2.0);
        assert_eq!(ours.load(), expected);
    }

    #[test]
    fn failure_sentinel_does_not_clobber_known_duration() {
        let mut base = DurationMap::new();
        base.insert("known".to_string(), 12.5);
        base.insert("failed".to_string(), 0.0);

        let mut newer = DurationMap::new();
        newer.insert("known".to_string(), 0.0);
        newer.insert("failed".to_string(), 7.0);
        newer.insert("fresh".to_string(), 3.0);
        merge_durations(&mut base, &newer);

        assert_eq!(base["known"], 12.5);
        assert_eq!(base["failed"], 7.0);
        assert_eq!(base["fresh"], 3.0);
    }

    #[test]
    fn memory_store_counts_saves() {
        let store = MemoryCacheStore::new();
        assert!(store.load().is_empty());

        let mut map = DurationMap::new();
        map.insert("u".to_string(), 3.5);
        store.save(&map).unwrap();
        store.save(&map).unwrap();

        assert_eq!(store.load(), map);
        assert_eq!(store.save_count(), 2);
    }
}
