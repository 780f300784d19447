use crate::duration_cache::{
    DurationCacheStore, DurationMap, FAILED_PROBE_SENTINEL,
};
use crate::probe::{MediaProber, ProbeError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

pub const DEFAULT_MAX_WORKERS: usize = 20;
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Probes every URL with at most `max_workers` probes in flight.
///
/// `result[i]` belongs to `urls[i]` whatever order the probes finish in.
/// Per-URL failures come back as `None`; only a missing probe tool aborts
/// the batch.
#[instrument(skip(prober, urls), fields(urls = urls.len()), err)]
pub async fn probe_many(
    prober: Arc<dyn MediaProber>,
    urls: &[String],
    max_workers: usize,
) -> Result<Vec<Option<f64>>, ProbeError> {
    let mut results: Vec<Option<f64>> = vec![None; urls.len()];
    if urls.is_empty() {
        return Ok(results);
    }

    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut tasks = JoinSet::new();

    for (index, url) in urls.iter().enumerate() {
        let prober = prober.clone();
        let semaphore = semaphore.clone();
        let url = url.clone();
        tasks.spawn(async move {
            // The semaphore is never closed, so acquire only fails if it is.
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (index, Ok(None)),
            };
            (index, prober.probe(&url).await)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(duration))) => results[index] = duration,
            Ok((_, Err(e))) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(e) => {
                // The slot stays None.
                error!("Probe task failed: {}", e);
            }
        }
    }

    Ok(results)
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub max_workers: usize,
    pub batch_size: usize,
    /// Treat cached failure sentinels as misses and probe them again.
    pub retry_failed: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            retry_failed: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveSummary {
    /// Distinct URLs asked for.
    pub requested: usize,
    /// Already cached, not probed.
    pub cached: usize,
    pub probed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub batches: usize,
}

/// Cache-aware front end of [`probe_many`].
///
/// Holds the in-memory duration map loaded from the store, probes misses in
/// fixed-size batches and persists the map after every batch so an
/// interrupted run loses at most one batch of work.
pub struct DurationResolver {
    prober: Arc<dyn MediaProber>,
    store: Arc<dyn DurationCacheStore>,
    cache: RwLock<DurationMap>,
    // Single writer for the store within this process.
    resolve_lock: Mutex<()>,
    config: ResolverConfig,
}

impl DurationResolver {
    pub fn new(
        prober: Arc<dyn MediaProber>,
        store: Arc<dyn DurationCacheStore>,
        config: ResolverConfig,
    ) -> Self {
        let cache = store.load();
        info!("Duration cache holds {} entries", cache.len());
        Self {
            prober,
            store,
            cache: RwLock::new(cache),
            resolve_lock: Mutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn prober(&self) -> Arc<dyn MediaProber> {
        self.prober.clone()
    }

    /// Cached seconds for `url`, including the failure sentinel.
    pub async fn cached(&self, url: &str) -> Option<f64> {
        self.cache.read().await.get(url).copied()
    }

    pub async fn snapshot(&self) -> DurationMap {
        self.cache.read().await.clone()
    }

    fn is_miss(&self, cache: &DurationMap, url: &str) -> bool {
        match cache.get(url) {
            None => true,
            Some(seconds) => {
                self.config.retry_failed && *seconds <= FAILED_PROBE_SENTINEL
            }
        }
    }

    /// Makes sure every URL has a cache entry, probing the ones that don't.
    #[instrument(skip(self, urls), fields(urls = urls.len()), err)]
    pub async fn resolve(
        &self,
        urls: &[String],
    ) -> Result<ResolveSummary, ProbeError> {
        let _guard = self.resolve_lock.lock().await;

        let mut seen = HashSet::new();
        let mut unique: Vec<&str> = Vec::new();
        for url in urls {
            let url = url.as_str();
            if !url.trim().is_empty() && seen.insert(url) {
                unique.push(url);
            }
        }

        let misses: Vec<String> = {
            let cache = self.cache.read().await;
            unique
                .iter()
                .filter(|url| self.is_miss(&cache, url))
                .map(|url| url.to_string())
                .collect()
        };

        let mut summary = ResolveSummary {
            requested: unique.len(),
            cached: unique.len() - misses.len(),
            ..Default::default()
        };
        if misses.is_empty() {
            return Ok(summary);
        }

        let batch_size = self.config.batch_size.max(1);
        let total_batches = misses.len().div_ceil(batch_size);
        info!(
            "Probing {} uncached URLs in {} batches",
            misses.len(),
            total_batches
        );

        for (batch_index, batch) in misses.chunks(batch_size).enumerate() {
            let durations =
                probe_many(self.prober.clone(), batch, self.config.max_workers)
                    .await?;

            let snapshot = {
                let mut cache = self.cache.write().await;
                for (url, duration) in batch.iter().zip(durations) {
                    summary.probed += 1;
                    match duration {
                        Some(seconds) => {
                            summary.succeeded += 1;
                            cache.insert(url.clone(), seconds);
                        }
                        None => {
                            summary.failed += 1;
                            cache.insert(url.clone(), FAILED_PROBE_SENTINEL);
                        }
                    }
                }
                cache.clone()
            };
            summary.batches += 1;

            // The file store blocks on a cross-process lock.
            // A failed save is retried implicitly by the next batch's save.
            let store = self.store.clone();
            match tokio::task::spawn_blocking(move || store.save(&snapshot))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Failed to persist duration cache: {:#}", e)
                }
                Err(e) => warn!("Duration cache save task failed: {}", e),
            }

            info!(
                "Batch {}/{}: probed {} ({} ok, {} failed so far)",
                batch_index + 1,
                total_batches,
                summary.probed,
                summary.succeeded,
                summary.failed
            );
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration_cache::{JsonFileCacheStore, MemoryCacheStore};
    use crate::probe::fake::FakeProber;
    use fs2::FileExt;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    fn url(n: usize) -> String {
        format!("https://bucket.s3.amazonaws.com/rec-{}.webm", n)
    }

    #[tokio::test]
    async fn results_follow_input_order_not_completion_order() {
        let urls: Vec<String> = (0..6).map(url).collect();
        let mut prober = FakeProber::new();
        for (i, u) in urls.iter().enumerate() {
            // Later URLs finish first.
            prober = prober
                .with_duration(u, (i + 1) as f64 * 10.0)
                .with_delay(u, Duration::from_millis(((6 - i) * 25) as u64));
        }
        prober = prober.with_failure(&urls[3]);

        let result = probe_many(Arc::new(prober), &urls, 6).await.unwrap();

        assert_eq!(
            result,
            vec![Some(10.0), Some(20.0), Some(30.0), None, Some(50.0), Some(60.0)]
        );
    }

    #[tokio::test]
    async fn never_exceeds_max_workers() {
        let urls: Vec<String> = (0..25).map(url).collect();
        let mut prober = FakeProber::new().with_default_duration(1.0);
        for u in &urls {
            prober = prober.with_delay(u, Duration::from_millis(10));
        }
        let prober = Arc::new(prober);

        let result = probe_many(prober.clone(), &urls, 4).await.unwrap();

        assert_eq!(result.len(), 25);
        assert!(result.iter().all(|d| *d == Some(1.0)));
        assert!(prober.peak_concurrency() <= 4);
        assert_eq!(prober.call_count(), 25);
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let prober = Arc::new(FakeProber::new());
        let result = probe_many(prober.clone(), &[], 20).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(prober.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_tool_aborts_batch() {
        let prober = Arc::new(FakeProber::new().with_missing_tool());
        let err = probe_many(prober, &[url(1), url(2)], 2).await.unwrap_err();
        assert!(matches!(err, ProbeError::ToolMissing { .. }));
    }

    #[tokio::test]
    async fn resolver_probes_only_misses_and_saves_per_batch() {
        let urls: Vec<String> = (0..5).map(url).collect();
        let prober = Arc::new(
            FakeProber::new()
                .with_default_duration(12.5)
                .with_failure(&urls[4]),
        );
        let mut seeded = DurationMap::new();
        seeded.insert(urls[0].clone(), 99.0);
        let store = Arc::new(MemoryCacheStore::with_entries(seeded));

        let resolver = DurationResolver::new(
            prober.clone(),
            store.clone(),
            ResolverConfig {
                max_workers: 2,
                batch_size: 2,
                retry_failed: false,
            },
        );

        let mut requested = urls.clone();
        requested.push(urls[1].clone());
        let summary = resolver.resolve(&requested).await.unwrap();

        assert_eq!(
            summary,
            ResolveSummary {
                requested: 5,
                cached: 1,
                probed: 4,
                succeeded: 3,
                failed: 1,
                batches: 2,
            }
        );
        assert_eq!(store.save_count(), 2);
        assert!(!prober.calls().contains(&urls[0]));

        let stored = store.load();
        assert_eq!(stored.get(&urls[0]), Some(&99.0));
        assert_eq!(stored.get(&urls[1]), Some(&12.5));
        assert_eq!(stored.get(&urls[4]), Some(&FAILED_PROBE_SENTINEL));
        assert_eq!(resolver.cached(&urls[4]).await, Some(0.0));
    }

    #[tokio::test]
    async fn second_resolve_hits_cache() {
        let urls: Vec<String> = (0..3).map(url).collect();
        let prober = Arc::new(FakeProber::new().with_default_duration(3.0));
        let store = Arc::new(MemoryCacheStore::new());
        let resolver = DurationResolver::new(
            prober.clone(),
            store.clone(),
            ResolverConfig::default(),
        );

        resolver.resolve(&urls).await.unwrap();
        let again = resolver.resolve(&urls).await.unwrap();

        assert_eq!(again.cached, 3);
        assert_eq!(again.probed, 0);
        assert_eq!(prober.call_count(), 3);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn retry_failed_reprobes_sentinels() {
        let target = url(7);
        let mut seeded = DurationMap::new();
        seeded.insert(target.clone(), FAILED_PROBE_SENTINEL);
        let store = Arc::new(MemoryCacheStore::with_entries(seeded));
        let prober = Arc::new(FakeProber::new().with_duration(&target, 8.0));

        let resolver = DurationResolver::new(
            prober.clone(),
            store,
            ResolverConfig {
                retry_failed: true,
                ..Default::default()
            },
        );
        let summary = resolver.resolve(std::slice::from_ref(&target)).await.unwrap();

        assert_eq!(summary.probed, 1);
        assert_eq!(resolver.cached(&target).await, Some(8.0));
    }

    #[tokio::test]
    async fn resolvers_sharing_a_cache_file_keep_each_others_entries() {
        let dir = tempfile::tempdir().unwrap();
        let prober = Arc::new(FakeProber::new().with_default_duration(4.0));
        let first = DurationResolver::new(
            prober.clone(),
            Arc::new(JsonFileCacheStore::in_dir(dir.path())),
            ResolverConfig::default(),
        );
        let second = DurationResolver::new(
            prober,
            Arc::new(JsonFileCacheStore::in_dir(dir.path())),
            ResolverConfig::default(),
        );

        first.resolve(&[url(1)]).await.unwrap();
        second.resolve(&[url(2)]).await.unwrap();

        let on_disk = JsonFileCacheStore::in_dir(dir.path()).load();
        assert_eq!(on_disk.get(&url(1)), Some(&4.0));
        assert_eq!(on_disk.get(&url(2)), Some(&4.0));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn locked_cache_file_does_not_stall_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCacheStore::in_dir(dir.path());
        let lock_path = dir.path().join("audio_durations.json.lock");

        // Another process holds the cache lock for a while.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(lock_path)
                .unwrap();
            file.lock_exclusive().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(800));
            file.unlock().unwrap();
        });
        locked_rx.recv().unwrap();

        let resolver = DurationResolver::new(
            Arc::new(FakeProber::new().with_default_duration(2.0)),
            Arc::new(store),
            ResolverConfig::default(),
        );
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            resolver.resolve(&[url(1)]),
        )
        .await;

        assert!(outcome.is_err(), "resolve should still wait for the lock");
        assert!(started.elapsed() < Duration::from_millis(600));
        holder.join().unwrap();
    }
}
