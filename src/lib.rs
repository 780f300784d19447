use crate::duration_cache::{DurationCacheStore, MemoryCacheStore};
use crate::probe::fake::FakeProber;
use crate::probe::MediaProber;
use crate::recordings::RecordingRow;
use crate::scheduler::{DurationResolver, ResolverConfig};
use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

pub mod app;
pub mod cli;
pub mod db;
pub mod duration_cache;
pub mod export;
pub mod probe;
pub mod recordings;
pub mod reconcile;
pub mod scheduler;
pub mod time_util;
pub mod transcripts;

pub mod test_utils;

/// How long a loaded recordings snapshot is served before reloading.
pub const RECORDINGS_TTL: Duration = Duration::from_secs(60);

struct RecordingsSnapshot {
    loaded_at: Instant,
    rows: Arc<Vec<RecordingRow>>,
}

// Define the AppState struct for both main app and testing
pub struct AppState {
    pub recordings_db: Pool<SqliteConnectionManager>,
    pub durations: Arc<DurationResolver>,
    pub timezone: chrono_tz::Tz,
    pub recordings_ttl: Duration,
    snapshot: RwLock<Option<RecordingsSnapshot>>,
    // Add fields to track temp files
    #[allow(dead_code)]
    temp_recordings_path: Option<tempfile::NamedTempFile>,
}

impl AppState {
    pub fn new_for_testing() -> Self {
        Self::new_for_testing_with_prober(Arc::new(FakeProber::new()))
    }

    // Create a new AppState for testing with minimal configuration
    pub fn new_for_testing_with_prober(prober: Arc<dyn MediaProber>) -> Self {
        let temp_recordings_file = tempfile::NamedTempFile::new()
            .expect("Failed to create temporary recordings database file");
        let recordings_path = temp_recordings_file
            .path()
            .to_str()
            .expect("Failed to get recordings temp file path")
            .to_string();

        let manager = SqliteConnectionManager::file(&recordings_path);
        let pool =
            Pool::new(manager).expect("Failed to create recordings pool");
        {
            let conn = pool.get().expect("Failed to get connection");
            db::init_recordings_db_for_testing(&conn)
                .expect("Failed to initialize recordings db");
        }

        let store: Arc<dyn DurationCacheStore> =
            Arc::new(MemoryCacheStore::new());

        Self {
            recordings_db: pool,
            durations: Arc::new(DurationResolver::new(
                prober,
                store,
                ResolverConfig::default(),
            )),
            // Use Kolkata because it is offset from UTC by 5.5 hours
            timezone: chrono_tz::Asia::Kolkata,
            recordings_ttl: RECORDINGS_TTL,
            snapshot: RwLock::new(None),
            temp_recordings_path: Some(temp_recordings_file),
        }
    }

    /// READY recordings, served from the snapshot while it is fresh.
    #[instrument(skip(self), err)]
    pub async fn recordings(&self) -> Result<Arc<Vec<RecordingRow>>> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            if snapshot.loaded_at.elapsed() < self.recordings_ttl {
                return Ok(snapshot.rows.clone());
            }
        }

        let mut snapshot = self.snapshot.write().await;
        // Another request may have reloaded while we waited.
        if let Some(current) = snapshot.as_ref() {
            if current.loaded_at.elapsed() < self.recordings_ttl {
                return Ok(current.rows.clone());
            }
        }

        let pool = self.recordings_db.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            recordings::load_ready_recordings(&conn)
        })
        .await??;
        let rows = Arc::new(rows);
        *snapshot = Some(RecordingsSnapshot {
            loaded_at: Instant::now(),
            rows: rows.clone(),
        });
        Ok(rows)
    }

    /// Drops the snapshot so the next request reloads from the database.
    pub async fn invalidate_recordings(&self) {
        debug!("Dropping recordings snapshot");
        *self.snapshot.write().await = None;
    }
}

// Create a config struct to hold AppState configuration
pub struct AppConfig {
    pub recordings_pool: Pool<SqliteConnectionManager>,
    pub prober: Arc<dyn MediaProber>,
    pub cache_store: Arc<dyn DurationCacheStore>,
    pub resolver_config: ResolverConfig,
    pub timezone_str: Option<String>,
}

// Function to create AppState from parameters
pub fn create_app_state(config: AppConfig) -> Arc<AppState> {
    // Determine the timezone to use
    let timezone =
        time_util::get_local_timezone(config.timezone_str.as_deref());

    let durations = DurationResolver::new(
        config.prober,
        config.cache_store,
        config.resolver_config,
    );

    Arc::new(AppState {
        recordings_db: config.recordings_pool,
        durations: Arc::new(durations),
        timezone,
        recordings_ttl: RECORDINGS_TTL,
        snapshot: RwLock::new(None),
        temp_recordings_path: None,
    })
}
