use anyhow::Result;
use audio_browser::cli::CommonArgs;
use audio_browser::db::open_database;
use audio_browser::duration_cache::JsonFileCacheStore;
use audio_browser::probe::ffprobe::FfprobeProber;
use audio_browser::probe::{MediaProber, DEFAULT_PROBE_TIMEOUT_SECS};
use audio_browser::recordings::load_ready_recordings;
use audio_browser::scheduler::{
    DurationResolver, ResolverConfig, DEFAULT_BATCH_SIZE, DEFAULT_MAX_WORKERS,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Probes every READY recording URL missing from the duration cache.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// URLs probed between cache saves
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Maximum concurrent ffprobe processes
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
    max_workers: usize,

    /// Per-file probe timeout in seconds
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT_SECS)]
    timeout: u64,

    /// Probe again URLs whose earlier probe failed
    #[arg(long)]
    retry_failed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let prober = FfprobeProber::new(
        args.common.ffprobe_path.clone(),
        Duration::from_secs(args.timeout),
        args.common.domains(),
    );
    prober
        .ensure_available()
        .await
        .inspect_err(|e| error!("{}", e))?;

    let urls: Vec<String> = {
        let conn = open_database(&args.common.database_url, true)
            .inspect_err(|e| error!("Cannot connect to database: {:#}", e))?;
        load_ready_recordings(&conn)?
            .into_iter()
            .filter_map(|row| row.audio_url)
            .filter(|url| prober.domains().is_probeable(url))
            .collect()
    };
    info!("{} probeable READY recording URLs", urls.len());

    let store = JsonFileCacheStore::in_dir(&args.common.cache_dir);
    info!("Duration cache at {}", store.path().display());

    let resolver = DurationResolver::new(
        Arc::new(prober),
        Arc::new(store),
        ResolverConfig {
            max_workers: args.max_workers,
            batch_size: args.batch_size,
            retry_failed: args.retry_failed,
        },
    );
    let summary = resolver.resolve(&urls).await?;

    println!(
        "Requested {} URLs: {} already cached, {} probed \
         ({} succeeded, {} failed) in {} batches",
        summary.requested,
        summary.cached,
        summary.probed,
        summary.succeeded,
        summary.failed,
        summary.batches
    );
    Ok(())
}
