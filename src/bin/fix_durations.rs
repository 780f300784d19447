use anyhow::Result;
use audio_browser::cli::CommonArgs;
use audio_browser::db::open_database;
use audio_browser::probe::ffprobe::FfprobeProber;
use audio_browser::probe::{StorageDomains, DEFAULT_PROBE_TIMEOUT_SECS};
use audio_browser::reconcile::{run_reconciliation, ReconcileOptions};
use chrono::Local;
use clap::Parser;
use std::io::Write;
use std::time::Duration;
use tracing::error;

/// Re-probes READY recordings and stores their durations in milliseconds.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Show what would change without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Start at this recording id (inclusive)
    #[arg(long)]
    resume_from: Option<String>,

    /// Process at most this many recordings
    #[arg(long)]
    limit: Option<usize>,

    /// Per-file probe timeout in seconds
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT_SECS)]
    timeout: u64,

    /// Also probe URLs outside the configured storage domains
    #[arg(long)]
    include_dead_urls: bool,
}

fn rule() -> String {
    "=".repeat(60)
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

    let domains = if args.include_dead_urls {
        StorageDomains::any()
    } else {
        args.common.domains()
    };
    let options = ReconcileOptions {
        dry_run: args.dry_run,
        resume_from: args.resume_from.clone(),
        limit: args.limit,
        skip_dead_urls: !args.include_dead_urls,
        domains: domains.clone(),
    };
    let prober = FfprobeProber::new(
        args.common.ffprobe_path.clone(),
        Duration::from_secs(args.timeout),
        domains,
    );

    println!("{}", rule());
    println!("Audio duration fix");
    println!(
        "Mode: {}",
        if args.dry_run { "DRY RUN" } else { "LIVE UPDATE" }
    );
    if let Some(resume_from) = &args.resume_from {
        println!("Resuming from ID: {}", resume_from);
    }
    if let Some(limit) = args.limit {
        println!("Limit: {} recordings", limit);
    }
    println!("Started: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!("{}", rule());

    let mut conn = open_database(&args.common.database_url, false)
        .inspect_err(|e| error!("Cannot connect to database: {:#}", e))?;

    let report = run_reconciliation(&mut conn, &prober, &options, |line| {
        if line.is_finished() {
            println!("{}", line.details());
        } else {
            // Shown right away; the result completes the line.
            print!("{} ", line.prefix());
            let _ = std::io::stdout().flush();
        }
    })
    .await
    .inspect_err(|e| error!("{:#}", e))?;

    let summary = &report.summary;
    println!();
    println!("{}", rule());
    println!("Summary");
    println!("{}", rule());
    println!("Total selected: {}", summary.total);
    println!("Processed:      {}", summary.processed);
    println!("Succeeded:      {}", summary.succeeded);
    println!("Failed:         {}", summary.failed);
    println!("Skipped:        {}", summary.skipped);
    println!(
        "Started:        {}",
        report.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "Finished:       {}",
        report.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    if args.dry_run {
        println!();
        println!(
            "This was a dry run; {} updates were not written. \
             Run without --dry-run to apply them.",
            report.proposals.len()
        );
    }
    println!("{}", rule());

    Ok(())
}
