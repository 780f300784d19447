use crate::probe::{MediaProber, StorageDomains};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// Controls which recordings a reconciliation run touches and whether it
/// writes.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub dry_run: bool,
    /// First record id to process, inclusive.
    pub resume_from: Option<String>,
    pub limit: Option<usize>,
    /// Only select URLs on an allowlisted storage domain.
    pub skip_dead_urls: bool,
    pub domains: StorageDomains,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            resume_from: None,
            limit: None,
            skip_dead_urls: true,
            domains: StorageDomains::default(),
        }
    }
}

/// A recording selected for re-probing.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub url: String,
    pub duration: Option<f64>,
}

/// READY recordings with a URL, ascending by id, honoring resume/limit and
/// the dead-URL filter.
#[instrument(skip(conn), err)]
pub fn fetch_candidates(
    conn: &Connection,
    options: &ReconcileOptions,
) -> Result<Vec<Candidate>> {
    let mut query = String::from(
        r#"SELECT id, "audioFileUrl", duration
           FROM conversation_recordings
           WHERE status = 'READY'
             AND "audioFileUrl" IS NOT NULL"#,
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(resume_from) = &options.resume_from {
        query.push_str(" AND id >= ?");
        params.push(Box::new(resume_from.clone()));
    }
    query.push_str(" ORDER BY id ASC");

    let param_refs: Vec<&dyn rusqlite::ToSql> =
        params.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        Ok(Candidate {
            id: row.get(0)?,
            url: row.get(1)?,
            duration: row.get(2)?,
        })
    })?;
    let rows: Result<Vec<_>, _> = rows.collect();

    // The host check needs a URL parser, so the domain filter and the limit
    // are applied here rather than in SQL.
    let candidates = rows?
        .into_iter()
        .filter(|c| {
            !options.skip_dead_urls || options.domains.is_probeable(&c.url)
        })
        .take(options.limit.unwrap_or(usize::MAX))
        .collect();
    Ok(candidates)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordOutcome {
    /// Reported when work on a record starts; every record gets one of
    /// these followed by exactly one of the other outcomes.
    Probing,
    Updated,
    /// Stored value already matches the probe; nothing written.
    Unchanged,
    DryRun,
    ProbeFailed,
    WriteFailed,
}

/// Per-record status line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordProgress {
    pub ordinal: usize,
    pub total: usize,
    pub id: String,
    pub old_duration: Option<f64>,
    pub probed_seconds: Option<f64>,
    pub new_duration_ms: Option<i64>,
    pub outcome: RecordOutcome,
    pub error: Option<String>,
}

impl RecordProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.ordinal as f64 / self.total as f64 * 100.0
    }

    pub fn is_finished(&self) -> bool {
        self.outcome != RecordOutcome::Probing
    }

    /// `[ordinal/total] (pct%) ID=id`, printed as soon as the record starts.
    pub fn prefix(&self) -> String {
        format!(
            "[{}/{}] ({:.1}%) ID={}",
            self.ordinal,
            self.total,
            self.percent(),
            self.id
        )
    }

    /// Everything after the prefix.
    pub fn details(&self) -> String {
        if self.outcome == RecordOutcome::Probing {
            return "probing...".to_string();
        }
        let (Some(seconds), Some(new_ms)) =
            (self.probed_seconds, self.new_duration_ms)
        else {
            return "FAILED".to_string();
        };

        let old = match self.old_duration {
            Some(old) => format!("{}ms", old),
            None => "NULL".to_string(),
        };
        let status = match self.outcome {
            RecordOutcome::Updated => "UPDATED".to_string(),
            RecordOutcome::Unchanged => "UNCHANGED".to_string(),
            RecordOutcome::DryRun => "(dry run)".to_string(),
            RecordOutcome::Probing | RecordOutcome::ProbeFailed => {
                "FAILED".to_string()
            }
            RecordOutcome::WriteFailed => format!(
                "DB ERROR: {}",
                self.error.as_deref().unwrap_or("unknown")
            ),
        };
        format!("{} -> {}ms ({:.2}s) {}", old, new_ms, seconds, status)
    }
}

impl fmt::Display for RecordProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.prefix(), self.details())
    }
}

/// A write the run made, or would have made in dry-run mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposedUpdate {
    pub id: String,
    pub old_duration: Option<f64>,
    pub new_duration_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub summary: ReconcileSummary,
    pub proposals: Vec<ProposedUpdate>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Truncating seconds → milliseconds conversion used for every write.
pub fn seconds_to_millis(seconds: f64) -> i64 {
    (seconds * 1000.0) as i64
}

// One transaction per record; dropping `tx` on error rolls it back.
fn write_duration(
    conn: &mut Connection,
    id: &str,
    duration_ms: i64,
) -> Result<()> {
    let tx = conn.transaction()?;
    let changed = tx.execute(
        "UPDATE conversation_recordings SET duration = ? WHERE id = ?",
        params![duration_ms, id],
    )?;
    if changed == 0 {
        anyhow::bail!("recording {} no longer exists", id);
    }
    tx.commit().context("commit failed")?;
    Ok(())
}

/// Re-probes every selected recording and writes the probed duration in
/// milliseconds, one record at a time in ascending id order.
///
/// `on_progress` sees each record twice: once with [`RecordOutcome::Probing`]
/// as soon as the record is picked up, then once with the result. Per-record failures
/// are counted and reported there; only an unusable prober or a failing
/// selection query aborts the run.
#[instrument(skip(conn, prober, on_progress), err)]
pub async fn run_reconciliation<F>(
    conn: &mut Connection,
    prober: &dyn MediaProber,
    options: &ReconcileOptions,
    mut on_progress: F,
) -> Result<ReconcileReport>
where
    F: FnMut(&RecordProgress),
{
    let started_at = Utc::now();
    prober.ensure_available().await?;

    let candidates = fetch_candidates(conn, options)?;
    let total = candidates.len();
    info!(
        "Found {} recordings to process (dry_run={})",
        total, options.dry_run
    );

    let mut summary = ReconcileSummary {
        total,
        ..Default::default()
    };
    let mut proposals = Vec::new();

    for (index, candidate) in candidates.into_iter().enumerate() {
        let mut progress = RecordProgress {
            ordinal: index + 1,
            total,
            id: candidate.id.clone(),
            old_duration: candidate.duration,
            probed_seconds: None,
            new_duration_ms: None,
            outcome: RecordOutcome::Probing,
            error: None,
        };
        summary.processed += 1;
        on_progress(&progress);
        progress.outcome = RecordOutcome::ProbeFailed;

        // Always a fresh probe; the shared cache is what this job corrects.
        let Some(seconds) = prober.probe(&candidate.url).await? else {
            debug!("Probe failed for {}", candidate.id);
            summary.failed += 1;
            on_progress(&progress);
            continue;
        };

        let new_ms = seconds_to_millis(seconds);
        progress.probed_seconds = Some(seconds);
        progress.new_duration_ms = Some(new_ms);

        if candidate.duration == Some(new_ms as f64) {
            progress.outcome = RecordOutcome::Unchanged;
            summary.skipped += 1;
            on_progress(&progress);
            continue;
        }

        proposals.push(ProposedUpdate {
            id: candidate.id.clone(),
            old_duration: candidate.duration,
            new_duration_ms: new_ms,
        });

        if options.dry_run {
            progress.outcome = RecordOutcome::DryRun;
            summary.succeeded += 1;
        } else {
            match write_duration(conn, &candidate.id, new_ms) {
                Ok(()) => {
                    progress.outcome = RecordOutcome::Updated;
                    summary.succeeded += 1;
                }
                Err(e) => {
                    warn!("Failed to update {}: {:#}", candidate.id, e);
                    progress.outcome = RecordOutcome::WriteFailed;
                    progress.error = Some(format!("{:#}", e));
                    summary.failed += 1;
                    proposals.pop();
                }
            }
        }
        on_progress(&progress);
    }

    info!(
        "Reconciliation finished: processed={} succeeded={} failed={} skipped={}",
        summary.processed, summary.succeeded, summary.failed, summary.skipped
    );

    Ok(ReconcileReport {
        summary,
        proposals,
        started_at,
        finished_at: Utc::now(),
    })
}
