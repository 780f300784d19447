use crate::duration_cache::DurationMap;
use crate::time_util;
use crate::transcripts::transcript_from_report;
use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{info, instrument};

pub const NO_TOPIC: &str = "No Topic";

/// Filter value meaning "no restriction".
pub const ALL: &str = "All";

/// One READY recording joined with its organization, student, activity and
/// topic names.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordingRow {
    pub id: String,
    pub org_name: String,
    pub student_name: String,
    pub activity_name: String,
    pub topic_name: String,
    pub audio_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// As stored: seconds on some rows, milliseconds on others.
    pub duration: Option<f64>,
    pub transcript: Option<String>,
}

const READY_RECORDINGS_QUERY: &str = r#"
    SELECT
        cr.id,
        o.name AS org_name,
        u.name AS student_name,
        a.title AS activity_name,
        COALESCE(t.name, 'No Topic') AS topic_name,
        cr."audioFileUrl" AS audio_url,
        cr."createdAt" AS created_at,
        cr.duration,
        cr."feedbackReport" AS feedback_report
    FROM conversation_recordings cr
    JOIN organizations o ON cr."organizationId" = o.id
    JOIN users u ON cr."studentId" = u.id
    JOIN activities a ON cr."activityId" = a.id
    LEFT JOIN topic_activities ta ON a.id = ta."activityId"
    LEFT JOIN topics t ON ta."topicId" = t.id
    WHERE cr.status = 'READY'
    ORDER BY cr."createdAt" DESC, cr.id DESC
"#;

/// Loads every READY recording, newest first.
#[instrument(skip(conn), err)]
pub fn load_ready_recordings(conn: &Connection) -> Result<Vec<RecordingRow>> {
    let mut stmt = conn.prepare(READY_RECORDINGS_QUERY)?;
    let rows = stmt.query_map([], |row| {
        let report: Option<String> = row.get(8)?;
        Ok(RecordingRow {
            id: row.get(0)?,
            org_name: row.get(1)?,
            student_name: row.get(2)?,
            activity_name: row.get(3)?,
            topic_name: row.get(4)?,
            audio_url: row.get(5)?,
            created_at: row.get(6)?,
            duration: row.get(7)?,
            transcript: transcript_from_report(report.as_deref()),
        })
    })?;

    let rows: Result<Vec<_>, _> = rows.collect();
    let rows = rows?;
    info!("Loaded {} READY recordings", rows.len());
    Ok(rows)
}

/// Requested filter values. `None`, empty or `"All"` means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSelection {
    pub organization: Option<String>,
    pub student: Option<String>,
    pub activity: Option<String>,
    pub topic: Option<String>,
    /// Inclusive local date, `YYYY-MM-DD`.
    pub date_start: Option<String>,
    /// Inclusive local date, `YYYY-MM-DD`.
    pub date_end: Option<String>,
}

fn normalized(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != ALL)
}

/// Choices offered by each filter given the filters before it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterChoices {
    pub organizations: Vec<String>,
    pub students: Vec<String>,
    pub activities: Vec<String>,
    pub topics: Vec<String>,
    pub earliest_date: Option<String>,
    pub latest_date: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FilteredView<'a> {
    /// The selection actually applied; impossible values are dropped.
    pub selection: FilterSelection,
    pub choices: FilterChoices,
    pub rows: Vec<&'a RecordingRow>,
}

// Narrows `rows` on one field. The choices come from the rows before the
// narrowing, and a requested value that is not a choice is ignored.
fn cascade<'a>(
    rows: Vec<&'a RecordingRow>,
    requested: Option<&str>,
    field: fn(&RecordingRow) -> &str,
) -> (Vec<String>, Option<String>, Vec<&'a RecordingRow>) {
    let choices: Vec<String> = rows
        .iter()
        .map(|row| field(row).to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    match requested {
        Some(value) if choices.iter().any(|c| c == value) => {
            let rows =
                rows.into_iter().filter(|row| field(row) == value).collect();
            (choices, Some(value.to_string()), rows)
        }
        _ => (choices, None, rows),
    }
}

/// Applies organization → student → activity → topic → date range.
pub fn apply_filters<'a>(
    rows: &'a [RecordingRow],
    requested: &FilterSelection,
    timezone: Tz,
) -> Result<FilteredView<'a>> {
    let all: Vec<&RecordingRow> = rows.iter().collect();

    let (organizations, organization, rows) =
        cascade(all, normalized(&requested.organization), |r| {
            r.org_name.as_str()
        });
    let (students, student, rows) =
        cascade(rows, normalized(&requested.student), |r| {
            r.student_name.as_str()
        });
    let (activities, activity, rows) =
        cascade(rows, normalized(&requested.activity), |r| {
            r.activity_name.as_str()
        });
    let (topics, topic, rows) =
        cascade(rows, normalized(&requested.topic), |r| r.topic_name.as_str());

    let earliest_date = rows
        .iter()
        .map(|row| row.created_at)
        .min()
        .map(|ts| time_util::local_date(&ts, timezone));
    let latest_date = rows
        .iter()
        .map(|row| row.created_at)
        .max()
        .map(|ts| time_util::local_date(&ts, timezone));

    let date_start = normalized(&requested.date_start).map(str::to_string);
    let date_end = normalized(&requested.date_end).map(str::to_string);
    let (from, until) = time_util::parse_local_date_range_to_utc_range(
        date_start.as_deref(),
        date_end.as_deref(),
        timezone,
    )?;
    let rows = rows
        .into_iter()
        .filter(|row| from.map_or(true, |from| row.created_at >= from))
        .filter(|row| until.map_or(true, |until| row.created_at < until))
        .collect();

    Ok(FilteredView {
        selection: FilterSelection {
            organization,
            student,
            activity,
            topic,
            date_start,
            date_end,
        },
        choices: FilterChoices {
            organizations,
            students,
            activities,
            topics,
            earliest_date,
            latest_date,
        },
        rows,
    })
}

/// Reads a stored duration whose unit is unknown: values above 1000 are
/// taken as milliseconds, anything else as seconds.
///
/// Only for display of rows the reconciliation job has not rewritten yet.
pub fn legacy_duration_seconds(stored: Option<f64>) -> f64 {
    match stored {
        Some(value) if value.is_finite() && value > 1000.0 => value / 1000.0,
        Some(value) if value.is_finite() && value > 0.0 => value,
        _ => 0.0,
    }
}

/// Best known duration of a row in seconds: a successful cached probe, else
/// the stored value.
pub fn duration_seconds(row: &RecordingRow, durations: &DurationMap) -> f64 {
    row.audio_url
        .as_ref()
        .and_then(|url| durations.get(url))
        .copied()
        .filter(|seconds| *seconds > 0.0)
        .unwrap_or_else(|| legacy_duration_seconds(row.duration))
}

pub fn duration_ms(row: &RecordingRow, durations: &DurationMap) -> i64 {
    (duration_seconds(row, durations) * 1000.0) as i64
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordingStats {
    pub total_session_seconds: f64,
    pub total_session_hours: f64,
    pub record_count: usize,
    pub unique_students: usize,
}

/// Aggregates over the filtered view.
pub fn compute_stats(
    rows: &[&RecordingRow],
    durations: &DurationMap,
) -> RecordingStats {
    let total_session_seconds: f64 =
        rows.iter().map(|row| duration_seconds(row, durations)).sum();
    let unique_students = rows
        .iter()
        .map(|row| row.student_name.as_str())
        .collect::<HashSet<_>>()
        .len();

    RecordingStats {
        total_session_seconds,
        total_session_hours: total_session_seconds / 3600.0,
        record_count: rows.len(),
        unique_students,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seed_recording, test_connection, SeedRecording};
    use pretty_assertions::assert_eq;

    fn seeded() -> Vec<RecordingRow> {
        let conn = test_connection();
        let fixtures = [
            ("r1", "Acme", "Ana", "Debate", Some("Climate"), "2024-03-01T10:00:00Z"),
            ("r2", "Acme", "Ben", "Debate", Some("Climate"), "2024-03-02T10:00:00Z"),
            ("r3", "Acme", "Ana", "Interview", None, "2024-03-03T10:00:00Z"),
            ("r4", "Globex", "Cara", "Debate", Some("Climate"), "2024-03-04T10:00:00Z"),
            ("r5", "Globex", "Dev", "Pitch", Some("Startups"), "2024-03-05T10:00:00Z"),
        ];
        for (id, org, student, activity, topic, created) in fixtures {
            seed_recording(
                &conn,
                &SeedRecording {
                    id,
                    org,
                    student,
                    activity,
                    topic,
                    url: Some(&format!("https://b.s3.amazonaws.com/{}.webm", id)),
                    created_at: created,
                    ..Default::default()
                },
            )
            .unwrap();
        }
        seed_recording(
            &conn,
            &SeedRecording {
                id: "r6",
                org: "Initech",
                student: "Eve",
                status: "PROCESSING",
                ..Default::default()
            },
        )
        .unwrap();
        load_ready_recordings(&conn).unwrap()
    }

    fn select(org: Option<&str>, student: Option<&str>) -> FilterSelection {
        FilterSelection {
            organization: org.map(str::to_string),
            student: student.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn loads_ready_rows_newest_first() {
        let rows = seeded();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r5", "r4", "r3", "r2", "r1"]);
        assert_eq!(rows[2].topic_name, NO_TOPIC);
    }

    #[test]
    fn organization_restricts_student_choices() {
        let rows = seeded();
        let view = apply_filters(&rows, &select(Some("Acme"), None), chrono_tz::UTC)
            .unwrap();

        assert_eq!(view.choices.organizations, ["Acme", "Globex"]);
        assert_eq!(view.choices.students, ["Ana", "Ben"]);
        assert_eq!(view.rows.len(), 3);
    }

    #[test]
    fn student_outside_cascade_is_dropped() {
        let rows = seeded();
        let view = apply_filters(
            &rows,
            &select(Some("Acme"), Some("Cara")),
            chrono_tz::UTC,
        )
        .unwrap();

        assert_eq!(view.selection.organization.as_deref(), Some("Acme"));
        assert_eq!(view.selection.student, None);
        assert!(view.rows.iter().all(|r| r.org_name == "Acme"));
        assert_eq!(view.rows.len(), 3);
    }

    #[test]
    fn all_and_blank_mean_unrestricted() {
        let rows = seeded();
        let view = apply_filters(
            &rows,
            &select(Some("All"), Some("  ")),
            chrono_tz::UTC,
        )
        .unwrap();
        assert_eq!(view.selection, FilterSelection::default());
        assert_eq!(view.rows.len(), 5);
        assert_eq!(view.choices.students, ["Ana", "Ben", "Cara", "Dev"]);
    }

    #[test]
    fn later_choices_follow_earlier_filters() {
        let rows = seeded();
        let selection = FilterSelection {
            organization: Some("Acme".into()),
            student: Some("Ana".into()),
            activity: Some("Debate".into()),
            ..Default::default()
        };
        let view = apply_filters(&rows, &selection, chrono_tz::UTC).unwrap();
        assert_eq!(view.choices.activities, ["Debate", "Interview"]);
        assert_eq!(view.choices.topics, ["Climate"]);
        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.rows[0].id, "r1");
    }

    #[test]
    fn date_range_is_inclusive_local_dates() {
        let rows = seeded();
        let selection = FilterSelection {
            date_start: Some("2024-03-02".into()),
            date_end: Some("2024-03-04".into()),
            ..Default::default()
        };
        let view = apply_filters(&rows, &selection, chrono_tz::UTC).unwrap();
        let ids: Vec<&str> = view.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r4", "r3", "r2"]);
        assert_eq!(view.choices.earliest_date.as_deref(), Some("2024-03-01"));
        assert_eq!(view.choices.latest_date.as_deref(), Some("2024-03-05"));

        let bad = FilterSelection {
            date_start: Some("March".into()),
            ..Default::default()
        };
        assert!(apply_filters(&rows, &bad, chrono_tz::UTC).is_err());
    }

    #[test]
    fn legacy_rule_reads_large_values_as_milliseconds() {
        assert_eq!(legacy_duration_seconds(None), 0.0);
        assert_eq!(legacy_duration_seconds(Some(45.0)), 45.0);
        assert_eq!(legacy_duration_seconds(Some(1000.0)), 1000.0);
        assert_eq!(legacy_duration_seconds(Some(45300.0)), 45.3);
        assert_eq!(legacy_duration_seconds(Some(f64::NAN)), 0.0);
    }

    #[test]
    fn stats_prefer_cached_probes() {
        let mut rows = seeded();
        rows[0].duration = Some(60_000.0);
        rows[1].duration = Some(30.0);
        rows[2].duration = None;

        let mut durations = DurationMap::new();
        durations.insert(rows[1].audio_url.clone().unwrap(), 90.0);
        // A failed probe does not hide the stored value.
        durations.insert(rows[0].audio_url.clone().unwrap(), 0.0);

        let view: Vec<&RecordingRow> = rows.iter().take(3).collect();
        let stats = compute_stats(&view, &durations);

        assert_eq!(stats.total_session_seconds, 150.0);
        assert_eq!(stats.record_count, 3);
        assert_eq!(stats.unique_students, 3);
        assert_eq!(duration_ms(&rows[1], &durations), 90_000);
    }
}
