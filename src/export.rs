use crate::duration_cache::DurationMap;
use crate::recordings::{duration_ms, RecordingRow};
use crate::transcripts::NO_TRANSCRIPT;
use anyhow::Result;
use serde::Serialize;

pub const URL_LIST_FILE_NAME: &str = "audio_urls.txt";
pub const CSV_FILE_NAME: &str = "filtered_audio_data.csv";

/// One URL per line, skipping rows without audio.
pub fn url_list(rows: &[&RecordingRow]) -> String {
    rows.iter()
        .filter_map(|row| row.audio_url.as_deref())
        .filter(|url| !url.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Serialize)]
struct CsvRecord<'a> {
    organization: &'a str,
    student: &'a str,
    activity: &'a str,
    topic: &'a str,
    audio_url: &'a str,
    created_at: String,
    duration_ms: i64,
    transcript: &'a str,
}

/// CSV of the filtered view, durations in milliseconds.
pub fn csv_export(
    rows: &[&RecordingRow],
    durations: &DurationMap,
) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(CsvRecord {
            organization: &row.org_name,
            student: &row.student_name,
            activity: &row.activity_name,
            topic: &row.topic_name,
            audio_url: row.audio_url.as_deref().unwrap_or_default(),
            created_at: row.created_at.to_rfc3339(),
            duration_ms: duration_ms(row, durations),
            transcript: row.transcript.as_deref().unwrap_or(NO_TRANSCRIPT),
        })?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    Ok(String::from_utf8(bytes)?)
}
