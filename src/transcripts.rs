use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Shown when a recording has no usable transcript.
pub const NO_TRANSCRIPT: &str = "No transcript available";

fn as_key(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// Accepts `[{"speaker_id", "speaker_name"}]` as well as a plain
// `{"id": "name"}` object.
fn speaker_names(speaker_map: Option<&Value>) -> HashMap<String, String> {
    let mut names = HashMap::new();
    match speaker_map {
        Some(Value::Array(entries)) => {
            for entry in entries {
                if let (Some(id), Some(name)) = (
                    as_key(entry.get("speaker_id")),
                    entry.get("speaker_name").and_then(Value::as_str),
                ) {
                    names.insert(id, name.to_string());
                }
            }
        }
        Some(Value::Object(map)) => {
            for (id, name) in map {
                if let Some(name) = name.as_str() {
                    names.insert(id.clone(), name.to_string());
                }
            }
        }
        _ => {}
    }
    names
}

/// Builds `"[speaker]: content"` lines from a feedback report's
/// `transcript.segments`, in segment order.
///
/// Speakers missing from `transcript.speaker_map` keep their raw id and
/// segments whose content is blank are dropped. Returns `None` when the
/// report has no segments or none of them has content.
pub fn extract_transcript(report: &Value) -> Option<String> {
    let transcript = report.get("transcript")?;
    let segments = transcript.get("segments")?.as_array()?;
    let names = speaker_names(transcript.get("speaker_map"));

    let lines: Vec<String> = segments
        .iter()
        .filter_map(|segment| {
            let content = segment.get("content")?.as_str()?.trim();
            if content.is_empty() {
                return None;
            }
            let speaker = as_key(segment.get("speaker")).unwrap_or_default();
            let name = names.get(&speaker).cloned().unwrap_or(speaker);
            Some(format!("[{}]: {}", name, content))
        })
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Transcript from the raw report column. Unparseable reports are treated
/// as having no transcript.
pub fn transcript_from_report(raw_report: Option<&str>) -> Option<String> {
    let raw = raw_report?.trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(report) => extract_transcript(&report),
        Err(e) => {
            debug!("Ignoring unparseable feedback report: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drops_blank_segments_and_falls_back_to_raw_ids() {
        let report = json!({
            "transcript": {
                "segments": [
                    {"speaker": "S0", "content": " hi "},
                    {"speaker": "S1", "content": ""}
                ],
                "speaker_map": [
                    {"speaker_id": "S0", "speaker_name": "Ana"}
                ]
            }
        });
        assert_eq!(extract_transcript(&report).as_deref(), Some("[Ana]: hi"));
    }

    #[test]
    fn keeps_segment_order_and_unmapped_speakers() {
        let report = json!({
            "transcript": {
                "segments": [
                    {"speaker": "S1", "content": "Hello, how are you?"},
                    {"speaker": "S0", "content": "Good, thanks."},
                    {"speaker": "S2", "content": "  Me too  "}
                ],
                "speaker_map": [
                    {"speaker_id": "S0", "speaker_name": "Ana"},
                    {"speaker_id": "S1", "speaker_name": "Tutor"}
                ]
            }
        });
        assert_eq!(
            extract_transcript(&report).unwrap(),
            "[Tutor]: Hello, how are you?\n[Ana]: Good, thanks.\n[S2]: Me too"
        );
    }

    #[test]
    fn accepts_object_speaker_map_and_numeric_ids() {
        let report = json!({
            "transcript": {
                "segments": [{"speaker": 0, "content": "one"}],
                "speaker_map": {"0": "Ravi"}
            }
        });
        assert_eq!(extract_transcript(&report).unwrap(), "[Ravi]: one");
    }

    #[test]
    fn missing_pieces_mean_no_transcript() {
        assert_eq!(extract_transcript(&json!({})), None);
        assert_eq!(extract_transcript(&json!({"transcript": {}})), None);
        assert_eq!(
            extract_transcript(&json!({"transcript": {"segments": []}})),
            None
        );
        assert_eq!(
            extract_transcript(&json!({
                "transcript": {"segments": [{"speaker": "S0", "content": "   "}]}
            })),
            None
        );
    }

    #[test]
    fn raw_report_parsing_is_lenient() {
        assert_eq!(transcript_from_report(None), None);
        assert_eq!(transcript_from_report(Some("")), None);
        assert_eq!(transcript_from_report(Some("{not json")), None);
        assert_eq!(
            transcript_from_report(Some(
                r#"{"transcript":{"segments":[{"speaker":"S0","content":"yo"}]}}"#
            ))
            .as_deref(),
            Some("[S0]: yo")
        );
    }
}
