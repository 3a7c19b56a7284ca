// Text rendering of recordings, metadata and transcripts

use serde_json::Value;
use std::collections::BTreeSet;

use crate::models::ktalk::{Recording, RecordingInfo};

/// Format milliseconds as HH:MM:SS, or MM:SS under an hour
pub fn format_timestamp(ms: u64) -> String {
    let total_seconds = ms / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// Format seconds as "1h 2m 3s" / "2m 3s" / "3s"
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

fn duration_secs(duration: Option<f64>) -> u64 {
    duration
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| d as u64)
        .unwrap_or(0)
}

// ==================================================================================================
// Recordings
// ==================================================================================================

/// Pull the recording array out of a bare list or `{recordings|items: [...]}`
pub fn recordings_from(data: Value) -> Result<Vec<Recording>, serde_json::Error> {
    let list = match data {
        Value::Array(_) => data,
        Value::Object(mut obj) => obj
            .remove("recordings")
            .or_else(|| obj.remove("items"))
            .unwrap_or(Value::Array(Vec::new())),
        _ => Value::Array(Vec::new()),
    };
    serde_json::from_value(list)
}

pub fn format_recordings(recordings: &[Recording]) -> String {
    if recordings.is_empty() {
        return "No recordings found.".to_string();
    }

    let mut lines = vec![format!("Found {} recording(s):\n", recordings.len())];
    for rec in recordings {
        let secs = duration_secs(rec.duration);
        let duration = if secs > 0 {
            format_duration(secs)
        } else {
            "n/a".to_string()
        };
        lines.push(format!(
            "  [{}] {}\n    Created: {} | Duration: {} | Participants: {}",
            rec.key.as_deref().unwrap_or("?"),
            rec.title.as_deref().unwrap_or("Untitled"),
            rec.created_date.as_deref().unwrap_or_default(),
            duration,
            rec.participants_count.unwrap_or(0)
        ));
    }
    lines.join("\n")
}

pub fn format_recording_info(key: &str, info: &RecordingInfo) -> String {
    let mut lines = vec![
        format!("Recording: {}", info.title.as_deref().unwrap_or("Untitled")),
        format!("Key: {}", key),
    ];
    if let Some(description) = info.description.as_deref().filter(|d| !d.is_empty()) {
        lines.push(format!("Description: {}", description));
    }

    let author = info
        .created_by
        .as_ref()
        .map(|p| p.full_name())
        .unwrap_or_default();
    let author_email = info
        .created_by
        .as_ref()
        .and_then(|p| p.email.as_deref())
        .filter(|e| !e.is_empty());

    lines.push(format!(
        "Created: {}",
        info.created_date.as_deref().unwrap_or_default()
    ));
    lines.push(match author_email {
        Some(email) => format!("Author: {} ({})", author, email),
        None => format!("Author: {}", author),
    });
    lines.push(format!(
        "Duration: {}",
        format_duration(duration_secs(info.duration))
    ));
    lines.push(format!(
        "Status: {}",
        info.status.as_deref().unwrap_or("unknown")
    ));
    lines.push(format!(
        "Participants: {}",
        info.participants_count.unwrap_or(0)
    ));

    let names: Vec<String> = info
        .participants
        .iter()
        .flatten()
        .map(|p| p.display_name())
        .collect();
    if !names.is_empty() {
        lines.push(format!("Participant names: {}", names.join(", ")));
    }

    let has_audio = info.has_audio_record.unwrap_or(false);
    lines.push(format!(
        "Audio record: {}",
        if has_audio { "yes" } else { "no" }
    ));
    lines.push(format!(
        "Transcript: {}",
        info.transcription
            .as_ref()
            .and_then(|t| t.status.as_deref())
            .unwrap_or("none")
    ));

    let qualities = info.qualities.as_deref().unwrap_or_default();
    if qualities.is_empty() {
        lines.push("Available qualities: no data".to_string());
    } else {
        lines.push("Available qualities for download:".to_string());
        for q in qualities {
            let size = q.size.clone().unwrap_or_default();
            let dim = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string());
            lines.push(format!(
                "  - {} ({}x{}, status: {})",
                q.name.as_deref().unwrap_or("?"),
                dim(size.width),
                dim(size.height),
                q.status.as_deref().unwrap_or("unknown")
            ));
        }
    }

    lines.join("\n")
}

// ==================================================================================================
// Transcripts
// ==================================================================================================

fn str_field<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| v.get(*k).and_then(Value::as_str))
}

fn offset_ms(v: &Value, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_f64))
        .filter(|ms| *ms > 0.0)
        .map(|ms| ms as u64)
        .unwrap_or(0)
}

/// Render a phrase-like object (`speakerName`/`speaker`, `text`, start offset)
fn phrase_line(item: &Value) -> String {
    let speaker = str_field(item, &["speakerName", "speaker"]).unwrap_or("Unknown");
    let text = str_field(item, &["text"]).unwrap_or_default();
    let start = offset_ms(item, &["startTimeOffsetInMillis", "startMs"]);
    format!("[{}] {}: {}", format_timestamp(start), speaker, text)
}

/// `transcriptionV2`, else `transcription`, else the document itself
fn transcription_of(data: &Value) -> &Value {
    ["transcriptionV2", "transcription"]
        .iter()
        .filter_map(|k| data.get(*k))
        .find(|v| !v.is_null() && v.as_object().map_or(true, |o| !o.is_empty()))
        .unwrap_or(data)
}

/// Speaker name from a track's `speaker` object, empty when unknown
fn track_speaker(track: &Value) -> String {
    let speaker = track.get("speaker").unwrap_or(&Value::Null);
    if let Some(name) = str_field(speaker, &["anonymousName"]).filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    format!(
        "{} {}",
        str_field(speaker, &["firstname"]).unwrap_or_default(),
        str_field(speaker, &["surname"]).unwrap_or_default()
    )
    .trim()
    .to_string()
}

fn tracks_of(data: &Value) -> &[Value] {
    transcription_of(data)
        .get("tracks")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Turn any of the transcript layouts the API returns into timestamped lines
pub fn parse_transcript(data: &Value) -> Vec<String> {
    match data {
        Value::Null => return Vec::new(),
        Value::Array(items) => return items.iter().map(phrase_line).collect(),
        Value::Object(obj) if obj.is_empty() => return Vec::new(),
        Value::Object(_) => {}
        _ => return Vec::new(),
    }

    let transcription = transcription_of(data);
    if let Some(status) = str_field(transcription, &["status"]) {
        if status != "success" && status != "complete" {
            return vec![format!("Transcript unavailable (status: {}).", status)];
        }
    }

    let mut lines = Vec::new();
    for track in tracks_of(data) {
        let speaker = track_speaker(track);
        let speaker = if speaker.is_empty() { "Unknown".to_string() } else { speaker };
        for chunk in track.get("chunks").and_then(Value::as_array).into_iter().flatten() {
            let text = str_field(chunk, &["text"]).unwrap_or_default();
            let start = offset_ms(chunk, &["startTimeOffsetInMillis"]);
            lines.push(format!("[{}] {}: {}", format_timestamp(start), speaker, text));
        }
    }

    if lines.is_empty() {
        if let Some(text) = str_field(data, &["text"]) {
            return vec![text.to_string()];
        }
        if let Some(phrases) = data.get("phrases").and_then(Value::as_array) {
            lines = phrases.iter().map(phrase_line).collect();
        }
    }

    lines
}

/// Sorted unique speaker names from the track layout
pub fn extract_speakers(data: &Value) -> Vec<String> {
    if !data.is_object() {
        return Vec::new();
    }
    tracks_of(data)
        .iter()
        .map(track_speaker)
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "00:00");
        assert_eq!(format_timestamp(65_000), "01:05");
        assert_eq!(format_timestamp(3_725_999), "01:02:05");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(7), "7s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3_600), "1h 0m 0s");
        assert_eq!(format_duration(3_725), "1h 2m 5s");
    }

    #[test]
    fn test_parse_flat_phrase_list() {
        let data = json!([
            {"speakerName": "Anna", "text": "Hello", "startTimeOffsetInMillis": 1_000},
            {"speaker": "Boris", "text": "Hi", "startMs": 62_000},
            {"text": "..."}
        ]);
        assert_eq!(
            parse_transcript(&data),
            vec![
                "[00:01] Anna: Hello",
                "[01:02] Boris: Hi",
                "[00:00] Unknown: ...",
            ]
        );
    }

    #[test]
    fn test_parse_tracks_layout() {
        let data = json!({
            "transcriptionV2": {
                "status": "success",
                "tracks": [
                    {
                        "speaker": {"firstname": "Ivan", "surname": "Sosin"},
                        "chunks": [
                            {"text": "Start", "startTimeOffsetInMillis": 0},
                            {"text": "Next", "startTimeOffsetInMillis": 3_600_000}
                        ]
                    },
                    {
                        "speaker": {"anonymousName": "Guest"},
                        "chunks": [{"text": "Hey", "startTimeOffsetInMillis": 5_000}]
                    },
                    {"speaker": {}, "chunks": [{"text": "?"}]}
                ]
            }
        });
        assert_eq!(
            parse_transcript(&data),
            vec![
                "[00:00] Ivan Sosin: Start",
                "[01:00:00] Ivan Sosin: Next",
                "[00:05] Guest: Hey",
                "[00:00] Unknown: ?",
            ]
        );
        assert_eq!(extract_speakers(&data), vec!["Guest", "Ivan Sosin"]);
    }

    #[test]
    fn test_parse_falls_back_to_transcription_v1() {
        let data = json!({
            "transcriptionV2": null,
            "transcription": {
                "tracks": [{"speaker": {"anonymousName": "A"}, "chunks": [{"text": "x"}]}]
            }
        });
        assert_eq!(parse_transcript(&data), vec!["[00:00] A: x"]);
    }

    #[test]
    fn test_parse_pending_status() {
        let data = json!({"transcription": {"status": "inProgress", "tracks": []}});
        assert_eq!(
            parse_transcript(&data),
            vec!["Transcript unavailable (status: inProgress)."]
        );
    }

    #[test]
    fn test_parse_plain_text_and_phrases() {
        assert_eq!(
            parse_transcript(&json!({"text": "whole transcript"})),
            vec!["whole transcript"]
        );
        let data = json!({"phrases": [{"speakerName": "Anna", "text": "Hi", "startMs": 2_000}]});
        assert_eq!(parse_transcript(&data), vec!["[00:02] Anna: Hi"]);
    }

    #[test]
    fn test_parse_empty_inputs() {
        assert!(parse_transcript(&Value::Null).is_empty());
        assert!(parse_transcript(&json!({})).is_empty());
        assert!(parse_transcript(&json!([])).is_empty());
        assert!(extract_speakers(&json!([])).is_empty());
    }

    #[test]
    fn test_recordings_from_wrappers() {
        let bare = recordings_from(json!([{"key": "a"}])).unwrap();
        assert_eq!(bare.len(), 1);
        let wrapped = recordings_from(json!({"items": [{"key": "a"}, {"key": "b"}]})).unwrap();
        assert_eq!(wrapped.len(), 2);
        let named = recordings_from(json!({"recordings": []})).unwrap();
        assert!(named.is_empty());
    }

    #[test]
    fn test_format_recordings() {
        assert_eq!(format_recordings(&[]), "No recordings found.");

        let recs = recordings_from(json!([
            {"key": "k1", "title": "Daily", "createdDate": "2026-03-01T10:00:00Z",
             "duration": 125, "participantsCount": 4},
            {"recordingKey": "k2"}
        ]))
        .unwrap();
        let text = format_recordings(&recs);
        assert!(text.starts_with("Found 2 recording(s):\n"));
        assert!(text.contains("  [k1] Daily\n    Created: 2026-03-01T10:00:00Z | Duration: 2m 5s | Participants: 4"));
        assert!(text.contains("  [k2] Untitled\n    Created:  | Duration: n/a | Participants: 0"));
    }

    #[test]
    fn test_format_recording_info() {
        let info: RecordingInfo = serde_json::from_value(json!({
            "title": "Planning",
            "createdDate": "2026-03-01",
            "duration": 3725,
            "status": "ready",
            "participantsCount": 2,
            "createdBy": {"firstname": "Ivan", "surname": "Sosin", "email": "i@example.com"},
            "participants": [{"anonymousName": "Guest"}, {"userInfo": {"firstname": "Anna"}}],
            "qualities": [{"name": "720p", "status": "ready", "size": {"width": 1280, "height": 720}}],
            "transcription": {"status": "success"},
            "hasAudioRecord": true
        }))
        .unwrap();

        let text = format_recording_info("key-1", &info);
        assert_eq!(
            text,
            [
                "Recording: Planning",
                "Key: key-1",
                "Created: 2026-03-01",
                "Author: Ivan Sosin (i@example.com)",
                "Duration: 1h 2m 5s",
                "Status: ready",
                "Participants: 2",
                "Participant names: Guest, Anna",
                "Audio record: yes",
                "Transcript: success",
                "Available qualities for download:",
                "  - 720p (1280x720, status: ready)",
            ]
            .join("\n")
        );
    }

    #[test]
    fn test_format_recording_info_minimal() {
        let text = format_recording_info("k", &RecordingInfo::default());
        assert!(text.contains("Recording: Untitled"));
        assert!(text.contains("Transcript: none"));
        assert!(text.ends_with("Available qualities: no data"));
    }
}
