use crate::models::HookEvent;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

/// Parse one line of the hook event log.
///
/// Returns `None` for blank or malformed lines; one corrupt line never
/// aborts processing of the remainder of the file.
pub fn parse_line(line: &str) -> Option<HookEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<HookEvent>(line) {
        Ok(event) => {
            if event.project_name.is_empty() {
                log::debug!("Skipping hook event with empty project name");
                return None;
            }
            Some(event)
        }
        Err(e) => {
            log::debug!("Skipping malformed hook log line: {e}");
            None
        }
    }
}

/// Parse a full log body, skipping malformed lines individually.
pub fn parse_log(content: &str) -> Vec<HookEvent> {
    content.lines().filter_map(parse_line).collect()
}

/// Read and parse the hook event log. A missing file is an empty stream,
/// not an error; the hook process may simply not have written yet.
pub async fn read_events(path: &Path) -> Result<Vec<HookEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read hook log {}", path.display()))?;
    Ok(parse_log(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HookEventKind;

    fn line(kind: &str) -> String {
        format!(
            r#"{{"timestamp":"2025-07-04T10:00:00+02:00","project_name":"p","session_id":"s-1","event_type":"{kind}","data":{{}}}}"#
        )
    }

    #[test]
    fn parses_all_event_kinds() {
        assert_eq!(
            parse_line(&line("activity")).unwrap().event_type,
            HookEventKind::Activity
        );
        assert_eq!(
            parse_line(&line("stop")).unwrap().event_type,
            HookEventKind::Stop
        );
        assert_eq!(
            parse_line(&line("notification")).unwrap().event_type,
            HookEventKind::Notification
        );
    }

    #[test]
    fn offset_timestamps_normalize_to_utc() {
        let event = parse_line(&line("stop")).unwrap();
        assert_eq!(event.timestamp.to_rfc3339(), "2025-07-04T08:00:00+00:00");
    }

    #[test]
    fn rejects_unknown_event_kind() {
        assert!(parse_line(&line("resume")).is_none());
    }

    #[test]
    fn rejects_garbage_and_blank_lines() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
        assert!(parse_line("not json at all").is_none());
        assert!(parse_line(r#"{"project_name":"p"}"#).is_none());
    }

    #[test]
    fn corrupt_line_does_not_abort_the_stream() {
        let log = format!("{}\n{{{{broken\n{}\n", line("activity"), line("stop"));
        let events = parse_log(&log);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, HookEventKind::Activity);
        assert_eq!(events[1].event_type, HookEventKind::Stop);
    }

    #[test]
    fn event_specific_payload_is_preserved() {
        let raw = r#"{"timestamp":"2025-07-04T10:00:00Z","project_name":"p","session_id":"s","event_type":"notification","data":{"title":"done"}}"#;
        let event = parse_line(raw).unwrap();
        assert_eq!(event.data["title"], "done");
    }
}
