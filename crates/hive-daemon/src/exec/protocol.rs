//! Parser for the exec-mode child's structured event stream.
//!
//! Exec children emit newline-delimited self-describing JSON records. The
//! daemon translates them into the normalized activity taxonomy, captures
//! the session identifier, and sanitizes all text before it reaches
//! subscribers. Unrecognized records are debug-logged and discarded.

use hive_protocol::ActivityKind;
use serde::Deserialize;
use tracing::debug;

/// Raw exec event record (serde). `#[serde(default)]` keeps the parser
/// forward-compatible with unknown/added fields.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawExecRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub thread_id: Option<String>,
    pub item: Option<RawExecItem>,
    pub delta: Option<String>,
}

/// Raw item payload — only the fields we classify on.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawExecItem {
    pub item_type: String,
}

/// What one exec record means to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecSignal {
    /// Emit a semantic activity event.
    Activity(ActivityKind),
    /// The child announced its session id; persist it for resume-by-id.
    Session(String),
    /// Record carries no signal for subscribers.
    Silent,
}

/// Classify one sanitized NDJSON line.
///
/// Non-JSON lines are silent (the raw bytes are still forwarded as data).
pub fn classify_line(line: &str) -> ExecSignal {
    let record: RawExecRecord = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            debug!(
                event = "daemon.exec.unparsed_line",
                error = %e,
            );
            return ExecSignal::Silent;
        }
    };
    classify_record(&record)
}

fn classify_record(record: &RawExecRecord) -> ExecSignal {
    match record.record_type.as_str() {
        "thread.started" => match &record.thread_id {
            Some(id) if !id.is_empty() => ExecSignal::Session(id.clone()),
            _ => ExecSignal::Silent,
        },
        "turn.started" => ExecSignal::Activity(ActivityKind::Start),
        "turn.completed" => ExecSignal::Activity(ActivityKind::Ready),
        "item.started" => {
            let kind = match record.item.as_ref().map(|i| i.item_type.as_str()) {
                Some("tool_call") => ActivityKind::Tool,
                Some("command_execution") => ActivityKind::Command,
                Some("file_change") => ActivityKind::File,
                _ => ActivityKind::Start,
            };
            ExecSignal::Activity(kind)
        }
        "item.completed" => ExecSignal::Activity(ActivityKind::Done),
        "item.output_delta" | "response.output_text.delta" => {
            ExecSignal::Activity(ActivityKind::Stream)
        }
        other => {
            debug!(event = "daemon.exec.unknown_record", record_type = other);
            ExecSignal::Silent
        }
    }
}

/// Strip byte-order marks, bidirectional-control code points, and
/// ANSI-unsafe characters before forwarding text to subscribers.
///
/// Keeps CR/LF/TAB; drops all other C0 controls, ESC, the C1 range, and the
/// Unicode bidi controls an adversarial child could use to reorder what an
/// operator sees. Idempotent: sanitizing twice equals sanitizing once.
pub fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !is_unsafe_char(c))
        .collect()
}

fn is_unsafe_char(c: char) -> bool {
    match c {
        '\n' | '\r' | '\t' => false,
        // C0 controls (incl. NUL and ESC) and DEL
        '\u{0000}'..='\u{001F}' | '\u{007F}' => true,
        // C1 controls
        '\u{0080}'..='\u{009F}' => true,
        // Byte-order mark / zero-width no-break space
        '\u{FEFF}' => true,
        // Bidirectional embedding/override/isolate controls and marks
        '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' => true,
        '\u{200E}' | '\u{200F}' | '\u{061C}' => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_started_captures_session() {
        let sig = classify_line(r#"{"type":"thread.started","thread_id":"th_0195f"}"#);
        assert_eq!(sig, ExecSignal::Session("th_0195f".to_string()));
    }

    #[test]
    fn test_thread_started_without_id_is_silent() {
        let sig = classify_line(r#"{"type":"thread.started"}"#);
        assert_eq!(sig, ExecSignal::Silent);
    }

    #[test]
    fn test_turn_lifecycle() {
        assert_eq!(
            classify_line(r#"{"type":"turn.started"}"#),
            ExecSignal::Activity(ActivityKind::Start)
        );
        assert_eq!(
            classify_line(r#"{"type":"turn.completed"}"#),
            ExecSignal::Activity(ActivityKind::Ready)
        );
    }

    #[test]
    fn test_item_started_maps_descriptors() {
        assert_eq!(
            classify_line(r#"{"type":"item.started","item":{"item_type":"tool_call"}}"#),
            ExecSignal::Activity(ActivityKind::Tool)
        );
        assert_eq!(
            classify_line(
                r#"{"type":"item.started","item":{"item_type":"command_execution"}}"#
            ),
            ExecSignal::Activity(ActivityKind::Command)
        );
        assert_eq!(
            classify_line(r#"{"type":"item.started","item":{"item_type":"file_change"}}"#),
            ExecSignal::Activity(ActivityKind::File)
        );
        assert_eq!(
            classify_line(r#"{"type":"item.started","item":{"item_type":"message"}}"#),
            ExecSignal::Activity(ActivityKind::Start)
        );
        assert_eq!(
            classify_line(r#"{"type":"item.started"}"#),
            ExecSignal::Activity(ActivityKind::Start)
        );
    }

    #[test]
    fn test_item_completed_is_done() {
        assert_eq!(
            classify_line(r#"{"type":"item.completed","item":{"item_type":"tool_call"}}"#),
            ExecSignal::Activity(ActivityKind::Done)
        );
    }

    #[test]
    fn test_deltas_are_stream() {
        assert_eq!(
            classify_line(r#"{"type":"item.output_delta","delta":"par"}"#),
            ExecSignal::Activity(ActivityKind::Stream)
        );
        assert_eq!(
            classify_line(r#"{"type":"response.output_text.delta","delta":"tial"}"#),
            ExecSignal::Activity(ActivityKind::Stream)
        );
    }

    #[test]
    fn test_unknown_record_is_silent() {
        assert_eq!(
            classify_line(r#"{"type":"usage.updated","tokens":42}"#),
            ExecSignal::Silent
        );
    }

    #[test]
    fn test_malformed_json_is_silent() {
        assert_eq!(classify_line("not json at all"), ExecSignal::Silent);
        assert_eq!(classify_line(""), ExecSignal::Silent);
    }

    #[test]
    fn test_sanitize_strips_bidi_controls() {
        let input = "safe\u{202E}evil\u{202C}text\u{2066}x\u{2069}";
        assert_eq!(sanitize_text(input), "safeeviltextx");
    }

    #[test]
    fn test_sanitize_strips_ansi_and_nul() {
        let input = "a\u{001B}[31mred\u{0000}b";
        assert_eq!(sanitize_text(input), "a[31mredb");
    }

    #[test]
    fn test_sanitize_keeps_whitespace_controls() {
        let input = "line1\nline2\r\n\ttabbed";
        assert_eq!(sanitize_text(input), input);
    }

    #[test]
    fn test_sanitize_strips_bom() {
        assert_eq!(sanitize_text("\u{FEFF}hello"), "hello");
    }

    #[test]
    fn test_sanitize_idempotent() {
        let input = "x\u{202A}y\u{009F}z\u{001B}w\u{200F}";
        let once = sanitize_text(input);
        assert_eq!(sanitize_text(&once), once);
    }
}
