//! Mailbox file reading: encoding detection, normalization, header parsing,
//! and atomic clearing.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::errors::EngineError;

/// Marker requesting a per-sender sequence-cursor reset when `seq == 1`.
pub const SESSION_BANNER: &str = "# HIVEMIND SESSION:";

/// Message header parsed from the first logical line, when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sender role, lowercased from the uppercase wire form.
    pub sender: String,
    pub seq: u64,
}

/// A normalized mailbox payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Optional `(SENDER #N):` header. Messages without it skip dedup.
    pub header: Option<MessageHeader>,
    /// Whether the body carries the session banner marker.
    pub session_banner: bool,
    /// The full normalized text, delivered as-is (header included, so the
    /// recipient sees who is talking).
    pub body: String,
}

/// Read a trigger file, tolerating a writer that hasn't flushed yet.
///
/// Small bounded retry loop; a persistently-empty file is returned as-is —
/// the caller decides whether emptiness is noise or real.
pub async fn read_trigger_with_retry(path: &Path) -> Result<Vec<u8>, EngineError> {
    const ATTEMPTS: u32 = 3;
    const RETRY_DELAY: Duration = Duration::from_millis(50);

    let mut content = Vec::new();
    for attempt in 0..ATTEMPTS {
        content = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(EngineError::Io(e)),
        };
        if !content.is_empty() {
            return Ok(content);
        }
        if attempt + 1 < ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    Ok(content)
}

/// Decode mailbox bytes: UTF-16LE with BOM (`FF FE`), UTF-8 with or without
/// BOM. Lossy on invalid sequences.
pub fn decode_bytes(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    let without_bom = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    String::from_utf8_lossy(without_bom).into_owned()
}

/// Strip NULs and control characters except CR/LF/TAB. Idempotent.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|&c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Parse the optional `(SENDER #N):` header and the session banner marker.
pub fn parse_message(text: &str) -> ParsedMessage {
    let header = text.lines().next().and_then(parse_header_line);
    ParsedMessage {
        header,
        session_banner: text.contains(SESSION_BANNER),
        body: text.to_string(),
    }
}

fn parse_header_line(line: &str) -> Option<MessageHeader> {
    let captures = header_regex().captures(line)?;
    let sender = captures.get(1)?.as_str().to_lowercase();
    let seq: u64 = captures.get(2)?.as_str().parse().ok()?;
    if seq == 0 {
        return None;
    }
    Some(MessageHeader { sender, seq })
}

fn header_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^\(([A-Z][A-Z0-9_-]*) #(\d+)\):")
            .unwrap_or_else(|_| unreachable!())
    })
}

/// Clear a trigger file by atomically replacing it with an empty file.
///
/// This intentionally re-fires the watcher; the router suppresses the
/// resulting empty read via its post-clear window.
pub fn clear_trigger_file(path: &Path) -> Result<(), EngineError> {
    let temp_path = path.with_extension("txt.tmp");
    if let Err(e) = std::fs::write(&temp_path, b"") {
        return Err(EngineError::Io(e));
    }
    if let Err(e) = std::fs::rename(&temp_path, path) {
        if let Err(cleanup) = std::fs::remove_file(&temp_path) {
            debug!(
                event = "engine.router.clear_temp_cleanup_failed",
                path = %temp_path.display(),
                error = %cleanup,
            );
        }
        return Err(EngineError::Io(e));
    }
    Ok(())
}
