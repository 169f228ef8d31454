//! Activity log sink: structured send/delivery events for external consumers.

use hive_protocol::{AgentMode, DeliveryId, Role};

/// One structured activity record.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    /// What happened: `trigger`, `delivery_ack`, `delivery_timeout`,
    /// `recovery_alert`.
    pub action: &'static str,
    pub recipients: Vec<Role>,
    /// First characters of the payload, for operators scanning the log.
    pub preview: String,
    pub sender_role: Option<Role>,
    pub mode: Option<AgentMode>,
    pub delivery_id: Option<DeliveryId>,
}

/// Where activity records go. The engine emits; hosts decide storage.
pub trait ActivitySink: Send + Sync {
    fn emit(&self, event: ActivityEvent);
}

/// Default sink: structured tracing events, which land in the host's
/// JSON log file.
pub struct TracingActivitySink;

impl ActivitySink for TracingActivitySink {
    fn emit(&self, event: ActivityEvent) {
        tracing::info!(
            event = "engine.activity",
            action = event.action,
            recipients = ?event.recipients,
            preview = %event.preview,
            sender_role = ?event.sender_role,
            mode = ?event.mode,
            delivery_id = ?event.delivery_id,
        );
    }
}

/// Truncate a payload to a log-safe preview.
pub fn preview_of(body: &str) -> String {
    const PREVIEW_LEN: usize = 80;
    let single_line = body.replace(['\r', '\n'], " ");
    let trimmed = single_line.trim();
    if trimmed.chars().count() <= PREVIEW_LEN {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(PREVIEW_LEN).collect();
        format!("{cut}…")
    }
}
