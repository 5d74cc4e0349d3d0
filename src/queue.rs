use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

/// Upper bound on the persisted `last_error` diagnostic.
pub const LAST_ERROR_MAX_CHARS: usize = 800;

/// The two work queues the scheduler fair-shares between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Remote thesis repository, enumerated by integer registro IDs.
    Primary,
    /// Local TFJA corpus; entries carry their payload inline.
    Secondary,
}

impl QueueId {
    pub fn queue_collection(self) -> &'static str {
        match self {
            QueueId::Primary => "thesis_queue",
            QueueId::Secondary => "tfja_queue",
        }
    }

    pub fn artifact_collection(self) -> &'static str {
        match self {
            QueueId::Primary => "theses",
            QueueId::Secondary => "tfja_documents",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QueueId::Primary => "primary",
            QueueId::Secondary => "secondary",
        }
    }
}

/// Lifecycle state of one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Pending,
    Processing,
    Completed,
    Error,
    Deferred,
    Unavailable,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Processing => "processing",
            QueueState::Completed => "completed",
            QueueState::Error => "error",
            QueueState::Deferred => "deferred",
            QueueState::Unavailable => "unavailable",
        }
    }
}

/// Inline document carried by secondary-queue entries (no upstream fetch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryPayload {
    pub rubro: String,
    pub texto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anio: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mes: Option<String>,
}

/// One durable unit of work.
///
/// Invariants enforced by every store transition:
/// - `claimed_at` is present iff `state == Processing`;
/// - `next_run_at` is present iff `state == Deferred`;
/// - `attempts` only ever grows (one increment per successful claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Natural per-source identifier, stored as the document key.
    #[serde(rename = "_id")]
    pub key: String,
    pub state: QueueState,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errored_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SecondaryPayload>,
}

impl QueueEntry {
    /// Fresh pending entry, as written by the seeder or a corpus loader.
    pub fn pending(key: impl Into<String>, payload: Option<SecondaryPayload>) -> Self {
        Self {
            key: key.into(),
            state: QueueState::Pending,
            attempts: 0,
            created_at: DateTime::now(),
            claimed_at: None,
            next_run_at: None,
            last_error: None,
            completed_at: None,
            errored_at: None,
            deferred_at: None,
            unavailable_at: None,
            payload,
        }
    }
}

/// Bound a diagnostic message for persistence.
///
/// Counts chars, not bytes, so multi-byte input cannot split a codepoint.
pub fn truncate_error(message: &str) -> String {
    let mut out: String = message.chars().take(LAST_ERROR_MAX_CHARS).collect();
    if out.len() < message.len() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_error_keeps_short_messages() {
        assert_eq!(truncate_error("HTTP 404"), "HTTP 404");
    }

    #[test]
    fn truncate_error_bounds_long_messages() {
        let long = "x".repeat(2000);
        let out = truncate_error(&long);
        assert_eq!(out.chars().count(), LAST_ERROR_MAX_CHARS + 3);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        let long = "é".repeat(LAST_ERROR_MAX_CHARS + 10);
        let out = truncate_error(&long);
        assert_eq!(out.chars().filter(|c| *c == 'é').count(), LAST_ERROR_MAX_CHARS);
    }

    #[test]
    fn state_serializes_lowercase() {
        let s = serde_json::to_string(&QueueState::Deferred).unwrap();
        assert_eq!(s, "\"deferred\"");
    }
}
