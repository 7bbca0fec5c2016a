//! Durable queue entries and their delivery lifecycle.
//!
//! An entry records one deferred write, the action tag it carries, and how
//! delivery has gone so far. Entries whose tag this version does not dispatch
//! are kept intact so an older client's queue survives an upgrade round trip.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{
    calculate_retry_delay, generate_jitter, AppError, ErrorKind, UnixTimeMs,
    MAX_DELIVERY_ATTEMPTS,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueuedAction {
    CreateReport,
    UpdateReport,
    CreateVerification,
    /// A tag written by a newer or older client. Held in the queue untouched.
    Unrecognized(String),
}

impl QueuedAction {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::CreateReport => "create_report",
            Self::UpdateReport => "update_report",
            Self::CreateVerification => "create_verification",
            Self::Unrecognized(tag) => tag,
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "create_report" => Self::CreateReport,
            "update_report" => Self::UpdateReport,
            "create_verification" => Self::CreateVerification,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    /// Only report creation is dispatched today. The other tags are reserved
    /// and ride along in the queue without attempt accounting.
    #[must_use]
    pub const fn is_dispatchable(&self) -> bool {
        matches!(self, Self::CreateReport)
    }
}

impl Serialize for QueuedAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for QueuedAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag.is_empty() {
            return Err(D::Error::custom("queued action tag must not be empty"));
        }
        Ok(Self::from_tag(&tag))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryError {
    pub code: String,
    pub message: String,
    pub http_status: Option<u16>,
    pub is_permanent: bool,
}

impl DeliveryError {
    #[must_use]
    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            code: ErrorKind::Network.code().to_string(),
            message: message.into(),
            http_status: None,
            is_permanent: false,
        }
    }

    #[must_use]
    pub fn server_error(status: u16, body: Option<&[u8]>) -> Self {
        let error = AppError::from_http_status(status, body);
        Self {
            code: error.code().to_string(),
            message: error.message,
            http_status: Some(status),
            // 4xx means the payload itself is refused and retrying cannot
            // help. 408 and 429 are the transient exceptions.
            is_permanent: matches!(status, 400..=499) && status != 408 && status != 429,
        }
    }

    #[must_use]
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            http_status: None,
            is_permanent: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    #[default]
    Pending,
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub action: QueuedAction,
    pub payload: serde_json::Value,
    pub timestamp: UnixTimeMs,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub not_before: Option<UnixTimeMs>,
    #[serde(default)]
    pub last_error: Option<DeliveryError>,
    #[serde(default)]
    pub state: EntryState,
}

impl QueueEntry {
    #[must_use]
    pub fn new(action: QueuedAction, payload: serde_json::Value, timestamp: UnixTimeMs) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            payload,
            timestamp,
            attempts: 0,
            not_before: None,
            last_error: None,
            state: EntryState::Pending,
        }
    }

    /// Whether the backoff window has elapsed.
    #[must_use]
    pub fn is_ready(&self, now: UnixTimeMs) -> bool {
        self.not_before.is_none_or(|t| !now.is_before(t))
    }

    #[must_use]
    pub fn is_dead_lettered(&self) -> bool {
        self.state == EntryState::DeadLettered
    }

    #[must_use]
    pub fn is_dispatchable(&self, now: UnixTimeMs) -> bool {
        self.action.is_dispatchable() && !self.is_dead_lettered() && self.is_ready(now)
    }

    /// Records a failed delivery attempt. Permanent rejections and entries
    /// that have exhausted their retry budget go to the dead-letter state,
    /// everything else gets an exponential backoff window.
    pub fn mark_failed(&mut self, error: DeliveryError, now: UnixTimeMs) {
        self.attempts = self.attempts.saturating_add(1);

        if error.is_permanent || self.attempts >= MAX_DELIVERY_ATTEMPTS {
            self.state = EntryState::DeadLettered;
            self.not_before = None;
        } else {
            let delay = calculate_retry_delay(self.attempts, generate_jitter());
            self.not_before = Some(now.add_millis(delay));
        }

        self.last_error = Some(error);
    }
}

/// Per-pass accounting, surfaced to the shell after every replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushSummary {
    pub attempted: u32,
    pub delivered: u32,
    pub failed: u32,
    pub deferred: u32,
    pub unsupported: u32,
    pub dead_lettered: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("offline queue is full ({max} entries)")]
    Full { max: usize },
}

impl From<QueueError> for AppError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Full { max } => {
                Self::new(ErrorKind::QuotaExceeded, "Too many pending reports")
                    .with_internal(format!("offline queue at capacity ({max})"))
            }
        }
    }
}
