use std::collections::VecDeque;
use std::fmt;

use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::queue::FlushSummary;
use crate::report::{CaseId, RemoteReportRow};
use crate::store::QueueStore;
use crate::{AppError, UnixTimeMs};

const DEFAULT_SUPABASE_URL: &str = "https://aidlink.supabase.co";
const DEFAULT_SUPABASE_ANON_KEY: &str = "sb-anon-public-aidlink";
const REPORTS_TABLE: &str = "emergency_reports";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base url: {reason}")]
    InvalidBaseUrl { reason: String },

    #[error("anon key must not be empty")]
    EmptyAnonKey,
}

/// Connection details for the hosted Postgres REST gateway. The anon key is
/// a publishable credential but still kept out of Debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    base_url: Url,
    anon_key: String,
}

impl RemoteConfig {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, ConfigError> {
        let url = Url::parse(base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl {
                reason: format!("unsupported scheme: {}", url.scheme()),
            });
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidBaseUrl {
                reason: "missing host".to_string(),
            });
        }

        let anon_key = anon_key.into();
        if anon_key.trim().is_empty() {
            return Err(ConfigError::EmptyAnonKey);
        }

        Ok(Self {
            base_url: url,
            anon_key,
        })
    }

    #[must_use]
    pub fn reports_endpoint(&self) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/rest/v1/{REPORTS_TABLE}")
    }

    #[must_use]
    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url.as_str())
            .field("anon_key", &"<redacted>")
            .finish()
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        match Self::new(DEFAULT_SUPABASE_URL, DEFAULT_SUPABASE_ANON_KEY) {
            Ok(config) => config,
            Err(_) => unreachable!("compiled-in remote config is valid"),
        }
    }
}

/// Replay pass state. At most one pass runs at a time; a request arriving
/// mid-pass sets `rerun` so one follow-up pass starts when this one ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FlushState {
    #[default]
    Idle,
    InFlight {
        remaining: VecDeque<Uuid>,
        summary: FlushSummary,
        rerun: bool,
    },
}

impl FlushState {
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SubmissionState {
    #[default]
    Idle,
    Sending {
        case_id: CaseId,
        payload: Value,
    },
    Accepted {
        case_id: CaseId,
    },
    Queued {
        case_id: CaseId,
    },
}

#[derive(Debug)]
pub struct Model {
    pub config: RemoteConfig,
    pub network_online: bool,
    pub queue: QueueStore,
    pub flush: FlushState,
    /// Set when connectivity asked for a pass before hydration finished.
    pub flush_when_hydrated: bool,
    pub last_flush: Option<FlushSummary>,
    pub reports: Vec<RemoteReportRow>,
    pub submission: SubmissionState,
    pub is_refreshing: bool,
    pub active_error: Option<AppError>,
    pub view_timestamp_ms: u64,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            config: RemoteConfig::default(),
            network_online: true,
            queue: QueueStore::new(),
            flush: FlushState::Idle,
            flush_when_hydrated: false,
            last_flush: None,
            reports: Vec::new(),
            submission: SubmissionState::Idle,
            is_refreshing: false,
            active_error: None,
            view_timestamp_ms: 0,
        }
    }
}

impl Model {
    pub fn update_timestamp(&mut self) {
        self.view_timestamp_ms = UnixTimeMs::now().as_millis();
    }

    pub fn set_error(&mut self, error: AppError) {
        tracing::error!(code = error.code(), message = %error, "surfacing error");
        self.active_error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.active_error = None;
    }
}
