//! The headless core. Holds all report and queue state, drives replay of
//! buffered submissions, and renders a serializable view for the shells.

use std::collections::VecDeque;

use crux_core::App as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::capabilities::{Capabilities, StorageKey, StorageOutput, StorageResult};
use crate::model::{FlushState, Model, RemoteConfig, SubmissionState};
use crate::queue::{DeliveryError, FlushSummary, QueueEntry, QueuedAction};
use crate::report::{CaseId, RemoteReportRow, ReportDraft, ReportQuery};
use crate::{
    format_time_ago, AppError, ErrorKind, UnixTimeMs, DESCRIPTION_PREVIEW_LENGTH,
};

pub type HttpResponse = crux_http::Response<Vec<u8>>;
pub type HttpResult = crux_http::Result<HttpResponse>;

#[derive(Debug, Serialize, Deserialize)]
pub enum Event {
    AppStarted,
    RemoteConfigured {
        base_url: String,
        anon_key: String,
    },
    NetworkStatusChanged {
        online: bool,
    },
    SubmitReport(Box<ReportDraft>),
    #[serde(skip)]
    SubmitResponse {
        case_id: CaseId,
        result: HttpResult,
    },
    FlushRequested,
    #[serde(skip)]
    DeliveryResponse {
        entry_id: Uuid,
        result: HttpResult,
    },
    RefreshRequested,
    #[serde(skip)]
    RefreshResponse(Box<HttpResult>),
    QueueHydrated(StorageResult),
    QueuePersisted(StorageResult),
    DismissError,
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AppStarted => "AppStarted",
            Self::RemoteConfigured { .. } => "RemoteConfigured",
            Self::NetworkStatusChanged { .. } => "NetworkStatusChanged",
            Self::SubmitReport(_) => "SubmitReport",
            Self::SubmitResponse { .. } => "SubmitResponse",
            Self::FlushRequested => "FlushRequested",
            Self::DeliveryResponse { .. } => "DeliveryResponse",
            Self::RefreshRequested => "RefreshRequested",
            Self::RefreshResponse(_) => "RefreshResponse",
            Self::QueueHydrated(_) => "QueueHydrated",
            Self::QueuePersisted(_) => "QueuePersisted",
            Self::DismissError => "DismissError",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u32,
    pub unsupported: u32,
    pub dead_lettered: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionView {
    Idle,
    Sending { case_id: String },
    Accepted { case_id: String },
    Queued { case_id: String },
}

impl From<&SubmissionState> for SubmissionView {
    fn from(state: &SubmissionState) -> Self {
        match state {
            SubmissionState::Idle => Self::Idle,
            SubmissionState::Sending { case_id, .. } => Self::Sending {
                case_id: case_id.to_string(),
            },
            SubmissionState::Accepted { case_id } => Self::Accepted {
                case_id: case_id.to_string(),
            },
            SubmissionState::Queued { case_id } => Self::Queued {
                case_id: case_id.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportListItem {
    pub case_id: String,
    pub need_type: String,
    pub description_preview: String,
    pub location: String,
    pub time_ago: String,
}

impl ReportListItem {
    fn from_row(row: &RemoteReportRow, now_ms: u64) -> Self {
        let description = row.description.as_deref().unwrap_or_default();
        let description_preview = if description.chars().count() > DESCRIPTION_PREVIEW_LENGTH {
            let truncated: String = description.chars().take(DESCRIPTION_PREVIEW_LENGTH).collect();
            format!("{truncated}...")
        } else {
            description.to_string()
        };

        Self {
            case_id: row.case_id.clone().unwrap_or_default(),
            need_type: row
                .need_type
                .map(|n| n.to_string())
                .unwrap_or_else(|| "other".to_string()),
            description_preview,
            location: row.location.clone().unwrap_or_default(),
            time_ago: row
                .created_at_ms()
                .map(|t| format_time_ago(t.as_millis(), now_ms))
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFacingError {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for UserFacingError {
    fn from(error: &AppError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.user_facing_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewModel {
    pub online: bool,
    pub is_refreshing: bool,
    pub queue: QueueCounts,
    pub last_flush: Option<FlushSummary>,
    pub submission: SubmissionView,
    pub reports: Vec<ReportListItem>,
    pub error: Option<UserFacingError>,
}

#[derive(Default)]
pub struct App;

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: Self::Event, model: &mut Self::Model, caps: &Self::Capabilities) {
        tracing::debug!(event = event.name(), "handling event");

        match event {
            Event::AppStarted => {
                caps.storage
                    .get(StorageKey::offline_queue(), Event::QueueHydrated);
                model.update_timestamp();
                caps.render.render();
            }

            Event::RemoteConfigured { base_url, anon_key } => {
                match RemoteConfig::new(&base_url, anon_key) {
                    Ok(config) => model.config = config,
                    Err(error) => {
                        model.set_error(
                            AppError::new(ErrorKind::Validation, "Invalid server configuration")
                                .with_internal(error.to_string()),
                        );
                    }
                }
                caps.render.render();
            }

            Event::NetworkStatusChanged { online } => {
                let was_offline = !model.network_online;
                model.network_online = online;
                model.update_timestamp();
                caps.render.render();

                if online && was_offline {
                    tracing::info!("connectivity restored");
                    self.update(Event::FlushRequested, model, caps);
                    if !model.is_refreshing {
                        model.is_refreshing = true;
                        Self::send_report_list(model, caps);
                    }
                }
            }

            Event::SubmitReport(draft) => {
                // One submission at a time: a response is settled against the
                // `Sending` slot, so it must not be overwritten mid-flight.
                if matches!(model.submission, SubmissionState::Sending { .. }) {
                    model.set_error(AppError::new(
                        ErrorKind::Validation,
                        "Please wait for the current report to finish sending.",
                    ));
                    caps.render.render();
                    return;
                }

                let case_id = draft.case_id.clone();
                let payload = draft.to_payload();

                if model.network_online {
                    model.submission = SubmissionState::Sending {
                        case_id: case_id.clone(),
                        payload: payload.clone(),
                    };
                    let result = Self::send_report_insert(model, caps, &payload, move |result| {
                        Event::SubmitResponse { case_id, result }
                    });
                    if let Err(error) = result {
                        model.submission = SubmissionState::Idle;
                        model.set_error(error);
                    }
                } else {
                    let entry =
                        QueueEntry::new(QueuedAction::CreateReport, payload, UnixTimeMs::now());
                    match model.queue.enqueue(entry) {
                        Ok(()) => {
                            tracing::info!(case_id = %case_id, "report queued for later delivery");
                            model.submission = SubmissionState::Queued { case_id };
                            Self::persist_queue(model, caps);
                        }
                        Err(error) => model.set_error(error.into()),
                    }
                }
                caps.render.render();
            }

            Event::SubmitResponse { case_id, result } => {
                // crux_http surfaces non-2xx statuses as `Error::Http`, so an
                // `Ok` here is always a success response.
                match result {
                    Ok(mut response) => {
                        tracing::info!(case_id = %case_id, "report accepted");
                        model.submission = SubmissionState::Accepted { case_id };
                        if let Some(body) = response.take_body() {
                            Self::prepend_inserted_rows(model, &body);
                        }
                        model.update_timestamp();
                    }
                    Err(crux_http::Error::Http(error)) => {
                        Self::settle_failed_submission(
                            model,
                            caps,
                            case_id,
                            DeliveryError::server_error(
                                u16::from(error.code),
                                error.body.as_deref(),
                            ),
                        );
                    }
                    Err(error) => {
                        Self::settle_failed_submission(
                            model,
                            caps,
                            case_id,
                            DeliveryError::network_error(error.to_string()),
                        );
                    }
                }
                caps.render.render();
            }

            Event::FlushRequested => {
                if !model.network_online {
                    tracing::debug!("flush requested while offline, skipping");
                    return;
                }
                if !model.queue.is_hydrated() {
                    model.flush_when_hydrated = true;
                    return;
                }
                if let FlushState::InFlight { rerun, .. } = &mut model.flush {
                    // One pass at a time. Remember the request and run a
                    // single follow-up pass when this one finishes.
                    *rerun = true;
                    return;
                }
                if model.queue.is_empty() {
                    return;
                }

                let now = UnixTimeMs::now();
                let remaining: VecDeque<Uuid> = model.queue.dispatchable_ids(now).into();
                let summary = FlushSummary {
                    deferred: count(model.queue.pending_count().saturating_sub(remaining.len())),
                    unsupported: count(model.queue.unsupported_count()),
                    dead_lettered: count(model.queue.dead_letter_count()),
                    ..FlushSummary::default()
                };

                tracing::info!(
                    eligible = remaining.len(),
                    total = model.queue.len(),
                    "starting offline queue pass"
                );
                model.flush = FlushState::InFlight {
                    remaining,
                    summary,
                    rerun: false,
                };
                self.dispatch_next(model, caps);
            }

            Event::DeliveryResponse { entry_id, result } => {
                let now = UnixTimeMs::now();
                match result {
                    // Non-2xx statuses arrive as `Error::Http`, so `Ok` means
                    // the server accepted the write.
                    Ok(_) => {
                        if model.queue.remove(&entry_id).is_some() {
                            if let FlushState::InFlight { summary, .. } = &mut model.flush {
                                summary.delivered += 1;
                            }
                        }
                    }
                    Err(crux_http::Error::Http(error)) => {
                        Self::record_delivery_failure(
                            model,
                            entry_id,
                            DeliveryError::server_error(
                                u16::from(error.code),
                                error.body.as_deref(),
                            ),
                            now,
                        );
                    }
                    Err(error) => {
                        Self::record_delivery_failure(
                            model,
                            entry_id,
                            DeliveryError::network_error(error.to_string()),
                            now,
                        );
                    }
                }

                if model.network_online {
                    self.dispatch_next(model, caps);
                } else {
                    tracing::warn!("connectivity lost mid-pass, stopping replay");
                    self.finish_pass(model, caps);
                }
            }

            Event::RefreshRequested => {
                self.update(Event::FlushRequested, model, caps);
                if model.network_online && !model.is_refreshing {
                    model.is_refreshing = true;
                    Self::send_report_list(model, caps);
                    caps.render.render();
                }
            }

            Event::RefreshResponse(result) => {
                model.is_refreshing = false;
                match *result {
                    Ok(mut response) => match response.take_body() {
                        Some(body) => {
                            match serde_json::from_slice::<Vec<RemoteReportRow>>(&body) {
                                Ok(rows) => {
                                    model.reports = rows;
                                    model.update_timestamp();
                                }
                                Err(error) => {
                                    tracing::warn!(%error, "could not decode reports feed");
                                }
                            }
                        }
                        None => tracing::warn!("reports feed response had no body"),
                    },
                    Err(error) => tracing::warn!(%error, "reports feed request failed"),
                }
                caps.render.render();
            }

            Event::QueueHydrated(result) => {
                match result {
                    Ok(StorageOutput::Value(raw)) => model.queue.hydrate(raw.as_deref()),
                    Ok(StorageOutput::Written) => {
                        tracing::warn!("unexpected storage output during hydration");
                        model.queue.hydrate(None);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "offline queue unreadable, starting empty");
                        model.queue.hydrate(None);
                    }
                }

                let deferred_flush = std::mem::take(&mut model.flush_when_hydrated);
                model.update_timestamp();
                caps.render.render();

                if (deferred_flush || !model.queue.is_empty()) && model.network_online {
                    self.update(Event::FlushRequested, model, caps);
                }
            }

            Event::QueuePersisted(result) => match result {
                Ok(StorageOutput::Written) => {
                    tracing::debug!("offline queue persisted");
                }
                Ok(StorageOutput::Value(_)) => {
                    tracing::warn!("unexpected storage output after queue write");
                }
                Err(error) => {
                    model.set_error(
                        AppError::new(ErrorKind::Storage, "Could not save the offline queue")
                            .with_internal(error.to_string()),
                    );
                    caps.render.render();
                }
            },

            Event::DismissError => {
                model.clear_error();
                caps.render.render();
            }
        }
    }

    fn view(&self, model: &Self::Model) -> Self::ViewModel {
        ViewModel {
            online: model.network_online,
            is_refreshing: model.is_refreshing,
            queue: QueueCounts {
                pending: count(model.queue.pending_count()),
                unsupported: count(model.queue.unsupported_count()),
                dead_lettered: count(model.queue.dead_letter_count()),
            },
            last_flush: model.last_flush,
            submission: SubmissionView::from(&model.submission),
            reports: model
                .reports
                .iter()
                .map(|row| ReportListItem::from_row(row, model.view_timestamp_ms))
                .collect(),
            error: model.active_error.as_ref().map(UserFacingError::from),
        }
    }
}

impl App {
    /// Writes the current queue back to durable storage.
    fn persist_queue(model: &Model, caps: &Capabilities) {
        match model.queue.encode() {
            Ok(raw) => {
                caps.storage
                    .set(StorageKey::offline_queue(), raw, Event::QueuePersisted);
            }
            Err(error) => {
                tracing::error!(%error, "could not encode offline queue");
            }
        }
    }

    fn send_report_insert<F>(
        model: &Model,
        caps: &Capabilities,
        payload: &Value,
        make_event: F,
    ) -> Result<(), AppError>
    where
        F: FnOnce(HttpResult) -> Event + Send + 'static,
    {
        let body = serde_json::to_vec(payload).map_err(|e| {
            AppError::new(ErrorKind::Serialization, "Could not encode the report")
                .with_internal(e.to_string())
        })?;

        let auth = format!("Bearer {}", model.config.anon_key());
        caps.http
            .post(model.config.reports_endpoint())
            .header("apikey", model.config.anon_key())
            .header("Authorization", auth.as_str())
            .header("Prefer", "return=representation")
            .header("Content-Type", "application/json")
            .body_bytes(body)
            .send(make_event);
        Ok(())
    }

    fn send_report_list(model: &Model, caps: &Capabilities) {
        let mut url = match url::Url::parse(&model.config.reports_endpoint()) {
            Ok(url) => url,
            Err(error) => {
                tracing::error!(%error, "invalid reports endpoint");
                return;
            }
        };
        url.query_pairs_mut()
            .extend_pairs(ReportQuery::default().to_query_pairs());

        let auth = format!("Bearer {}", model.config.anon_key());
        caps.http
            .get(url.as_str())
            .header("apikey", model.config.anon_key())
            .header("Authorization", auth.as_str())
            .send(|result| Event::RefreshResponse(Box::new(result)));
    }

    /// A direct submission failed. Transient failures fall back to the queue
    /// with the attempt recorded; permanent rejections are surfaced instead
    /// of buffering a payload the server will keep refusing.
    fn settle_failed_submission(
        model: &mut Model,
        caps: &Capabilities,
        case_id: CaseId,
        error: DeliveryError,
    ) {
        let payload = match std::mem::take(&mut model.submission) {
            SubmissionState::Sending { payload, .. } => payload,
            other => {
                tracing::warn!(case_id = %case_id, "submit response without a pending submission");
                model.submission = other;
                return;
            }
        };

        if error.is_permanent {
            tracing::warn!(case_id = %case_id, code = %error.code, "report rejected");
            let app_error = match error.http_status {
                Some(status) => AppError::from_http_status(status, None),
                None => AppError::new(ErrorKind::Unknown, error.message),
            };
            model.set_error(app_error);
            return;
        }

        tracing::info!(case_id = %case_id, code = %error.code, "submission failed, queueing");
        let now = UnixTimeMs::now();
        let mut entry = QueueEntry::new(QueuedAction::CreateReport, payload, now);
        entry.mark_failed(error, now);
        match model.queue.enqueue(entry) {
            Ok(()) => {
                model.submission = SubmissionState::Queued { case_id };
                Self::persist_queue(model, caps);
            }
            Err(error) => model.set_error(error.into()),
        }
    }

    fn prepend_inserted_rows(model: &mut Model, body: &[u8]) {
        match serde_json::from_slice::<Vec<RemoteReportRow>>(body) {
            Ok(rows) => {
                for row in rows.into_iter().rev() {
                    model.reports.insert(0, row);
                }
            }
            Err(error) => tracing::warn!(%error, "could not decode insert representation"),
        }
    }

    fn record_delivery_failure(
        model: &mut Model,
        entry_id: Uuid,
        error: DeliveryError,
        now: UnixTimeMs,
    ) {
        tracing::warn!(entry = %entry_id, code = %error.code, "queued delivery failed");
        let Some(entry) = model.queue.entry_mut(&entry_id) else {
            return;
        };
        entry.mark_failed(error, now);
        let dead = entry.is_dead_lettered();

        if let FlushState::InFlight { summary, .. } = &mut model.flush {
            summary.failed += 1;
            if dead {
                summary.dead_lettered += 1;
            }
        }
    }

    /// Takes the next eligible entry off the pass and sends it. Entries that
    /// vanished or stopped being dispatchable since the pass started are
    /// skipped in place.
    fn dispatch_next(&self, model: &mut Model, caps: &Capabilities) {
        loop {
            let next = match &mut model.flush {
                FlushState::InFlight { remaining, .. } => remaining.pop_front(),
                FlushState::Idle => return,
            };

            let Some(entry_id) = next else {
                self.finish_pass(model, caps);
                return;
            };

            let Some(entry) = model.queue.entry(&entry_id) else {
                continue;
            };
            if !entry.action.is_dispatchable() || entry.is_dead_lettered() {
                continue;
            }
            let payload = entry.payload.clone();

            if let FlushState::InFlight { summary, .. } = &mut model.flush {
                summary.attempted += 1;
            }

            let sent = Self::send_report_insert(model, caps, &payload, move |result| {
                Event::DeliveryResponse { entry_id, result }
            });
            match sent {
                Ok(()) => return,
                Err(error) => {
                    tracing::error!(%error, "could not encode queued payload");
                    let now = UnixTimeMs::now();
                    Self::record_delivery_failure(
                        model,
                        entry_id,
                        DeliveryError::permanent(error.code(), error.message.clone()),
                        now,
                    );
                }
            }
        }
    }

    /// Closes out the active pass, persists the surviving queue, and kicks
    /// off one follow-up pass if anyone asked for a flush mid-pass.
    fn finish_pass(&self, model: &mut Model, caps: &Capabilities) {
        let FlushState::InFlight { summary, rerun, .. } = std::mem::take(&mut model.flush) else {
            return;
        };

        tracing::info!(
            attempted = summary.attempted,
            delivered = summary.delivered,
            failed = summary.failed,
            deferred = summary.deferred,
            unsupported = summary.unsupported,
            dead_lettered = summary.dead_lettered,
            "offline queue pass complete"
        );

        Self::persist_queue(model, caps);
        model.last_flush = Some(summary);
        model.update_timestamp();
        caps.render.render();

        if rerun {
            self.update(Event::FlushRequested, model, caps);
        }
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
