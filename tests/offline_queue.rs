use crux_core::testing::AppTester;
use crux_core::Request;
use crux_http::protocol::{HttpRequest, HttpResponse, HttpResult};

use aidlink_shared::capabilities::{StorageOperation, StorageOutput, StorageResult};
use aidlink_shared::queue::{QueueEntry, QueuedAction};
use aidlink_shared::report::{NeedType, ReportDraft};
use aidlink_shared::store::QueueStore;
use aidlink_shared::{App, Effect, Event, Model, UnixTimeMs, MAX_DELIVERY_ATTEMPTS};

fn storage_request(effects: &mut [Effect]) -> &mut Request<StorageOperation> {
    effects
        .iter_mut()
        .find_map(|effect| match effect {
            Effect::Storage(request) => Some(request),
            _ => None,
        })
        .expect("expected a storage effect")
}

fn http_request_with_method<'e>(
    effects: &'e mut [Effect],
    method: &str,
) -> &'e mut Request<HttpRequest> {
    effects
        .iter_mut()
        .find_map(|effect| match effect {
            Effect::Http(request) if request.operation.method == method => Some(request),
            _ => None,
        })
        .unwrap_or_else(|| panic!("expected an http {method} effect"))
}

fn http_effect_count(effects: &[Effect]) -> usize {
    effects
        .iter()
        .filter(|effect| matches!(effect, Effect::Http(_)))
        .count()
}

fn stored_queue(entries: Vec<QueueEntry>) -> String {
    let mut store = QueueStore::new();
    store.hydrate(None);
    for entry in entries {
        store.enqueue(entry).unwrap();
    }
    store.encode().unwrap()
}

fn report_entry(marker: u64) -> QueueEntry {
    QueueEntry::new(
        QueuedAction::CreateReport,
        serde_json::json!({ "case_id": format!("CASE-{marker}"), "marker": marker }),
        UnixTimeMs(marker),
    )
}

/// Starts the app and hydrates the queue from the given stored snapshot,
/// returning the effects produced by hydration.
fn start_hydrated(
    app: &AppTester<App, Effect>,
    model: &mut Model,
    stored: Option<String>,
) -> Vec<Effect> {
    let mut update = app.update(Event::AppStarted, model);
    let request = storage_request(&mut update.effects);
    let resolved = app
        .resolve(request, Ok(StorageOutput::Value(stored)))
        .expect("resolve hydration");

    let mut effects = Vec::new();
    for event in resolved.events {
        effects.extend(app.update(event, model).effects);
    }
    effects
}

fn marker_of(request: &Request<HttpRequest>) -> u64 {
    let body: serde_json::Value =
        serde_json::from_slice(&request.operation.body).expect("json body");
    body["marker"].as_u64().expect("marker field")
}

#[test]
fn corrupt_stored_queue_hydrates_empty() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let effects = start_hydrated(&app, &mut model, Some("{definitely not json".to_string()));

    assert!(model.queue.is_hydrated());
    assert!(model.queue.is_empty());
    assert_eq!(http_effect_count(&effects), 0);
}

#[test]
fn storage_read_failure_hydrates_empty() {
    use aidlink_shared::capabilities::StorageError;

    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let mut update = app.update(Event::AppStarted, &mut model);
    let request = storage_request(&mut update.effects);
    let error: StorageResult = Err(StorageError::Unavailable {
        reason: "private browsing".to_string(),
    });
    let resolved = app.resolve(request, error).expect("resolve hydration");
    for event in resolved.events {
        app.update(event, &mut model);
    }

    assert!(model.queue.is_hydrated());
    assert!(model.queue.is_empty());
}

#[test]
fn flush_before_hydration_produces_no_effects() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let update = app.update(Event::FlushRequested, &mut model);

    assert!(update.effects.is_empty());
}

#[test]
fn flush_while_offline_is_a_no_op() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    app.update(Event::NetworkStatusChanged { online: false }, &mut model);
    let stored = stored_queue(vec![report_entry(1)]);
    start_hydrated(&app, &mut model, Some(stored));
    assert_eq!(model.queue.len(), 1);

    let update = app.update(Event::FlushRequested, &mut model);

    assert!(update.effects.is_empty());
    assert_eq!(model.queue.len(), 1);
}

#[test]
fn hydrated_entries_drain_in_fifo_order() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let stored = stored_queue(vec![report_entry(1), report_entry(2), report_entry(3)]);
    let mut effects = start_hydrated(&app, &mut model, Some(stored));

    let mut delivered_markers = Vec::new();
    for _ in 0..3 {
        let request = http_request_with_method(&mut effects, "POST");
        delivered_markers.push(marker_of(request));
        let resolved = app
            .resolve(request, HttpResult::Ok(HttpResponse::status(201).build()))
            .expect("resolve delivery");

        effects = Vec::new();
        for event in resolved.events {
            effects.extend(app.update(event, &mut model).effects);
        }
    }

    assert_eq!(delivered_markers, vec![1, 2, 3]);
    assert!(model.queue.is_empty());

    let summary = model.last_flush.expect("pass summary");
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.failed, 0);
}

#[test]
fn failed_entry_keeps_its_place_and_backs_off() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let stored = stored_queue(vec![report_entry(1), report_entry(2), report_entry(3)]);
    let mut effects = start_hydrated(&app, &mut model, Some(stored));

    for expected_marker in [1, 2, 3] {
        let request = http_request_with_method(&mut effects, "POST");
        assert_eq!(marker_of(request), expected_marker);

        let response = if expected_marker == 2 {
            HttpResult::Ok(HttpResponse::status(500).build())
        } else {
            HttpResult::Ok(HttpResponse::status(201).build())
        };
        let resolved = app.resolve(request, response).expect("resolve delivery");

        effects = Vec::new();
        for event in resolved.events {
            effects.extend(app.update(event, &mut model).effects);
        }
    }

    assert_eq!(model.queue.len(), 1);
    let survivor = &model.queue.entries()[0];
    assert_eq!(survivor.timestamp, UnixTimeMs(2));
    assert_eq!(survivor.attempts, 1);
    assert!(survivor.not_before.is_some());
    assert!(!survivor.is_dead_lettered());

    let summary = model.last_flush.expect("pass summary");
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.failed, 1);

    // The survivor sits in its backoff window, so an immediate rerun defers
    // it without another delivery attempt.
    let update = app.update(Event::FlushRequested, &mut model);
    assert_eq!(http_effect_count(&update.effects), 0);
    assert_eq!(model.last_flush.expect("rerun summary").deferred, 1);
}

#[test]
fn network_failure_mid_pass_leaves_remainder_untouched() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let stored = stored_queue(vec![report_entry(1), report_entry(2), report_entry(3)]);
    let mut effects = start_hydrated(&app, &mut model, Some(stored));

    let request = http_request_with_method(&mut effects, "POST");
    let resolved = app
        .resolve(request, HttpResult::Ok(HttpResponse::status(201).build()))
        .expect("resolve delivery");
    effects = Vec::new();
    for event in resolved.events {
        effects.extend(app.update(event, &mut model).effects);
    }

    // Connectivity drops while the second request is in flight.
    app.update(Event::NetworkStatusChanged { online: false }, &mut model);

    let request = http_request_with_method(&mut effects, "POST");
    let resolved = app
        .resolve(
            request,
            HttpResult::Err(crux_http::Error::Io("connection reset".to_string())),
        )
        .expect("resolve delivery");
    let mut trailing = Vec::new();
    for event in resolved.events {
        trailing.extend(app.update(event, &mut model).effects);
    }

    // The pass stops: entry 3 was never attempted and entry 2 keeps its
    // failure accounting.
    assert_eq!(http_effect_count(&trailing), 0);
    assert_eq!(model.queue.len(), 2);
    assert_eq!(model.queue.entries()[0].attempts, 1);
    assert_eq!(model.queue.entries()[1].attempts, 0);

    let summary = model.last_flush.expect("pass summary");
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.failed, 1);
}

#[test]
fn unrecognized_action_tags_are_retained_without_dispatch() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let reserved = QueueEntry::new(
        QueuedAction::from_tag("update_report"),
        serde_json::json!({ "case_id": "CASE-9", "status": "resolved" }),
        UnixTimeMs(1),
    );
    let stored = stored_queue(vec![reserved, report_entry(2)]);
    let mut effects = start_hydrated(&app, &mut model, Some(stored));

    assert_eq!(http_effect_count(&effects), 1);
    let request = http_request_with_method(&mut effects, "POST");
    assert_eq!(marker_of(request), 2);
    let resolved = app
        .resolve(request, HttpResult::Ok(HttpResponse::status(201).build()))
        .expect("resolve delivery");

    let mut trailing = Vec::new();
    for event in resolved.events {
        trailing.extend(app.update(event, &mut model).effects);
    }

    // The reserved entry rides along untouched, attempts included, and is
    // written back out verbatim.
    assert_eq!(model.queue.len(), 1);
    let survivor = &model.queue.entries()[0];
    assert_eq!(survivor.action, QueuedAction::from_tag("update_report"));
    assert_eq!(survivor.attempts, 0);

    let summary = model.last_flush.expect("pass summary");
    assert_eq!(summary.unsupported, 1);
    assert_eq!(summary.delivered, 1);

    let persist = storage_request(&mut trailing);
    match &persist.operation {
        StorageOperation::Set { value, .. } => assert!(value.contains("update_report")),
        StorageOperation::Get { .. } => panic!("expected a storage write"),
    }
}

#[test]
fn client_rejection_dead_letters_the_entry() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let stored = stored_queue(vec![report_entry(1)]);
    let mut effects = start_hydrated(&app, &mut model, Some(stored));

    let request = http_request_with_method(&mut effects, "POST");
    let resolved = app
        .resolve(request, HttpResult::Ok(HttpResponse::status(400).build()))
        .expect("resolve delivery");
    for event in resolved.events {
        app.update(event, &mut model);
    }

    assert_eq!(model.queue.len(), 1);
    assert!(model.queue.entries()[0].is_dead_lettered());
    assert_eq!(model.queue.entries()[0].attempts, 1);

    let summary = model.last_flush.expect("pass summary");
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.dead_lettered, 1);

    // Dead-lettered entries never dispatch again.
    let update = app.update(Event::FlushRequested, &mut model);
    assert_eq!(http_effect_count(&update.effects), 0);
    assert_eq!(model.queue.len(), 1);
}

#[test]
fn attempts_exhaustion_dead_letters_the_entry() {
    let mut entry = report_entry(1);
    for _ in 0..MAX_DELIVERY_ATTEMPTS {
        entry.mark_failed(
            aidlink_shared::queue::DeliveryError::network_error("offline"),
            UnixTimeMs(10),
        );
    }
    assert!(entry.is_dead_lettered());

    // A queue full of exhausted entries produces a pass with no deliveries.
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let stored = stored_queue(vec![entry]);
    let effects = start_hydrated(&app, &mut model, Some(stored));

    assert_eq!(http_effect_count(&effects), 0);
    assert_eq!(model.last_flush.expect("summary").dead_lettered, 1);
}

#[test]
fn flush_requests_coalesce_while_a_pass_is_running() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let stored = stored_queue(vec![report_entry(1), report_entry(2)]);
    let mut effects = start_hydrated(&app, &mut model, Some(stored));
    let mut post_count = http_effect_count(&effects);

    // A second request mid-pass starts nothing new.
    let update = app.update(Event::FlushRequested, &mut model);
    assert!(update.effects.is_empty());

    loop {
        let Some(position) = effects
            .iter()
            .position(|e| matches!(e, Effect::Http(r) if r.operation.method == "POST"))
        else {
            break;
        };
        let Effect::Http(request) = &mut effects[position] else {
            unreachable!()
        };
        let resolved = app
            .resolve(request, HttpResult::Ok(HttpResponse::status(201).build()))
            .expect("resolve delivery");

        effects = Vec::new();
        for event in resolved.events {
            effects.extend(app.update(event, &mut model).effects);
        }
        post_count += http_effect_count(&effects);
    }

    // Both entries went out exactly once; the remembered rerun found an
    // empty queue and stopped.
    assert_eq!(post_count, 2);
    assert!(model.queue.is_empty());
}

#[test]
fn queued_report_submitted_offline_delivers_after_reconnect() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    start_hydrated(&app, &mut model, None);
    app.update(Event::NetworkStatusChanged { online: false }, &mut model);

    let draft = ReportDraft::new(
        NeedType::Water,
        "Family of four without drinking water",
        "Shelter B, Hall 2",
        UnixTimeMs(1_700_000_000_000),
    )
    .unwrap();
    let case_id = draft.case_id.clone();

    let mut update = app.update(Event::SubmitReport(Box::new(draft)), &mut model);

    // Offline: the report lands in the queue and on disk, nothing goes out.
    assert_eq!(http_effect_count(&update.effects), 0);
    assert_eq!(model.queue.len(), 1);
    let persist = storage_request(&mut update.effects);
    match &persist.operation {
        StorageOperation::Set { value, .. } => assert!(value.contains(case_id.as_str())),
        StorageOperation::Get { .. } => panic!("expected a storage write"),
    }

    // Reconnect: the queued report is replayed.
    let mut update = app.update(Event::NetworkStatusChanged { online: true }, &mut model);
    let request = http_request_with_method(&mut update.effects, "POST");
    let body: serde_json::Value = serde_json::from_slice(&request.operation.body).unwrap();
    assert_eq!(body["need_type"], "water");
    assert_eq!(body["case_id"], case_id.as_str());

    let resolved = app
        .resolve(request, HttpResult::Ok(HttpResponse::status(201).build()))
        .expect("resolve delivery");
    for event in resolved.events {
        app.update(event, &mut model);
    }

    assert!(model.queue.is_empty());
    assert_eq!(model.last_flush.expect("summary").delivered, 1);
}
