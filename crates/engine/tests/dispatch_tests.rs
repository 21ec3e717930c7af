mod support;

use std::sync::{Arc, Mutex};

use serde_json::json;
use sluice_engine::{Engine, FetchOutcome};
use sluice_types::{FailureKind, SourceId};
use sluice_util::{CredentialsMode, EngineConfig, http::Transport};
use support::{Reply, ScriptedTransport};
use url::Url;

async fn settle_in_flight(engine: &Engine, source: &SourceId) {
    while engine.dispatcher().is_in_flight(source) {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn reordered_queries_share_one_in_flight_request() {
    let transport = ScriptedTransport::new();
    let gate = transport.gate("/api/items?a=1&b=2");
    let engine = support::engine(&transport);

    assert_eq!(engine.load_state(["/api/items?b=2&a=1"], true), 1);
    assert_eq!(engine.load_state(["/api/items?a=1&b=2"], true), 0);
    tokio::task::yield_now().await;
    assert_eq!(engine.load_state(["api//items?a=1&b=2"], true), 0);

    let entry = engine.get_cached_state("/api/items?a=1&b=2").expect("loading entry");
    assert!(entry.loading);

    gate.send(Reply::json(200, json!({ "items": [1] }))).expect("gate open");
    engine.wait_idle().await;

    assert_eq!(transport.calls(), vec!["api/items?a=1&b=2&sluice".to_string()]);
    let entry = engine.get_cached_state("/api/items?b=2&a=1").expect("entry");
    assert_eq!(entry.state, json!({ "items": [1] }));
    assert!(!entry.loading && !entry.error);
}

#[tokio::test]
async fn not_found_records_message_and_keeps_previous_state() {
    let transport = ScriptedTransport::new();
    transport.respond("/api/widgets/9", Reply::json(404, json!({ "detail": "gone" })));
    let engine = support::engine(&transport);
    engine.set_state("/api/widgets/9", json!({ "name": "old" }));

    engine.load_state(["/api/widgets/9"], true);
    engine.wait_idle().await;

    let entry = engine.get_cached_state("/api/widgets/9").expect("entry");
    assert!(entry.error);
    assert!(!entry.loading);
    assert_eq!(entry.state, json!({ "name": "old" }));

    let errors = engine.snapshot().errors.clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error, "We couldn't find the data you were looking for.");
    assert_eq!(errors[0].kind, FailureKind::NotFound);
    assert_eq!(errors[0].status, Some(404));
    assert_eq!(errors[0].response, Some(json!({ "detail": "gone" })));
    assert_eq!(errors[0].source.as_str(), "api/widgets/9");
}

#[tokio::test]
async fn error_bodies_are_recorded_in_container_shape() {
    let transport = ScriptedTransport::new();
    transport.respond("/api/missing", Reply::json(404, json!(["first", "second"])));
    let engine = support::engine(&transport);

    engine.load_state(["/api/missing"], true);
    engine.wait_idle().await;

    let errors = engine.snapshot().errors.clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].response, Some(json!({ "values": ["first", "second"] })));
}

#[tokio::test]
async fn statuses_map_to_failure_kinds() {
    let transport = ScriptedTransport::new();
    let cases = [
        ("/s/403", 403, FailureKind::Forbidden),
        ("/s/500", 500, FailureKind::ServerError),
        ("/s/503", 503, FailureKind::Unavailable),
        ("/s/418", 418, FailureKind::Unknown),
        ("/s/201", 201, FailureKind::Unknown),
    ];
    for (source, status, _) in &cases {
        transport.respond(source, Reply::text(*status, "not json"));
    }
    let engine = support::engine(&transport);

    engine.load_state(cases.iter().map(|(source, _, _)| *source), false);
    engine.wait_idle().await;

    let errors = engine.snapshot().errors.clone();
    assert_eq!(errors.len(), cases.len());
    for (source, status, kind) in cases {
        let record = errors
            .iter()
            .find(|record| record.source == SourceId::normalize(source))
            .expect("record per source");
        assert_eq!(record.kind, kind, "{source}");
        assert_eq!(record.status, Some(status));
        assert_eq!(record.error, kind.message());
        assert_eq!(record.response, None, "unparseable bodies carry no response");
    }
}

#[tokio::test]
async fn malformed_success_body_is_classified() {
    let transport = ScriptedTransport::new();
    transport.respond("/api/broken", Reply::text(200, "{\"id\": "));
    let engine = support::engine(&transport);

    engine.load_state(["/api/broken"], false);
    engine.wait_idle().await;

    let entry = engine.get_cached_state("/api/broken").expect("entry");
    assert!(entry.error);
    assert_eq!(entry.state, json!({}));
    assert_eq!(engine.snapshot().errors[0].kind, FailureKind::JsonMalformed);
}

#[tokio::test]
async fn transport_failures_are_unknown_without_status() {
    let transport = ScriptedTransport::new();
    let engine = support::engine(&transport);

    let handle = engine.dispatcher().fetch(&SourceId::normalize("/unrouted")).expect("started");
    let outcome = handle.await.expect("task");
    match outcome {
        FetchOutcome::Failed(failure) => {
            assert_eq!(failure.kind, FailureKind::Unknown);
            assert_eq!(failure.status, None);
            assert!(failure.detail.contains("no route"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(engine.snapshot().errors[0].status, None);
}

#[tokio::test]
async fn array_payloads_are_wrapped() {
    let transport = ScriptedTransport::new();
    transport.respond("/api/list", Reply::json(200, json!([1, 2, 3])));
    let engine = support::engine(&transport);

    engine.load_state(["/api/list"], false);
    engine.wait_idle().await;

    assert_eq!(engine.get_cached_state("/api/list").expect("entry").state, json!({ "values": [1, 2, 3] }));
}

fn recording_engine(transport: &Arc<ScriptedTransport>, config: EngineConfig) -> (Engine, Arc<Mutex<Vec<String>>>) {
    let redirects = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&redirects);
    let engine = Engine::builder(config)
        .transport(Arc::clone(transport) as Arc<dyn Transport>)
        .redirect_handler(move |location| sink.lock().unwrap().push(location.to_string()))
        .build()
        .expect("engine");
    (engine, redirects)
}

#[tokio::test]
async fn reported_url_mismatch_is_a_redirect() {
    let transport = ScriptedTransport::new();
    transport.respond(
        "/api/account",
        Reply::json(200, json!({ "login": true })).from_url("/login?next=%2Faccount&sluice"),
    );
    let (engine, redirects) = recording_engine(&transport, EngineConfig::default());

    let outcome = engine
        .dispatcher()
        .fetch(&SourceId::normalize("/api/account"))
        .expect("started")
        .await
        .expect("task");

    assert_eq!(outcome, FetchOutcome::Redirected("/login?next=%2Faccount".to_string()));
    assert_eq!(redirects.lock().unwrap().as_slice(), &["/login?next=%2Faccount".to_string()]);
    let entry = engine.get_cached_state("/api/account").expect("entry");
    assert_ne!(entry.state, json!({ "login": true }));
    assert!(engine.snapshot().errors.is_empty());
}

#[tokio::test]
async fn request_url_header_is_used_when_transport_has_no_url() {
    let transport = ScriptedTransport::new();
    transport.respond(
        "/api/account",
        Reply::json(200, json!({})).header("X-Request-URL", "/maintenance?sluice"),
    );
    let (engine, redirects) = recording_engine(&transport, EngineConfig::default());

    engine.load_state(["/api/account"], false);
    engine.wait_idle().await;

    assert_eq!(redirects.lock().unwrap().as_slice(), &["/maintenance".to_string()]);
}

#[tokio::test]
async fn matching_absolute_url_is_not_a_redirect() {
    let transport = ScriptedTransport::new();
    transport.respond(
        "https://example.com/api/items?a=1",
        Reply::json(200, json!({ "ok": true })).from_url("https://example.com/api//items?sluice&a=1"),
    );
    let config = EngineConfig {
        origin: Url::parse("https://example.com").ok(),
        ..EngineConfig::default()
    };
    let (engine, redirects) = recording_engine(&transport, config);

    engine.load_state(["/api/items?a=1"], false);
    engine.wait_idle().await;

    assert!(redirects.lock().unwrap().is_empty());
    assert_eq!(transport.calls(), vec!["https://example.com/api/items?a=1&sluice".to_string()]);
    assert_eq!(engine.get_cached_state("api/items?a=1").expect("entry").state, json!({ "ok": true }));
}

#[tokio::test]
async fn stale_completion_is_discarded() {
    let transport = ScriptedTransport::new();
    let first_reply = transport.gate("/api/feed");
    let first_body = transport.gate_body("/api/feed");
    transport.respond("/api/feed", Reply::json(200, json!({ "version": 2 })));
    let engine = support::engine(&transport);
    let source = SourceId::normalize("/api/feed");

    let first = engine.dispatcher().fetch(&source).expect("first started");
    tokio::task::yield_now().await;
    first_reply.send(Reply::json(200, json!({ "version": 1 }))).expect("gate open");
    settle_in_flight(&engine, &source).await;

    let second = engine.dispatcher().fetch(&source).expect("second started");
    assert_eq!(second.await.expect("task"), FetchOutcome::Received(json!({ "version": 2 })));

    first_body.send(()).expect("body gate open");
    assert_eq!(first.await.expect("task"), FetchOutcome::Superseded);
    assert_eq!(engine.get_cached_state("/api/feed").expect("entry").state, json!({ "version": 2 }));
}

#[tokio::test]
async fn cached_sources_are_skipped_unless_forced() {
    let transport = ScriptedTransport::new();
    transport.respond("/api/a", Reply::json(200, json!({ "fresh": true })));
    let engine = support::engine(&transport);
    engine.set_state("/api/a", json!({ "seeded": true }));

    assert_eq!(engine.load_state(["/api/a"], false), 0);
    engine.wait_idle().await;
    assert_eq!(transport.call_count(), 0);

    assert_eq!(engine.load_state(["/api/a", "api/a/"], true), 1);
    engine.wait_idle().await;
    assert_eq!(transport.call_count(), 1);
    assert_eq!(engine.get_cached_state("/api/a").expect("entry").state, json!({ "fresh": true }));
}

#[tokio::test]
async fn credentials_follow_configured_mode() {
    let transport = ScriptedTransport::new();
    transport.respond("https://example.com/api/me", Reply::json(200, json!({})));
    transport.respond("https://other.test/api/me", Reply::json(200, json!({})));
    let config = EngineConfig {
        credentials: CredentialsMode::SameOrigin,
        origin: Url::parse("https://example.com").ok(),
        ..EngineConfig::default()
    };
    let engine = support::engine_with_config(&transport, config);

    engine.load_state(["/api/me"], false);
    engine.wait_idle().await;
    engine.load_state(["https://other.test/api/me"], false);
    engine.wait_idle().await;

    assert_eq!(transport.credentials(), vec![true, false]);
}

#[tokio::test]
async fn custom_marker_is_appended_and_stripped() {
    let transport = ScriptedTransport::new();
    let config = EngineConfig {
        identifier_suffix: "probe".into(),
        ..EngineConfig::default()
    };
    // Routes are keyed with the default marker stripped, so this one keeps `probe`.
    transport.respond("/api/x?probe", Reply::json(200, json!({ "ok": 1 })).from_url("api/x?probe"));
    let (engine, redirects) = recording_engine(&transport, config);

    engine.load_state(["/api/x"], false);
    engine.wait_idle().await;

    assert_eq!(transport.calls(), vec!["api/x?probe".to_string()]);
    assert!(redirects.lock().unwrap().is_empty());
    assert_eq!(engine.get_cached_state("/api/x").expect("entry").state, json!({ "ok": 1 }));
}
