// tests/api.rs
//
// HTTP-level tests for the public router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

use std::sync::Arc;

use axum::{
    body::{self, Body},
    Router,
};
use http::{header, Request, StatusCode};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use pulse_ingest::ingest::hub::Hub;
use pulse_ingest::ingest::stats::StatsBoard;
use pulse_ingest::ingest::telemetry::{LatencyKind, LatencyTelemetry};
use pulse_ingest::ingest::types::{now_ms, BreakingItem};
use pulse_ingest::{router, AppState};

const BODY_LIMIT: usize = 1024 * 1024;
const T0: u64 = 1_760_000_000_000;

fn state() -> AppState {
    AppState::new(
        Arc::new(Hub::default()),
        Arc::new(LatencyTelemetry::default()),
        Arc::new(StatsBoard::default()),
    )
}

fn item(id: &str, source: &str) -> BreakingItem {
    BreakingItem {
        id: id.into(),
        source: source.into(),
        title: format!("headline {id}"),
        url: format!("https://example.com/{id}"),
        published_at_ms: T0,
        visible_at_ms: T0 + 700,
        publisher_latency_ms: Some(700),
        pipeline_latency_ms: Some(30),
        timestamp_source: Some("feed".into()),
    }
}

async fn get(app: Router, uri: &str) -> (StatusCode, Json) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let json = if bytes.is_empty() {
        Json::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

#[tokio::test]
async fn health_reports_ingest_not_started() {
    let (status, body) = get(router(state()), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["ingest"], false);
}

#[tokio::test]
async fn sse_disabled_is_503_with_reason() {
    let st = AppState {
        sse_enabled: false,
        ..state()
    };
    let (status, body) = get(router(st), "/sse/breaking").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ok"], false);
    assert_eq!(body["reason"], "SSE_DISABLED");
}

#[tokio::test]
async fn sse_stream_holds_a_subscription_while_open() {
    let st = state();
    let hub = st.hub.clone();
    let req = Request::builder()
        .uri("/sse/breaking")
        .body(Body::empty())
        .unwrap();
    let resp = router(st).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(hub.connections(), 1);
    drop(resp);
    assert_eq!(hub.connections(), 0);
}

#[tokio::test]
async fn recent_is_newest_first_limited_and_filtered() {
    let st = state();
    st.hub.publish(&item("a", "businesswire"));
    st.hub.publish(&item("b", "sec_press"));
    st.hub.publish(&item("c", "businesswire"));

    let (status, body) = get(router(st.clone()), "/breaking/recent").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 50);
    let ids: Vec<_> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["c", "b", "a"]);

    // Aliases resolve to canonical names.
    let (_, body) = get(router(st.clone()), "/breaking/recent?limit=1&sources=BW").await;
    assert_eq!(body["limit"], 1);
    assert_eq!(body["sources"], serde_json::json!(["businesswire"]));
    assert_eq!(body["items"][0]["id"], "c");

    let (_, body) = get(router(st), "/breaking/recent?limit=100000").await;
    assert_eq!(body["limit"], 400);
}

#[tokio::test]
async fn metrics_summary_has_per_source_latency() {
    // The handler summarizes at wall-clock now, so the sample must sit inside the window.
    let st = state();
    let now = now_ms();
    st.telemetry
        .record("fed_press", LatencyKind::Publisher, now - 900, now);
    st.stats.update("fed_press", |s| s.record_status(200, now));

    let (status, body) = get(router(st), "/metrics-summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["by_source"]["fed_press"]["samples"], 1);
    assert_eq!(body["by_source"]["fed_press"]["scheduler"]["ticks_total"], 1);
    assert!(body["global"].is_object());
}

#[tokio::test]
async fn debug_routes_are_gated() {
    let (status, _) = get(router(state()), "/_debug/sse-stats").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let st = AppState {
        debug_routes: true,
        ..state()
    };
    let (status, body) = get(router(st.clone()), "/_debug/sse-stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["connections"], 0);
    assert_eq!(body["events_sent"], 0);

    let (_, body) = get(router(st.clone()), "/_debug/ingest").await;
    assert_eq!(body["started"], false);

    let (status, body) = get(router(st), "/_debug/probe?source=nyse").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "UNKNOWN_SOURCE");
    assert_eq!(body["source"], "nyse_notices");
}
