// src/api.rs
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::cors::CorsLayer;

use crate::ingest::hub::Hub;
use crate::ingest::registry::canonical_name;
use crate::ingest::scheduler::IngestHandle;
use crate::ingest::stats::{build_metrics_summary, StatsBoard};
use crate::ingest::telemetry::LatencyTelemetry;
use crate::ingest::types::{now_ms, BreakingItem};

const DEFAULT_RECENT_LIMIT: usize = 50;
const MAX_RECENT_LIMIT: usize = 400;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub telemetry: Arc<LatencyTelemetry>,
    pub stats: Arc<StatsBoard>,
    /// Set once ingest has started; HTTP is served before that and without it.
    pub ingest: Arc<OnceCell<Arc<IngestHandle>>>,
    pub sse_enabled: bool,
    pub debug_routes: bool,
    pub subscriber_buffer: usize,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, telemetry: Arc<LatencyTelemetry>, stats: Arc<StatsBoard>) -> Self {
        Self {
            hub,
            telemetry,
            stats,
            ingest: Arc::new(OnceCell::new()),
            sse_enabled: true,
            debug_routes: false,
            subscriber_buffer: 256,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let mut r = Router::new()
        .route("/health", get(health))
        .route("/sse/breaking", get(sse_breaking))
        .route("/breaking/recent", get(breaking_recent))
        .route("/metrics-summary", get(metrics_summary));

    if state.debug_routes {
        r = r
            .route("/_debug/ingest", get(debug_ingest))
            .route("/_debug/sse-stats", get(debug_sse_stats))
            .route("/_debug/probe", get(debug_probe));
    }

    r.layer(CorsLayer::very_permissive()).with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "ingest": state.ingest.get().is_some() }))
}

async fn sse_breaking(State(state): State<AppState>) -> Response {
    if !state.sse_enabled {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "reason": "SSE_DISABLED" })),
        )
            .into_response();
    }

    let (sub, rx) = state.hub.subscribe(state.subscriber_buffer);
    // The stream owns the subscription: when the client goes away the stream is
    // dropped and the sink is unregistered.
    let stream = ReceiverStream::new(rx).map(move |frame| {
        let _ = &sub;
        Ok::<_, Infallible>(Event::default().event(frame.event).data(&*frame.data))
    });
    Sse::new(stream).into_response()
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
    sources: Option<String>,
}

#[derive(Debug, Serialize)]
struct RecentResp {
    items: Vec<BreakingItem>,
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    sources: Option<Vec<String>>,
}

async fn breaking_recent(
    State(state): State<AppState>,
    Query(q): Query<RecentQuery>,
) -> Json<RecentResp> {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);
    let sources: Option<Vec<String>> = q
        .sources
        .as_deref()
        .map(|s| {
            s.split(',')
                .map(canonical_name)
                .filter(|k| !k.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty());

    let items = state.hub.recent(limit, sources.as_deref());
    Json(RecentResp {
        items,
        limit,
        sources,
    })
}

async fn metrics_summary(State(state): State<AppState>) -> Response {
    let tel = state.telemetry.summary(now_ms());
    Json(build_metrics_summary(&tel, &state.stats.snapshot())).into_response()
}

async fn debug_ingest(State(state): State<AppState>) -> Response {
    match state.ingest.get() {
        Some(h) => Json(h.debug()).into_response(),
        None => Json(json!({ "started": false, "enabled": [], "adapters": [] })).into_response(),
    }
}

async fn debug_sse_stats(State(state): State<AppState>) -> Response {
    let s = state.hub.stats();
    Json(json!({
        "enabled": state.sse_enabled,
        "connections": s.connections,
        "events_sent": s.events_sent,
    }))
    .into_response()
}

async fn debug_probe(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let source = q.get("source").map(|s| canonical_name(s)).unwrap_or_default();
    let Some(rt) = state.ingest.get().and_then(|h| h.runtime(&source)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "reason": "UNKNOWN_SOURCE", "source": source })),
        )
            .into_response();
    };
    match rt.probe().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "ok": false, "source": source, "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}
