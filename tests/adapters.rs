// tests/adapters.rs
//
// Feed and notice-page adapters against a local HTTP server:
// - conditional GET turns an unchanged feed into a 304 with no items
// - oversized bodies abort with BodyTooLarge
// - a body that fails to parse does not advance the stored ETag
// - notice pages seed on the first poll and publish only later anchors

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{Duration, Utc};
use regex::Regex;

use pulse_ingest::error::FetchError;
use pulse_ingest::ingest::adapters::{AnchorAdapter, FeedAdapter};
use pulse_ingest::ingest::dedup::{FilterConfig, SourceFilter};
use pulse_ingest::ingest::fetch::{build_client, FetchConfig, HttpFetcher};
use pulse_ingest::ingest::hub::Hub;
use pulse_ingest::ingest::sink::ItemSink;
use pulse_ingest::ingest::telemetry::LatencyTelemetry;
use pulse_ingest::ingest::types::{now_ms, SourceAdapter};

fn rss_body() -> String {
    let a = (Utc::now() - Duration::seconds(10)).to_rfc2822();
    let b = (Utc::now() - Duration::seconds(5)).to_rfc2822();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Wire</title>
<item><title>First release</title><link>https://example.com/1</link><guid>w-1</guid><pubDate>{a}</pubDate></item>
<item><title>Second release</title><link>https://example.com/2</link><guid>w-2</guid><pubDate>{b}</pubDate></item>
</channel></rss>"#
    )
}

async fn feed(headers: HeaderMap) -> Response {
    if headers
        .get(header::IF_NONE_MATCH)
        .is_some_and(|v| v == "\"v1\"")
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    ([(header::ETAG, "\"v1\"")], rss_body()).into_response()
}

async fn notices(State(hits): State<Arc<AtomicUsize>>) -> String {
    let n = hits.fetch_add(1, Ordering::SeqCst);
    let newer = if n > 0 {
        r#"<li><a href="/notices/2025/new-margin">New margin notice</a></li>"#
    } else {
        ""
    };
    format!(
        r#"<html><body><ul>{newer}
<li><a href="/notices/2025/old-1">Old notice one</a></li>
<li><a href="/notices/2025/old-2">Old notice two</a></li>
<li><a href="/contact">Contact</a></li>
</ul></body></html>"#
    )
}

/// First answer is a maintenance page carrying the feed's ETag; later ones are the feed.
async fn flaky(State(hits): State<Arc<AtomicUsize>>, headers: HeaderMap) -> Response {
    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
        return (
            [(header::ETAG, "\"v1\"")],
            "<html><body>maintenance</body></html>",
        )
            .into_response();
    }
    feed(headers).await
}

async fn serve() -> SocketAddr {
    let app = Router::new()
        .route("/feed.xml", get(feed))
        .route(
            "/flaky.xml",
            get(flaky).with_state(Arc::new(AtomicUsize::new(0))),
        )
        .route("/notices.html", get(notices))
        .with_state(Arc::new(AtomicUsize::new(0)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fetcher(addr: SocketAddr, path: &str, max_bytes: usize) -> HttpFetcher {
    let client = build_client(&FetchConfig::default()).unwrap();
    HttpFetcher::new(client, format!("http://{addr}{path}"), max_bytes)
}

#[tokio::test]
async fn unchanged_feed_is_a_304() {
    let addr = serve().await;
    let adapter = FeedAdapter::new("businesswire", fetcher(addr, "/feed.xml", 1_000_000));
    let hub = Hub::default();
    let tel = LatencyTelemetry::default();
    let mut filter = SourceFilter::new(FilterConfig::default());

    let mut sink = ItemSink::new("businesswire", &mut filter, &hub, &tel, now_ms());
    let first = adapter.tick(&mut sink).await.unwrap();
    assert_eq!(first.http_status, 200);
    assert_eq!(first.new_items, 2);

    let mut sink = ItemSink::new("businesswire", &mut filter, &hub, &tel, now_ms());
    let second = adapter.tick(&mut sink).await.unwrap();
    assert_eq!(second.http_status, 304);
    assert_eq!(second.new_items, 0);

    // Oldest first: the ring reads newest first.
    let ids: Vec<_> = hub.recent(10, None).into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["w-2", "w-1"]);
    assert_eq!(
        tel.summary(now_ms()).by_source["businesswire"]
            .timestamp_source
            .as_deref(),
        Some("feed")
    );
}

#[tokio::test]
async fn unparsed_body_keeps_previous_validators() {
    let addr = serve().await;
    let adapter = FeedAdapter::new("globenewswire", fetcher(addr, "/flaky.xml", 1_000_000));
    let hub = Hub::default();
    let tel = LatencyTelemetry::default();
    let mut filter = SourceFilter::new(FilterConfig::default());

    let mut sink = ItemSink::new("globenewswire", &mut filter, &hub, &tel, now_ms());
    assert!(adapter.tick(&mut sink).await.is_err());

    // No If-None-Match yet, so the full feed comes back.
    let mut sink = ItemSink::new("globenewswire", &mut filter, &hub, &tel, now_ms());
    let second = adapter.tick(&mut sink).await.unwrap();
    assert_eq!(second.http_status, 200);
    assert_eq!(second.new_items, 2);

    let mut sink = ItemSink::new("globenewswire", &mut filter, &hub, &tel, now_ms());
    let third = adapter.tick(&mut sink).await.unwrap();
    assert_eq!(third.http_status, 304);
    assert_eq!(hub.recent(10, None).len(), 2);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let addr = serve().await;
    let adapter = FeedAdapter::new("prnewswire", fetcher(addr, "/feed.xml", 64));
    let hub = Hub::default();
    let tel = LatencyTelemetry::default();
    let mut filter = SourceFilter::new(FilterConfig::default());
    let mut sink = ItemSink::new("prnewswire", &mut filter, &hub, &tel, now_ms());

    let err = adapter.tick(&mut sink).await.unwrap_err();
    assert!(matches!(
        err.root_cause().downcast_ref::<FetchError>(),
        Some(FetchError::BodyTooLarge { cap: 64 })
    ));
    assert!(hub.recent(10, None).is_empty());
}

#[tokio::test]
async fn notice_page_seeds_then_publishes_new_anchors() {
    let addr = serve().await;
    let adapter = AnchorAdapter::new(
        "cme_notices",
        fetcher(addr, "/notices.html", 1_000_000),
        Some(Regex::new(r"(?i)notices?/").unwrap()),
    )
    .unwrap();
    let hub = Hub::default();
    let tel = LatencyTelemetry::default();
    let mut filter = SourceFilter::new(FilterConfig::default());

    let mut sink = ItemSink::new("cme_notices", &mut filter, &hub, &tel, now_ms());
    let first = adapter.tick(&mut sink).await.unwrap();
    assert_eq!(first.new_items, 0);
    assert!(hub.recent(10, None).is_empty());

    let mut sink = ItemSink::new("cme_notices", &mut filter, &hub, &tel, now_ms());
    let second = adapter.tick(&mut sink).await.unwrap();
    assert_eq!(second.new_items, 1);

    let items = hub.recent(10, None);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].url, format!("http://{addr}/notices/2025/new-margin"));
    assert_eq!(items[0].title, "New margin notice");
    assert_eq!(items[0].timestamp_source.as_deref(), Some("inferred"));

    let probe = adapter.probe_once().await.unwrap();
    assert!(probe.ok);
    assert_eq!(probe.items_found, 3);
}
