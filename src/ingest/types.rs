// src/ingest/types.rs
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ingest::sink::ItemSink;

/// An item as published to subscribers. Immutable once built by the item sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakingItem {
    pub id: String,
    pub source: String,
    pub title: String,
    pub url: String,
    pub published_at_ms: u64,
    pub visible_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_source: Option<String>,
}

/// What an adapter extracted from one upstream document, before any policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Native feed id (RSS guid, Atom id) when the feed has one.
    pub guid: Option<String>,
    pub title: String,
    pub url: String,
    pub published_at_ms: u64,
}

/// Minimal summary of one fetch/parse cycle, classified by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub http_status: u16,
    pub new_items: usize,
}

/// Side-effect-free health check result.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProbeReport {
    pub source: String,
    pub ok: bool,
    pub http_status: u16,
    pub items_found: usize,
    pub latest_item_timestamp: Option<u64>,
    pub fetch_started_at: u64,
    pub fetch_finished_at: u64,
    pub parse_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Cadence class of a source. Only boot staging and governor base delays look at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceClass {
    /// Cheap feeds (RSS/JSON), started early.
    Light,
    /// HTML-scraping or WAF-sensitive pages, started late and polled slower.
    Heavy,
}

/// Contract every feed adapter implements. The scheduler only ever sees this trait.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Canonical source key, e.g. `businesswire`.
    fn name(&self) -> &str;

    /// One fetch/parse cycle. New items go through `sink`, which applies freshness,
    /// dedup and watermark rules before publishing.
    async fn tick(&self, sink: &mut ItemSink<'_>) -> Result<TickReport>;

    /// Fetch and parse without publishing anything.
    async fn probe_once(&self) -> Result<ProbeReport>;
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
