// src/ingest/adapters/anchors.rs
//! HTML notice pages (exchange trader updates, clearing notices). These pages carry no
//! reliable per-item timestamps, so the first successful poll only learns what is
//! already there and later polls publish what appeared since, stamped `inferred`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::ingest::clean_title;
use crate::ingest::fetch::HttpFetcher;
use crate::ingest::sink::ItemSink;
use crate::ingest::types::{now_ms, Candidate, ProbeReport, SourceAdapter, TickReport};

const MAX_ANCHORS: usize = 50;

/// Extracts `(absolute url, title)` pairs in page order, unique by url.
/// When `href_filter` is set, only matching hrefs are kept.
pub fn extract_anchors(
    html: &str,
    base: &reqwest::Url,
    href_filter: Option<&Regex>,
) -> Vec<(String, String)> {
    static RE_A: OnceCell<Regex> = OnceCell::new();
    let re_a = RE_A.get_or_init(|| {
        Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
            .expect("static regex")
    });

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cap in re_a.captures_iter(html) {
        let href = cap[1].trim();
        if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        if href_filter.is_some_and(|re| !re.is_match(href)) {
            continue;
        }
        let title = clean_title(&cap[2]);
        if title.is_empty() {
            continue;
        }
        let Ok(url) = base.join(&html_escape::decode_html_entities(href)) else {
            continue;
        };
        let url = url.to_string();
        if seen.insert(url.clone()) {
            out.push((url, title));
        }
        if out.len() >= MAX_ANCHORS {
            break;
        }
    }
    out
}

pub struct AnchorAdapter {
    name: String,
    fetcher: HttpFetcher,
    base: reqwest::Url,
    href_filter: Option<Regex>,
    seeded: AtomicBool,
}

impl AnchorAdapter {
    pub fn new(name: impl Into<String>, fetcher: HttpFetcher, href_filter: Option<Regex>) -> Result<Self> {
        let base = reqwest::Url::parse(fetcher.url())
            .with_context(|| format!("invalid notice page url {}", fetcher.url()))?;
        Ok(Self {
            name: name.into(),
            fetcher,
            base,
            href_filter,
            seeded: AtomicBool::new(false),
        })
    }

    fn candidates(&self, html: &str, stamp_ms: u64) -> Vec<Candidate> {
        extract_anchors(html, &self.base, self.href_filter.as_ref())
            .into_iter()
            .map(|(url, title)| Candidate {
                guid: Some(url.clone()),
                title,
                url,
                published_at_ms: stamp_ms,
            })
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for AnchorAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn tick(&self, sink: &mut ItemSink<'_>) -> Result<TickReport> {
        let resp = self
            .fetcher
            .fetch()
            .await
            .with_context(|| format!("fetching {}", self.fetcher.url()))?;
        sink.set_fetched_at(resp.received_at_ms);

        let Some(body) = resp.body.as_deref() else {
            return Ok(TickReport {
                http_status: resp.status,
                new_items: 0,
            });
        };
        let base_ms = resp.date_ms.unwrap_or(resp.received_at_ms);
        let found = self.candidates(body, base_ms);

        if !self.seeded.swap(true, Ordering::AcqRel) {
            for c in &found {
                sink.seed(c);
            }
            tracing::info!(target: "ingest", source = %self.name, anchors = found.len(), "notice page seeded");
            self.fetcher.commit(&resp);
            return Ok(TickReport {
                http_status: resp.status,
                new_items: 0,
            });
        }

        sink.set_timestamp_source("inferred");
        // Pages list newest first. Stamps are spaced 1 ms apart bottom-up so the
        // watermark admits each new anchor exactly once.
        let fresh: Vec<Candidate> = found.into_iter().filter(|c| !sink.is_known(c)).collect();
        for (k, mut c) in fresh.into_iter().rev().enumerate() {
            c.published_at_ms = base_ms + k as u64;
            sink.offer(c);
        }
        self.fetcher.commit(&resp);

        Ok(TickReport {
            http_status: resp.status,
            new_items: sink.accepted(),
        })
    }

    async fn probe_once(&self) -> Result<ProbeReport> {
        let started = now_ms();
        let resp = self.fetcher.fetch_unconditional().await?;
        let finished = now_ms();

        let t0 = std::time::Instant::now();
        let found = resp
            .body
            .as_deref()
            .map(|b| self.candidates(b, finished))
            .unwrap_or_default();
        let parse_ms = t0.elapsed().as_millis() as u64;

        Ok(ProbeReport {
            source: self.name.clone(),
            ok: (200..300).contains(&resp.status),
            http_status: resp.status,
            items_found: found.len(),
            latest_item_timestamp: None,
            fetch_started_at: started,
            fetch_finished_at: finished,
            parse_ms,
            notes: Some("anchor timestamps are inferred".to_string()),
        })
    }
}
