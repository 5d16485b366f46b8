// src/ingest/sink.rs
//! The handle an adapter publishes through during one `tick()`. Policy lives here,
//! not in adapters: every candidate goes through the source's dedup filter, and only
//! admitted items reach the hub and telemetry.

use metrics::counter;

use crate::ingest::dedup::{fingerprint, Admission, SourceFilter};
use crate::ingest::hub::Hub;
use crate::ingest::telemetry::{LatencyKind, LatencyTelemetry};
use crate::ingest::types::{now_ms, BreakingItem, Candidate};

pub struct ItemSink<'a> {
    source: &'a str,
    filter: &'a mut SourceFilter,
    hub: &'a Hub,
    telemetry: &'a LatencyTelemetry,
    fetched_at_ms: u64,
    timestamp_source: Option<String>,
    accepted: usize,
    newest_published_ms: Option<u64>,
}

impl<'a> ItemSink<'a> {
    pub fn new(
        source: &'a str,
        filter: &'a mut SourceFilter,
        hub: &'a Hub,
        telemetry: &'a LatencyTelemetry,
        fetched_at_ms: u64,
    ) -> Self {
        Self {
            source,
            filter,
            hub,
            telemetry,
            fetched_at_ms,
            timestamp_source: None,
            accepted: 0,
            newest_published_ms: None,
        }
    }

    pub fn source(&self) -> &str {
        self.source
    }

    /// Moment the upstream body was in hand. Freshness and pipeline latency are measured from it.
    pub fn set_fetched_at(&mut self, at_ms: u64) {
        self.fetched_at_ms = at_ms;
    }

    pub fn fetched_at_ms(&self) -> u64 {
        self.fetched_at_ms
    }

    /// Where this batch's publish times came from: `feed`, `http-date` or `inferred`.
    pub fn set_timestamp_source(&mut self, label: &str) {
        self.telemetry.set_timestamp_source(self.source, label);
        self.timestamp_source = Some(label.to_string());
    }

    /// Runs one candidate through admission and publishes it when accepted.
    pub fn offer(&mut self, c: Candidate) -> Admission {
        self.newest_published_ms = self.newest_published_ms.max(Some(c.published_at_ms));

        let id = fingerprint(c.guid.as_deref(), &c.title, &c.url, c.published_at_ms);
        let verdict = self.filter.admit(&id, c.published_at_ms, self.fetched_at_ms);
        if verdict != Admission::Accepted {
            tracing::trace!(target: "ingest", source = self.source, %id, ?verdict, "candidate skipped");
            return verdict;
        }

        let visible = now_ms();
        let item = BreakingItem {
            id,
            source: self.source.to_string(),
            title: c.title,
            url: c.url,
            published_at_ms: c.published_at_ms,
            visible_at_ms: visible,
            publisher_latency_ms: Some(visible.saturating_sub(c.published_at_ms)),
            pipeline_latency_ms: Some(visible.saturating_sub(self.fetched_at_ms)),
            timestamp_source: self.timestamp_source.clone(),
        };

        self.telemetry
            .record(self.source, LatencyKind::Publisher, c.published_at_ms, visible);
        self.telemetry
            .record(self.source, LatencyKind::Pipeline, self.fetched_at_ms, visible);

        let delivered = self.hub.publish(&item);
        counter!("ingest_items_published_total", "source" => self.source.to_string()).increment(1);
        tracing::info!(
            target: "ingest",
            source = self.source,
            id = %item.id,
            delivered,
            publisher_latency_ms = item.publisher_latency_ms,
            "item published"
        );

        self.accepted += 1;
        Admission::Accepted
    }

    /// Remembers a candidate without publishing it.
    pub fn seed(&mut self, c: &Candidate) {
        let id = fingerprint(c.guid.as_deref(), &c.title, &c.url, c.published_at_ms);
        self.filter.seed(&id);
    }

    /// True when the candidate's id is already known to the filter.
    pub fn is_known(&self, c: &Candidate) -> bool {
        let id = fingerprint(c.guid.as_deref(), &c.title, &c.url, c.published_at_ms);
        self.filter.has_seen(&id)
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Age of the newest item seen this cycle, accepted or not.
    pub fn recency_ms(&self, now_ms: u64) -> Option<u64> {
        self.newest_published_ms
            .filter(|p| *p > 0)
            .map(|p| now_ms.saturating_sub(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::dedup::FilterConfig;
    use std::sync::Arc;

    fn cand(guid: &str, published: u64) -> Candidate {
        Candidate {
            guid: Some(guid.into()),
            title: format!("t {guid}"),
            url: format!("https://example.com/{guid}"),
            published_at_ms: published,
        }
    }

    #[test]
    fn accepted_items_reach_hub_and_telemetry() {
        let hub = Arc::new(Hub::default());
        let tel = LatencyTelemetry::default();
        let mut filter = SourceFilter::new(FilterConfig::default());
        let now = now_ms();

        let mut sink = ItemSink::new("bw", &mut filter, &hub, &tel, now);
        sink.set_timestamp_source("feed");
        assert_eq!(sink.offer(cand("a", now - 1_000)), Admission::Accepted);
        assert_eq!(sink.offer(cand("a", now - 1_000)), Admission::Duplicate);
        assert_eq!(sink.offer(cand("old", now - 3_600_000)), Admission::Stale);
        assert_eq!(sink.accepted(), 1);
        assert!(sink.recency_ms(now).unwrap() <= 1_000);

        let recent = hub.recent(10, None);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].timestamp_source.as_deref(), Some("feed"));
        let s = tel.summary(now_ms());
        assert_eq!(s.by_source["bw"].samples, 1);
        assert_eq!(s.by_source["bw"].pulse_samples, 1);
    }

    #[test]
    fn seeded_candidates_are_never_published() {
        let hub = Hub::default();
        let tel = LatencyTelemetry::default();
        let mut filter = SourceFilter::new(FilterConfig::default());
        let now = now_ms();

        let mut sink = ItemSink::new("nyse_notices", &mut filter, &hub, &tel, now);
        let c = cand("n1", now);
        sink.seed(&c);
        assert!(sink.is_known(&c));
        assert_eq!(sink.offer(c), Admission::Duplicate);
        assert!(hub.recent(10, None).is_empty());
    }
}
