// src/ingest/stats.rs
//! Per-source scheduler counters and the combined `/metrics-summary` view.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::ingest::telemetry::{GlobalLatency, TelemetrySummary};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub ticks_total: u64,
    pub last_tick_at: Option<u64>,
    pub last_http_status: Option<u16>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SchedulerStats {
    /// Records an adapter invocation that produced an HTTP status.
    /// 2xx and 3xx reset the failure streak, anything else extends it.
    pub fn record_status(&mut self, status: u16, at_ms: u64) {
        self.ticks_total += 1;
        self.last_tick_at = Some(at_ms);
        self.last_http_status = Some(status);
        if (200..400).contains(&status) {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }

    /// Records an invocation that timed out or errored before producing a status.
    pub fn record_failure(&mut self, error: impl Into<String>, at_ms: u64) {
        self.ticks_total += 1;
        self.last_tick_at = Some(at_ms);
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
    }
}

#[derive(Debug, Default)]
pub struct StatsBoard {
    inner: Mutex<BTreeMap<String, SchedulerStats>>,
}

impl StatsBoard {
    pub fn update<F: FnOnce(&mut SchedulerStats)>(&self, source: &str, f: F) {
        let mut g = self.inner.lock().expect("stats mutex poisoned");
        f(g.entry(source.to_string()).or_default());
    }

    pub fn get(&self, source: &str) -> Option<SchedulerStats> {
        let g = self.inner.lock().expect("stats mutex poisoned");
        g.get(source).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, SchedulerStats> {
        self.inner.lock().expect("stats mutex poisoned").clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceMetrics {
    pub samples: usize,
    pub publisher_p50_ms: Option<u64>,
    pub publisher_p90_ms: Option<u64>,
    pub pulse_p50_ms: Option<u64>,
    pub pulse_p90_ms: Option<u64>,
    pub last_sample_at: Option<u64>,
    pub timestamp_source: Option<String>,
    pub window_ms: u64,
    pub scheduler: SchedulerStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub n_total: usize,
    pub by_source: BTreeMap<String, SourceMetrics>,
    pub global: GlobalLatency,
}

/// Joins latency telemetry with scheduler counters. A source appears when either side knows it.
pub fn build_metrics_summary(
    tel: &TelemetrySummary,
    sched: &BTreeMap<String, SchedulerStats>,
) -> MetricsSummary {
    let mut by_source: BTreeMap<String, SourceMetrics> = BTreeMap::new();

    for (name, l) in &tel.by_source {
        by_source.insert(
            name.clone(),
            SourceMetrics {
                samples: l.samples,
                publisher_p50_ms: l.p50,
                publisher_p90_ms: l.p90,
                pulse_p50_ms: l.pulse_p50,
                pulse_p90_ms: l.pulse_p90,
                last_sample_at: l.last_sample_at,
                timestamp_source: l.timestamp_source.clone(),
                window_ms: tel.window_ms,
                scheduler: SchedulerStats::default(),
            },
        );
    }
    for (name, s) in sched {
        by_source
            .entry(name.clone())
            .or_insert_with(|| SourceMetrics {
                window_ms: tel.window_ms,
                ..SourceMetrics::default()
            })
            .scheduler = s.clone();
    }

    MetricsSummary {
        n_total: tel.n_total,
        by_source,
        global: tel.global.clone(),
    }
}
