// src/ingest/telemetry.rs
//! # Latency telemetry
//! Sliding 60-minute windows of per-source latency samples.
//!
//! Two independent buffers per source:
//! - publisher latency: `visible - published` (how late the publisher's feed shows an item)
//! - pipeline latency: `visible - first_seen` (how long our own fetch/parse/publish took)
//!
//! Percentiles are nearest-rank at index `floor(p * (n - 1))` over sorted deltas.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

pub const DEFAULT_WINDOW_MS: u64 = 60 * 60_000;
pub const DEFAULT_CAP_PER_SOURCE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyKind {
    Publisher,
    Pipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    at: u64,
    delta_ms: u64,
}

#[derive(Debug, Default)]
struct SourceBuffers {
    publisher: VecDeque<Sample>,
    pipeline: VecDeque<Sample>,
    timestamp_source: Option<String>,
}

impl SourceBuffers {
    fn buf_mut(&mut self, kind: LatencyKind) -> &mut VecDeque<Sample> {
        match kind {
            LatencyKind::Publisher => &mut self.publisher,
            LatencyKind::Pipeline => &mut self.pipeline,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceLatency {
    pub samples: usize,
    pub p50: Option<u64>,
    pub p90: Option<u64>,
    pub pulse_samples: usize,
    pub pulse_p50: Option<u64>,
    pub pulse_p90: Option<u64>,
    pub last_sample_at: Option<u64>,
    pub timestamp_source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GlobalLatency {
    pub p50: Option<u64>,
    pub p90: Option<u64>,
    pub pulse_p50: Option<u64>,
    pub pulse_p90: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySummary {
    pub n_total: usize,
    pub window_ms: u64,
    pub by_source: BTreeMap<String, SourceLatency>,
    pub global: GlobalLatency,
}

/// Thread-safe latency store shared by every source runtime.
#[derive(Debug)]
pub struct LatencyTelemetry {
    inner: Mutex<HashMap<String, SourceBuffers>>,
    window_ms: u64,
    cap: usize,
}

impl Default for LatencyTelemetry {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MS, DEFAULT_CAP_PER_SOURCE)
    }
}

impl LatencyTelemetry {
    pub fn new(window_ms: u64, cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            window_ms,
            cap: cap.max(1),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Appends `end - start` (clamped at zero) and prunes by age, then by cap.
    pub fn record(&self, source: &str, kind: LatencyKind, start_ms: u64, end_ms: u64) {
        let cutoff = end_ms.saturating_sub(self.window_ms);
        let mut g = self.inner.lock().expect("telemetry mutex poisoned");
        let buf = g.entry(source.to_string()).or_default().buf_mut(kind);
        buf.push_back(Sample {
            at: end_ms,
            delta_ms: end_ms.saturating_sub(start_ms),
        });
        while buf.front().is_some_and(|s| s.at < cutoff) {
            buf.pop_front();
        }
        while buf.len() > self.cap {
            buf.pop_front();
        }
    }

    /// Labels where a source's publish times come from: `feed`, `http-date` or `inferred`.
    pub fn set_timestamp_source(&self, source: &str, label: &str) {
        let mut g = self.inner.lock().expect("telemetry mutex poisoned");
        g.entry(source.to_string()).or_default().timestamp_source = Some(label.to_string());
    }

    pub fn summary(&self, now_ms: u64) -> TelemetrySummary {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let g = self.inner.lock().expect("telemetry mutex poisoned");

        let mut by_source = BTreeMap::new();
        let mut n_total = 0usize;
        let mut pub_weighted = Weighted::default();
        let mut pipe_weighted = Weighted::default();

        for (name, bufs) in g.iter() {
            let publisher = windowed(&bufs.publisher, cutoff);
            let pipeline = windowed(&bufs.pipeline, cutoff);
            let last_sample_at = bufs
                .publisher
                .back()
                .into_iter()
                .chain(bufs.pipeline.back())
                .map(|s| s.at)
                .filter(|at| *at >= cutoff)
                .max();

            let entry = SourceLatency {
                samples: publisher.len(),
                p50: percentile(&publisher, 0.5),
                p90: percentile(&publisher, 0.9),
                pulse_samples: pipeline.len(),
                pulse_p50: percentile(&pipeline, 0.5),
                pulse_p90: percentile(&pipeline, 0.9),
                last_sample_at,
                timestamp_source: bufs.timestamp_source.clone(),
            };
            n_total += entry.samples;
            pub_weighted.add(entry.samples, entry.p50, entry.p90);
            pipe_weighted.add(entry.pulse_samples, entry.pulse_p50, entry.pulse_p90);
            by_source.insert(name.clone(), entry);
        }

        TelemetrySummary {
            n_total,
            window_ms: self.window_ms,
            by_source,
            global: GlobalLatency {
                p50: pub_weighted.p50(),
                p90: pub_weighted.p90(),
                pulse_p50: pipe_weighted.p50(),
                pulse_p90: pipe_weighted.p90(),
            },
        }
    }
}

fn windowed(buf: &VecDeque<Sample>, cutoff: u64) -> Vec<u64> {
    let mut v: Vec<u64> = buf
        .iter()
        .filter(|s| s.at >= cutoff)
        .map(|s| s.delta_ms)
        .collect();
    v.sort_unstable();
    v
}

/// Nearest-rank percentile over an ascending slice, no interpolation.
pub fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = (p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).floor() as usize;
    sorted.get(idx).copied()
}

// Sample-count weighted mean of per-source percentiles.
#[derive(Default)]
struct Weighted {
    n: u64,
    p50_sum: u128,
    p90_sum: u128,
}

impl Weighted {
    fn add(&mut self, n: usize, p50: Option<u64>, p90: Option<u64>) {
        let (Some(a), Some(b)) = (p50, p90) else {
            return;
        };
        let n = n as u64;
        self.n += n;
        self.p50_sum += u128::from(a) * u128::from(n);
        self.p90_sum += u128::from(b) * u128::from(n);
    }

    fn mean(&self, sum: u128) -> Option<u64> {
        (self.n > 0).then(|| (sum as f64 / self.n as f64).round() as u64)
    }

    fn p50(&self) -> Option<u64> {
        self.mean(self.p50_sum)
    }

    fn p90(&self) -> Option<u64> {
        self.mean(self.p90_sum)
    }
}
