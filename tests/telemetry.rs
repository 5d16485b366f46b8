// tests/telemetry.rs
use pulse_ingest::ingest::stats::{build_metrics_summary, StatsBoard};
use pulse_ingest::ingest::telemetry::{LatencyKind, LatencyTelemetry};

const T0: u64 = 1_760_000_000_000;

#[test]
fn nearest_rank_percentiles_per_source() {
    let tel = LatencyTelemetry::default();
    for d in [50, 10, 40, 20, 30] {
        tel.record("fed_press", LatencyKind::Publisher, T0 - d, T0);
    }
    let s = tel.summary(T0);
    let fed = &s.by_source["fed_press"];
    assert_eq!(fed.samples, 5);
    assert_eq!(fed.p50, Some(30));
    assert_eq!(fed.p90, Some(40));
    assert_eq!(fed.pulse_samples, 0);
    assert_eq!(fed.pulse_p50, None);
    assert_eq!(s.n_total, 5);
}

#[test]
fn samples_age_out_of_the_window() {
    let tel = LatencyTelemetry::new(60_000, 100);
    tel.record("bw", LatencyKind::Pipeline, T0 - 10, T0);
    tel.record("bw", LatencyKind::Pipeline, T0 + 50_000, T0 + 50_100);

    let s = tel.summary(T0 + 70_000);
    assert_eq!(s.by_source["bw"].pulse_samples, 1);
    assert_eq!(s.by_source["bw"].pulse_p50, Some(100));

    let s = tel.summary(T0 + 200_000);
    assert_eq!(s.by_source["bw"].pulse_samples, 0);
    assert_eq!(s.by_source["bw"].last_sample_at, None);
}

#[test]
fn cap_keeps_the_newest_samples() {
    let tel = LatencyTelemetry::new(3_600_000, 3);
    for (i, d) in [1_000, 2_000, 3, 4, 5].iter().enumerate() {
        let end = T0 + i as u64;
        tel.record("prn", LatencyKind::Publisher, end - d, end);
    }
    let s = tel.summary(T0 + 10);
    assert_eq!(s.by_source["prn"].samples, 3);
    assert_eq!(s.by_source["prn"].p90, Some(4));
}

#[test]
fn global_is_sample_weighted() {
    let tel = LatencyTelemetry::default();
    for _ in 0..3 {
        tel.record("a", LatencyKind::Publisher, T0 - 100, T0);
    }
    tel.record("b", LatencyKind::Publisher, T0 - 500, T0);
    let s = tel.summary(T0);
    // (3 * 100 + 1 * 500) / 4
    assert_eq!(s.global.p50, Some(200));
    assert_eq!(s.n_total, 4);
}

#[test]
fn metrics_summary_joins_scheduler_stats() {
    let tel = LatencyTelemetry::default();
    tel.record("sec_press", LatencyKind::Publisher, T0 - 800, T0);
    tel.set_timestamp_source("sec_press", "feed");
    let board = StatsBoard::default();
    board.update("sec_press", |s| s.record_status(200, T0));
    board.update("nyse_notices", |s| s.record_failure("timeout", T0));

    let m = build_metrics_summary(&tel.summary(T0), &board.snapshot());
    let v = serde_json::to_value(&m).unwrap();
    assert_eq!(v["n_total"], 1);
    assert_eq!(v["by_source"]["sec_press"]["publisher_p50_ms"], 800);
    assert_eq!(v["by_source"]["sec_press"]["timestamp_source"], "feed");
    assert_eq!(v["by_source"]["sec_press"]["scheduler"]["last_http_status"], 200);
    assert_eq!(v["by_source"]["nyse_notices"]["samples"], 0);
    assert_eq!(
        v["by_source"]["nyse_notices"]["scheduler"]["consecutive_failures"],
        1
    );
}
