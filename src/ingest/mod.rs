// src/ingest/mod.rs
pub mod adapters;
pub mod dedup;
pub mod fetch;
pub mod governor;
pub mod hub;
pub mod log_gate;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod telemetry;
pub mod types;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use metrics::{describe_counter, describe_gauge};
use once_cell::sync::OnceCell;
use regex::Regex;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_outcomes_total",
            "Classified poll outcomes per source."
        );
        describe_counter!(
            "ingest_items_published_total",
            "Items admitted and published per source."
        );
        describe_counter!(
            "ingest_adapter_errors_total",
            "Adapter ticks that returned an error."
        );
        describe_counter!("hub_events_sent_total", "Items fanned out by the hub.");
        describe_gauge!("hub_connections", "Live subscriber sinks.");
    });
}

/// Clean a headline: decode entities, strip tags, normalize quotes, collapse whitespace.
pub fn clean_title(s: &str) -> String {
    // Entities first so encoded markup (`&lt;b&gt;`) is stripped too.
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > 500 {
        out = out.chars().take(500).collect();
    }
    out
}

/// Feed and header timestamps to epoch ms. RFC 2822 first (RSS, HTTP `Date`),
/// then RFC 3339 (Atom), then a couple of loose forms seen in the wild.
pub fn parse_timestamp_ms(raw: &str) -> Option<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let ms = OffsetDateTime::parse(s, &Rfc2822)
        .ok()
        .map(|dt| dt.unix_timestamp_nanos() / 1_000_000)
        .and_then(|ms| i64::try_from(ms).ok())
        .or_else(|| DateTime::parse_from_rfc2822(s).ok().map(|d| d.timestamp_millis()))
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|d| d.timestamp_millis()))
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
                .ok()
                .map(|d| d.and_utc().timestamp_millis())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc().timestamp_millis())
        })?;
    u64::try_from(ms).ok()
}

/// quick-xml knows only the five XML entities; feeds routinely ship HTML ones.
pub(crate) fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
        .replace("&reg;", "(R)")
        .replace("&trade;", "(TM)")
        .replace("&copy;", "(C)")
}
