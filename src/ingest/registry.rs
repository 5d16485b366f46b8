// src/ingest/registry.rs
//! Known sources and how to build their adapters.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use regex::Regex;

use crate::error::ConfigError;
use crate::ingest::adapters::{AnchorAdapter, FeedAdapter};
use crate::ingest::fetch::{FetchConfig, HttpFetcher};
use crate::ingest::types::{SourceAdapter, SourceClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// RSS 2.0 or Atom.
    Feed,
    /// HTML page of links; only hrefs matching the pattern count as notices.
    Anchors { href_pattern: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceDef {
    pub key: &'static str,
    pub class: SourceClass,
    pub kind: SourceKind,
    pub default_url: Option<&'static str>,
}

impl SourceDef {
    /// Env var that overrides this source's URL, e.g. `SEC_PRESS_URL`.
    pub fn url_env(&self) -> String {
        format!("{}_URL", self.key.to_ascii_uppercase())
    }
}

const SOURCES: &[SourceDef] = &[
    SourceDef {
        key: "businesswire",
        class: SourceClass::Light,
        kind: SourceKind::Feed,
        default_url: Some("https://www.businesswire.com/portal/site/home/news/subject/?vnsId=31350&rss=1"),
    },
    SourceDef {
        key: "prnewswire",
        class: SourceClass::Light,
        kind: SourceKind::Feed,
        default_url: Some("https://www.prnewswire.com/rss/news-releases-list.rss"),
    },
    SourceDef {
        key: "globenewswire",
        class: SourceClass::Light,
        kind: SourceKind::Feed,
        default_url: None,
    },
    SourceDef {
        key: "sec_press",
        class: SourceClass::Light,
        kind: SourceKind::Feed,
        default_url: Some("https://www.sec.gov/news/pressreleases.rss"),
    },
    SourceDef {
        key: "fed_press",
        class: SourceClass::Light,
        kind: SourceKind::Feed,
        default_url: Some("https://www.federalreserve.gov/feeds/press_all.xml"),
    },
    SourceDef {
        key: "nasdaq_halts",
        class: SourceClass::Heavy,
        kind: SourceKind::Feed,
        default_url: Some("https://www.nasdaqtrader.com/rss.aspx?feed=tradehalts"),
    },
    SourceDef {
        key: "nyse_notices",
        class: SourceClass::Heavy,
        kind: SourceKind::Anchors {
            href_pattern: r"(?i)trader-update/",
        },
        default_url: Some("https://www.nyse.com/trader-update/history"),
    },
    SourceDef {
        key: "cme_notices",
        class: SourceClass::Heavy,
        kind: SourceKind::Anchors {
            href_pattern: r"(?i)notices?/",
        },
        default_url: Some("https://www.cmegroup.com/notices.html"),
    },
];

const ALIASES: &[(&str, &str)] = &[
    ("bw", "businesswire"),
    ("prn", "prnewswire"),
    ("gnw", "globenewswire"),
    ("sec", "sec_press"),
    ("fed", "fed_press"),
    ("nasdaq", "nasdaq_halts"),
    ("nyse", "nyse_notices"),
    ("cme", "cme_notices"),
];

pub fn known_sources() -> &'static [SourceDef] {
    SOURCES
}

pub fn lookup(key: &str) -> Option<&'static SourceDef> {
    SOURCES.iter().find(|d| d.key == key)
}

/// Canonical key: trimmed, lowercase, `-` as `_`, short aliases expanded.
pub fn canonical_name(raw: &str) -> String {
    let k = raw.trim().to_ascii_lowercase().replace('-', "_");
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == k)
        .map_or(k, |(_, full)| (*full).to_string())
}

/// Resolves a configured list to known sources, in order, without repeats.
/// Any unknown name fails the whole list.
pub fn resolve_sources(names: &[String]) -> Result<Vec<&'static SourceDef>, ConfigError> {
    let mut out: Vec<&'static SourceDef> = Vec::new();
    let mut unknown = Vec::new();
    for raw in names {
        let key = canonical_name(raw);
        if key.is_empty() {
            continue;
        }
        match lookup(&key) {
            Some(def) if !out.iter().any(|d| d.key == def.key) => out.push(def),
            Some(_) => {}
            None => unknown.push(raw.trim().to_string()),
        }
    }
    if !unknown.is_empty() {
        return Err(ConfigError::UnknownSources(unknown));
    }
    Ok(out)
}

/// Builds the adapter for `def`, or `None` when the source has no URL configured.
pub fn build_adapter(
    def: &SourceDef,
    url_overrides: &HashMap<String, String>,
    client: &reqwest::Client,
    fetch: &FetchConfig,
) -> Result<Option<Arc<dyn SourceAdapter>>> {
    let url = url_overrides
        .get(def.key)
        .map(String::as_str)
        .or(def.default_url)
        .filter(|u| !u.trim().is_empty());
    let Some(url) = url else {
        return Ok(None);
    };

    let fetcher = HttpFetcher::new(client.clone(), url, fetch.max_bytes);
    let adapter: Arc<dyn SourceAdapter> = match def.kind {
        SourceKind::Feed => Arc::new(FeedAdapter::new(def.key, fetcher)),
        SourceKind::Anchors { href_pattern } => Arc::new(AnchorAdapter::new(
            def.key,
            fetcher,
            Some(Regex::new(href_pattern)?),
        )?),
    };
    Ok(Some(adapter))
}
