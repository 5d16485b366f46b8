// src/ingest/adapters/feed.rs
//! RSS 2.0 and Atom adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::de::from_str;
use serde::Deserialize;

use crate::ingest::fetch::HttpFetcher;
use crate::ingest::types::{now_ms, Candidate, ProbeReport, SourceAdapter, TickReport};
use crate::ingest::sink::ItemSink;
use crate::ingest::{clean_title, parse_timestamp_ms, scrub_html_entities_for_xml};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    #[serde(rename = "dc:date")]
    dc_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<Entry>,
}
#[derive(Debug, Deserialize)]
struct Entry {
    id: Option<String>,
    title: Option<Text>,
    #[serde(rename = "link", default)]
    link: Vec<Link>,
    updated: Option<String>,
    published: Option<String>,
}
#[derive(Debug, Deserialize)]
struct Link {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}
/// Element whose attributes we ignore (`<guid isPermaLink>`, `<title type>`).
#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

/// Parsed document. `inferred` is set when at least one entry had no usable date.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub items: Vec<Candidate>,
    pub inferred: bool,
}

impl ParsedFeed {
    pub fn timestamp_source(&self) -> &'static str {
        if self.inferred {
            "http-date"
        } else {
            "feed"
        }
    }

    pub fn latest_ms(&self) -> Option<u64> {
        self.items.iter().map(|c| c.published_at_ms).max()
    }
}

/// Parses RSS or Atom. Entries without a date get `fallback_ms` and fall back to
/// their link as identity, so re-stamping never makes them look new.
pub fn parse_feed(xml: &str, fallback_ms: u64) -> Result<ParsedFeed> {
    let xml_clean = scrub_html_entities_for_xml(xml);
    let head = xml_clean.get(..2_048).unwrap_or(&xml_clean);
    let is_atom = head.contains("<feed") && !head.contains("<rss");

    let mut out = ParsedFeed::default();
    let mut push = |title: Option<&str>, url: Option<&str>, guid: Option<&str>, date: Option<&str>| {
        let title = clean_title(title.unwrap_or_default());
        let url = url.map(str::trim).unwrap_or_default().to_string();
        if title.is_empty() || url.is_empty() {
            return;
        }
        let (published_at_ms, guid) = match date.and_then(parse_timestamp_ms) {
            Some(ms) => (ms, guid.map(str::to_string)),
            None => {
                out.inferred = true;
                (fallback_ms, Some(guid.unwrap_or(&url).to_string()))
            }
        };
        out.items.push(Candidate {
            guid: guid.filter(|g| !g.trim().is_empty()),
            title,
            url,
            published_at_ms,
        });
    };

    if is_atom {
        let feed: AtomFeed = from_str(&xml_clean).context("parsing atom xml")?;
        for e in &feed.entry {
            let href = e
                .link
                .iter()
                .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
                .or_else(|| e.link.first())
                .and_then(|l| l.href.as_deref());
            push(
                e.title.as_ref().map(|t| t.value.as_str()),
                href,
                e.id.as_deref(),
                e.published.as_deref().or(e.updated.as_deref()),
            );
        }
    } else {
        let rss: Rss = from_str(&xml_clean).context("parsing rss xml")?;
        for it in &rss.channel.item {
            push(
                it.title.as_deref(),
                it.link.as_deref(),
                it.guid.as_ref().map(|g| g.value.as_str()),
                it.pub_date.as_deref().or(it.dc_date.as_deref()),
            );
        }
    }
    Ok(out)
}

/// Polls one RSS/Atom URL with conditional GET.
#[derive(Debug)]
pub struct FeedAdapter {
    name: String,
    fetcher: HttpFetcher,
}

impl FeedAdapter {
    pub fn new(name: impl Into<String>, fetcher: HttpFetcher) -> Self {
        Self {
            name: name.into(),
            fetcher,
        }
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
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

        let parsed = parse_feed(body, resp.date_ms.unwrap_or(resp.received_at_ms))
            .with_context(|| format!("{} feed body", self.name))?;
        sink.set_timestamp_source(parsed.timestamp_source());

        // Oldest first, so the watermark admits every new entry in publish order.
        let mut items = parsed.items;
        items.sort_by_key(|c| c.published_at_ms);
        for c in items {
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
        let (parsed, notes) = match resp.body.as_deref() {
            Some(body) => match parse_feed(body, resp.date_ms.unwrap_or(finished)) {
                Ok(p) => (p, None),
                Err(e) => (ParsedFeed::default(), Some(format!("{e:#}"))),
            },
            None => (ParsedFeed::default(), Some(format!("no body (HTTP {})", resp.status))),
        };
        let parse_ms = t0.elapsed().as_millis() as u64;

        Ok(ProbeReport {
            source: self.name.clone(),
            ok: (200..300).contains(&resp.status) && notes.is_none(),
            http_status: resp.status,
            items_found: parsed.items.len(),
            latest_item_timestamp: parsed.latest_ms(),
            fetch_started_at: started,
            fetch_finished_at: finished,
            parse_ms,
            notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Wire</title>
<item><title>Acme &amp; Co &ndash; Q3 results</title><link>https://example.com/a</link>
<guid isPermaLink="false">bw-1</guid><pubDate>Tue, 07 Oct 2025 14:30:00 GMT</pubDate></item>
<item><title><![CDATA[Undated <b>notice</b>]]></title><link>https://example.com/b</link></item>
<item><title></title><link>https://example.com/c</link></item>
</channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"><title>SEC</title>
<entry><id>urn:sec:1</id><title type="html">Order &amp; notice</title>
<link rel="alternate" href="https://www.sec.gov/n/1"/><updated>2025-10-07T14:30:00Z</updated></entry>
</feed>"#;

    #[test]
    fn rss_items_with_guid_date_and_fallback() {
        let p = parse_feed(RSS, 42).unwrap();
        assert_eq!(p.items.len(), 2);
        assert_eq!(p.items[0].guid.as_deref(), Some("bw-1"));
        assert_eq!(p.items[0].title, "Acme & Co - Q3 results");
        assert_eq!(p.items[0].published_at_ms, 1_759_847_400_000);

        assert_eq!(p.items[1].title, "Undated notice");
        assert_eq!(p.items[1].published_at_ms, 42);
        assert_eq!(p.items[1].guid.as_deref(), Some("https://example.com/b"));
        assert_eq!(p.timestamp_source(), "http-date");
    }

    #[test]
    fn atom_entries() {
        let p = parse_feed(ATOM, 0).unwrap();
        assert_eq!(p.items.len(), 1);
        let c = &p.items[0];
        assert_eq!(c.url, "https://www.sec.gov/n/1");
        assert_eq!(c.guid.as_deref(), Some("urn:sec:1"));
        assert_eq!(c.title, "Order & notice");
        assert_eq!(p.timestamp_source(), "feed");
        assert_eq!(p.latest_ms(), Some(1_759_847_400_000));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_feed("<html><body>maintenance</body></html>", 0).is_err());
    }
}
