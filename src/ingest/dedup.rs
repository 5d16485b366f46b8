// src/ingest/dedup.rs
//! Per-source admission policy: seen-set dedup, freshness window, publish-time watermark,
//! and the no-change streak that lets a quiet source idle a little longer.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable item id: the feed's own guid when it has one, else a short SHA-256 over
/// `title \n url \n published_ms`.
pub fn fingerprint(guid: Option<&str>, title: &str, url: &str, published_ms: u64) -> String {
    if let Some(g) = guid.map(str::trim).filter(|g| !g.is_empty()) {
        return g.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(published_ms.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub fresh_window_ms: u64,
    pub seen_max: usize,
    pub seen_prune_to: usize,
    /// Empty cycles in a row before a quiet delay is suggested.
    pub quiet_after: u32,
    pub quiet_delay_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            fresh_window_ms: 5 * 60_000,
            seen_max: 3_000,
            seen_prune_to: 1_500,
            quiet_after: 3,
            quiet_delay_ms: 15_000,
        }
    }
}

/// Insertion-ordered bounded set. On overflow the oldest half is forgotten.
#[derive(Debug, Clone)]
pub struct SeenSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    max: usize,
    prune_to: usize,
}

impl SeenSet {
    pub fn new(max: usize, prune_to: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            max: max.max(1),
            prune_to: prune_to.min(max),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Returns false when the id was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.members.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > self.max {
            while self.order.len() > self.prune_to {
                if let Some(old) = self.order.pop_front() {
                    self.members.remove(&old);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accepted,
    Duplicate,
    Stale,
    BelowWatermark,
}

#[derive(Debug, Clone)]
pub struct SourceFilter {
    cfg: FilterConfig,
    seen: SeenSet,
    watermark_ms: Option<u64>,
    no_change_streak: u32,
}

impl SourceFilter {
    pub fn new(cfg: FilterConfig) -> Self {
        Self {
            seen: SeenSet::new(cfg.seen_max, cfg.seen_prune_to),
            cfg,
            watermark_ms: None,
            no_change_streak: 0,
        }
    }

    /// Admission order: duplicate, remember, stale, below watermark, accept.
    pub fn admit(&mut self, id: &str, published_ms: u64, fetched_at_ms: u64) -> Admission {
        if !self.seen.insert(id) {
            return Admission::Duplicate;
        }
        if published_ms < fetched_at_ms.saturating_sub(self.cfg.fresh_window_ms) {
            return Admission::Stale;
        }
        if self.watermark_ms.is_some_and(|w| published_ms <= w) {
            return Admission::BelowWatermark;
        }
        self.watermark_ms = Some(published_ms);
        Admission::Accepted
    }

    /// Marks an id as known without publishing it.
    pub fn seed(&mut self, id: &str) {
        self.seen.insert(id);
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Closes a poll cycle. Returns the quiet delay when the source has been
    /// idle long enough to deserve one.
    pub fn end_cycle(&mut self, accepted: usize) -> Option<u64> {
        if accepted > 0 {
            self.no_change_streak = 0;
            return None;
        }
        self.no_change_streak = self.no_change_streak.saturating_add(1);
        (self.no_change_streak >= self.cfg.quiet_after).then_some(self.cfg.quiet_delay_ms)
    }

    pub fn watermark_ms(&self) -> Option<u64> {
        self.watermark_ms
    }

    pub fn no_change_streak(&self) -> u32 {
        self.no_change_streak
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }
}

/// Layers the quiet suggestion over the governor delay: the smaller one wins.
pub fn layered_delay(governor_ms: u64, quiet_ms: Option<u64>) -> u64 {
    match quiet_ms {
        Some(q) => governor_ms.min(q),
        None => governor_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_760_000_000_000;

    #[test]
    fn guid_wins_over_hash() {
        assert_eq!(fingerprint(Some(" abc "), "t", "u", 1), "abc");
        let h = fingerprint(None, "t", "u", 1);
        assert_eq!(h.len(), 16);
        assert_eq!(h, fingerprint(Some(""), "t", "u", 1));
        assert_ne!(h, fingerprint(None, "t", "u", 2));
    }

    #[test]
    fn duplicate_is_rejected() {
        let mut f = SourceFilter::new(FilterConfig::default());
        assert_eq!(f.admit("a", NOW, NOW), Admission::Accepted);
        assert_eq!(f.admit("a", NOW + 1, NOW), Admission::Duplicate);
    }

    #[test]
    fn stale_is_remembered_but_not_accepted() {
        let mut f = SourceFilter::new(FilterConfig::default());
        let old = NOW - 5 * 60_000 - 1;
        assert_eq!(f.admit("old", old, NOW), Admission::Stale);
        assert!(f.has_seen("old"));
        assert_eq!(f.admit("old", NOW, NOW), Admission::Duplicate);
        // Exactly at the edge is still fresh.
        assert_eq!(f.admit("edge", NOW - 5 * 60_000, NOW), Admission::Accepted);
    }

    #[test]
    fn watermark_rejects_equal_and_older() {
        let mut f = SourceFilter::new(FilterConfig::default());
        assert_eq!(f.admit("a", NOW - 10, NOW), Admission::Accepted);
        assert_eq!(f.admit("b", NOW - 10, NOW), Admission::BelowWatermark);
        assert_eq!(f.admit("c", NOW - 20, NOW), Admission::BelowWatermark);
        assert_eq!(f.admit("d", NOW - 5, NOW), Admission::Accepted);
        assert_eq!(f.watermark_ms(), Some(NOW - 5));
    }

    #[test]
    fn seen_set_prunes_oldest_half() {
        let mut s = SeenSet::new(4, 2);
        for id in ["a", "b", "c", "d"] {
            s.insert(id);
        }
        assert_eq!(s.len(), 4);
        s.insert("e");
        assert_eq!(s.len(), 2);
        assert!(!s.contains("a"));
        assert!(s.contains("d") && s.contains("e"));
    }

    #[test]
    fn quiet_delay_after_three_empty_cycles() {
        let mut f = SourceFilter::new(FilterConfig::default());
        assert_eq!(f.end_cycle(0), None);
        assert_eq!(f.end_cycle(0), None);
        assert_eq!(f.end_cycle(0), Some(15_000));
        assert_eq!(f.end_cycle(1), None);
        assert_eq!(f.no_change_streak(), 0);
    }

    #[test]
    fn layered_delay_takes_minimum() {
        assert_eq!(layered_delay(1_200, None), 1_200);
        assert_eq!(layered_delay(1_200, Some(15_000)), 1_200);
        assert_eq!(layered_delay(120_000, Some(15_000)), 15_000);
    }
}
