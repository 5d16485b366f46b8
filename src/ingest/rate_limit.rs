// src/ingest/rate_limit.rs
//! Per-host token buckets. Every source that points at the same upstream host draws
//! from the same bucket, so adding a feed never multiplies the request rate to a host.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;

/// Default budgets in requests per minute, keyed by registrable host, with the env
/// prefix that overrides each one (`<PREFIX>_BUDGET_PER_MIN`).
pub const DEFAULT_BUDGETS: &[(&str, &str, u32)] = &[
    ("prnewswire.com", "PRN", 12),
    ("sec.gov", "SEC", 10),
    ("nyse.com", "NYSE", 8),
    ("nasdaqtrader.com", "NASDAQ", 8),
    ("cmegroup.com", "CME", 8),
    ("businesswire.com", "BW", 6),
    ("federalreserve.gov", "FED", 8),
    ("globenewswire.com", "GNW", 8),
];

// Absorbs float drift so a claim at exactly the advertised wait always succeeds.
const TOKEN_EPSILON: f64 = 1e-9;

/// Classic token bucket with lazy, wall-clock driven refill.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    /// A bucket holding `per_minute` tokens, refilling at `per_minute / 60` per second.
    /// Starts full.
    pub fn per_minute(per_minute: u32, now_ms: u64) -> Self {
        let capacity = f64::from(per_minute);
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if now_ms > self.last_refill_ms {
            self.last_refill_ms = now_ms;
        }
    }

    /// Takes one token, or reports how long until one is available.
    pub fn claim(&mut self, now_ms: u64) -> Claim {
        self.refill(now_ms);
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Claim::Granted;
        }
        if self.capacity <= 0.0 {
            return Claim::Denied { wait_ms: u64::MAX };
        }
        // Refill is capacity per 60s, so ms-per-token is exactly 60_000 / capacity.
        let wait = (1.0 - self.tokens) * 60_000.0 / self.capacity;
        Claim::Denied {
            wait_ms: (wait - TOKEN_EPSILON).ceil().max(1.0) as u64,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Granted,
    Denied { wait_ms: u64 },
}

impl Claim {
    pub fn is_granted(&self) -> bool {
        matches!(self, Claim::Granted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_sec: f64,
}

/// Host-keyed limiter. `None` inside means the limiter is switched off and always grants.
#[derive(Debug)]
pub struct HostLimiter {
    budgets: HashMap<String, u32>,
    buckets: Option<Mutex<HashMap<String, TokenBucket>>>,
}

impl HostLimiter {
    pub fn new(budgets: HashMap<String, u32>) -> Self {
        Self {
            budgets,
            buckets: Some(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_budgets())
    }

    pub fn disabled() -> Self {
        Self {
            budgets: HashMap::new(),
            buckets: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.buckets.is_some()
    }

    /// Configured budget key for a request host: exact match or a parent domain
    /// (`www.sec.gov` draws from `sec.gov`).
    fn budget_key<'a>(&'a self, host: &str) -> Option<(&'a str, u32)> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.budgets
            .iter()
            .filter(|(k, _)| host == **k || host.ends_with(&format!(".{k}")))
            .max_by_key(|(k, _)| k.len())
            .map(|(k, v)| (k.as_str(), *v))
    }

    pub fn claim(&self, host: &str, now_ms: u64) -> Claim {
        let Some(buckets) = &self.buckets else {
            return Claim::Granted;
        };
        let Some((key, per_min)) = self.budget_key(host) else {
            return Claim::Granted;
        };
        let mut g = buckets.lock().expect("host limiter mutex poisoned");
        g.entry(key.to_string())
            .or_insert_with(|| TokenBucket::per_minute(per_min, now_ms))
            .claim(now_ms)
    }

    /// Per-host view for diagnostics. Hosts never claimed show as full.
    pub fn budgets(&self) -> BTreeMap<String, BucketSnapshot> {
        let Some(buckets) = &self.buckets else {
            return BTreeMap::new();
        };
        let g = buckets.lock().expect("host limiter mutex poisoned");
        self.budgets
            .iter()
            .map(|(host, per_min)| {
                let cap = f64::from(*per_min);
                let tokens = g.get(host).map_or(cap, TokenBucket::tokens);
                (
                    host.clone(),
                    BucketSnapshot {
                        capacity: cap,
                        tokens,
                        refill_per_sec: cap / 60.0,
                    },
                )
            })
            .collect()
    }
}

pub fn default_budgets() -> HashMap<String, u32> {
    DEFAULT_BUDGETS
        .iter()
        .map(|(h, _, b)| ((*h).to_string(), *b))
        .collect()
}

/// Env var overriding a default host budget, e.g. `BW_BUDGET_PER_MIN`.
pub fn budget_env_key(host: &str) -> Option<String> {
    DEFAULT_BUDGETS
        .iter()
        .find(|(h, _, _)| *h == host)
        .map(|(_, prefix, _)| format!("{prefix}_BUDGET_PER_MIN"))
}

/// Host part of a URL, lowercased.
pub fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
}
