// src/ingest/governor.rs
//! Per-source adaptive polling governor.
//!
//! State is never stored as an enum: it is derived on every query from three deadlines
//! (`backoff_until`, `slow_until`, `fast_until`), checked in that order.
//!
//! Outcome transitions:
//! - `R403`  fixed 10 min penalty, does not compound inside the window
//! - `R429`  exponential ladder 120s, 240s, 480s, 600s (cap); reset by any success
//! - `TIMEOUT` three in a row demote the source to SLOW for 5 min
//! - `NEW` (or `HTTP_200` with a recently published item) promotes to FAST for 2 min
//!
//! A disabled governor is a separate `PollPolicy` impl chosen once in [`build_policy`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ingest::types::SourceClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GovState {
    Fast,
    Normal,
    Slow,
    Backoff,
}

impl GovState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "FAST",
            Self::Normal => "NORMAL",
            Self::Slow => "SLOW",
            Self::Backoff => "BACKOFF",
        }
    }
}

impl fmt::Display for GovState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified result of one poll attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Outcome {
    /// Success with at least one accepted item.
    #[serde(rename = "NEW")]
    New,
    /// Success, nothing new.
    #[serde(rename = "HTTP_200")]
    Http200,
    #[serde(rename = "HTTP_304")]
    Http304,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "R429")]
    R429,
    #[serde(rename = "R403")]
    R403,
    /// Any other failure. Counts as HTTP_200-class for backoff purposes.
    #[serde(rename = "ERROR")]
    Error,
}

impl Outcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Http200 => "HTTP_200",
            Self::Http304 => "HTTP_304",
            Self::Timeout => "TIMEOUT",
            Self::R429 => "R429",
            Self::R403 => "R403",
            Self::Error => "ERROR",
        }
    }

    /// Maps an adapter report to an outcome. `new_items` only matters for 2xx.
    pub fn from_status(http_status: u16, new_items: usize) -> Self {
        match http_status {
            200..=299 if new_items > 0 => Self::New,
            200..=299 => Self::Http200,
            304 => Self::Http304,
            429 => Self::R429,
            403 => Self::R403,
            408 | 504 => Self::Timeout,
            _ => Self::Error,
        }
    }

    fn is_success(&self) -> bool {
        matches!(self, Self::New | Self::Http200 | Self::Http304)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base delays for one source class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    pub fast_ms: u64,
    pub normal_ms: u64,
    pub slow_ms: u64,
}

impl Cadence {
    pub const LIGHT: Cadence = Cadence {
        fast_ms: 700,
        normal_ms: 1_200,
        slow_ms: 3_000,
    };
    pub const HEAVY: Cadence = Cadence {
        fast_ms: 1_500,
        normal_ms: 2_300,
        slow_ms: 6_000,
    };

    fn base_for(&self, state: GovState) -> u64 {
        match state {
            GovState::Fast => self.fast_ms,
            GovState::Slow => self.slow_ms,
            GovState::Normal | GovState::Backoff => self.normal_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub enabled: bool,
    pub light: Cadence,
    pub heavy: Cadence,
    pub fast_window_ms: u64,
    pub slow_window_ms: u64,
    pub timeout_streak_for_slow: u32,
    pub backoff_429_ms: u64,
    pub backoff_429_max_ms: u64,
    pub backoff_403_ms: u64,
    /// An HTTP_200 whose newest item is at most this old counts as "recent".
    pub fast_recency_ms: u64,
    pub jitter_pct: f64,
    pub min_delay_ms: u64,
    /// Delay returned by the fixed policy when the governor is disabled.
    pub default_delay_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            light: Cadence::LIGHT,
            heavy: Cadence::HEAVY,
            fast_window_ms: 2 * 60_000,
            slow_window_ms: 5 * 60_000,
            timeout_streak_for_slow: 3,
            backoff_429_ms: 120_000,
            backoff_429_max_ms: 600_000,
            backoff_403_ms: 600_000,
            fast_recency_ms: 120_000,
            jitter_pct: 0.15,
            min_delay_ms: 500,
            default_delay_ms: 1_200,
        }
    }
}

/// Polling policy consulted by the scheduler.
pub trait PollPolicy: Send + Sync {
    /// Associates a source with its cadence class. Unregistered sources are light.
    fn register(&self, source: &str, class: SourceClass);

    fn state(&self, source: &str, now_ms: u64) -> GovState;

    /// Remaining backoff when backing off, else the unjittered base delay.
    fn next_in_ms(&self, source: &str, now_ms: u64) -> u64;

    /// Applies the transition for `outcome` and returns the next polling delay.
    fn next_delay_after(
        &self,
        source: &str,
        outcome: Outcome,
        recency_ms: Option<u64>,
        now_ms: u64,
    ) -> u64;
}

/// The single on/off toggle for adaptive polling.
pub fn build_policy(cfg: &GovernorConfig) -> Arc<dyn PollPolicy> {
    if cfg.enabled {
        Arc::new(AdaptiveGovernor::new(cfg.clone()))
    } else {
        Arc::new(FixedCadence::new(cfg.default_delay_ms))
    }
}

/// Per-source transition state. All deadlines are wall-clock ms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceTrack {
    pub fast_until_ms: u64,
    pub slow_until_ms: u64,
    pub backoff_until_ms: u64,
    pub timeout_streak: u32,
    pub last_backoff_ms: u64,
}

impl SourceTrack {
    fn state(&self, now_ms: u64) -> GovState {
        if self.backoff_until_ms > now_ms {
            GovState::Backoff
        } else if self.slow_until_ms > now_ms {
            GovState::Slow
        } else if self.fast_until_ms > now_ms {
            GovState::Fast
        } else {
            GovState::Normal
        }
    }
}

#[derive(Debug, Default)]
struct Tracks {
    sources: HashMap<String, SourceTrack>,
    classes: HashMap<String, SourceClass>,
}

impl Tracks {
    fn entry(&mut self, source: &str) -> &mut SourceTrack {
        self.sources.entry(source.to_string()).or_default()
    }
}

/// Adaptive governor: FAST / NORMAL / SLOW / BACKOFF per source.
#[derive(Debug)]
pub struct AdaptiveGovernor {
    cfg: GovernorConfig,
    inner: Mutex<Tracks>,
}

impl AdaptiveGovernor {
    pub fn new(cfg: GovernorConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Tracks::default()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.cfg
    }

    /// Copy of a source's transition state, if it has been referenced.
    pub fn track(&self, source: &str) -> Option<SourceTrack> {
        let g = self.inner.lock().expect("governor mutex poisoned");
        g.sources.get(source).copied()
    }

    fn cadence(&self, class: Option<SourceClass>) -> &Cadence {
        match class {
            Some(SourceClass::Heavy) => &self.cfg.heavy,
            _ => &self.cfg.light,
        }
    }

    fn jittered(&self, base_ms: u64) -> u64 {
        let spread = (base_ms as f64 * self.cfg.jitter_pct).floor();
        let offset = if spread > 0.0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };
        let d = (base_ms as f64 + offset).max(0.0).floor() as u64;
        d.max(self.cfg.min_delay_ms)
    }
}

impl PollPolicy for AdaptiveGovernor {
    fn register(&self, source: &str, class: SourceClass) {
        let mut g = self.inner.lock().expect("governor mutex poisoned");
        g.classes.insert(source.to_string(), class);
        g.entry(source);
    }

    fn state(&self, source: &str, now_ms: u64) -> GovState {
        let mut g = self.inner.lock().expect("governor mutex poisoned");
        g.entry(source).state(now_ms)
    }

    fn next_in_ms(&self, source: &str, now_ms: u64) -> u64 {
        let mut g = self.inner.lock().expect("governor mutex poisoned");
        let class = g.classes.get(source).copied();
        let t = *g.entry(source);
        match t.state(now_ms) {
            GovState::Backoff => t.backoff_until_ms - now_ms,
            st => self.cadence(class).base_for(st),
        }
    }

    fn next_delay_after(
        &self,
        source: &str,
        outcome: Outcome,
        recency_ms: Option<u64>,
        now_ms: u64,
    ) -> u64 {
        let c = &self.cfg;
        let mut g = self.inner.lock().expect("governor mutex poisoned");
        let class = g.classes.get(source).copied();
        let t = g.entry(source);

        match outcome {
            Outcome::R403 => {
                t.backoff_until_ms = t.backoff_until_ms.max(now_ms + c.backoff_403_ms);
            }
            Outcome::R429 => {
                let next = if t.last_backoff_ms == 0 {
                    c.backoff_429_ms
                } else {
                    (t.last_backoff_ms * 2).min(c.backoff_429_max_ms)
                };
                t.last_backoff_ms = next;
                t.backoff_until_ms = t.backoff_until_ms.max(now_ms + next);
            }
            Outcome::Timeout => {
                t.timeout_streak += 1;
                if t.timeout_streak >= c.timeout_streak_for_slow {
                    t.slow_until_ms = t.slow_until_ms.max(now_ms + c.slow_window_ms);
                }
            }
            o if o.is_success() => {
                t.timeout_streak = 0;
                t.last_backoff_ms = 0;
            }
            _ => {}
        }

        let recent = recency_ms.is_some_and(|r| r <= c.fast_recency_ms);
        if outcome == Outcome::New || (outcome == Outcome::Http200 && recent) {
            t.fast_until_ms = t.fast_until_ms.max(now_ms + c.fast_window_ms);
        }

        let t = *t;
        drop(g);

        match t.state(now_ms) {
            GovState::Backoff => (t.backoff_until_ms - now_ms).max(c.min_delay_ms),
            st => self.jittered(self.cadence(class).base_for(st)),
        }
    }
}

/// What runs when the governor is switched off: constant cadence, no transitions.
#[derive(Debug, Clone, Copy)]
pub struct FixedCadence {
    delay_ms: u64,
}

impl FixedCadence {
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl PollPolicy for FixedCadence {
    fn register(&self, _source: &str, _class: SourceClass) {}

    fn state(&self, _source: &str, _now_ms: u64) -> GovState {
        GovState::Normal
    }

    fn next_in_ms(&self, _source: &str, _now_ms: u64) -> u64 {
        self.delay_ms
    }

    fn next_delay_after(&self, _: &str, _: Outcome, _: Option<u64>, _: u64) -> u64 {
        self.delay_ms
    }
}
