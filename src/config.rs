// src/config.rs
//! Application configuration, resolved once at startup.
//!
//! Order: defaults, then an optional TOML file (`$PULSE_CONFIG_PATH`, else
//! `config/pulse.toml`), then environment overrides (`.env` is loaded first).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ingest::fetch::FetchConfig;
use crate::ingest::governor::GovernorConfig;
use crate::ingest::rate_limit::{budget_env_key, default_budgets, HostLimiter};
use crate::ingest::registry::known_sources;
use crate::ingest::scheduler::SchedulerConfig;

pub const ENV_CONFIG_PATH: &str = "PULSE_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/pulse.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub ring_cap: usize,
    pub heartbeat_ms: u64,
    /// Frames buffered per SSE client before it is considered too slow and dropped.
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ring_cap: 400,
            heartbeat_ms: 15_000,
            subscriber_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub jobs_enabled: bool,
    pub sse_enabled: bool,
    pub debug_routes: bool,
    /// Source names as configured; resolved against the registry at ingest start.
    pub sources: Vec<String>,
    pub domain_budgets: bool,
    /// Requests per minute by host.
    pub budgets: HashMap<String, u32>,
    /// Feed URL overrides by canonical source key.
    pub urls: HashMap<String, String>,
    pub log_format: LogFormat,
    pub governor: GovernorConfig,
    pub scheduler: SchedulerConfig,
    pub fetch: FetchConfig,
    pub hub: HubConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            jobs_enabled: false,
            sse_enabled: false,
            debug_routes: false,
            sources: Vec::new(),
            domain_budgets: true,
            budgets: default_budgets(),
            urls: HashMap::new(),
            log_format: LogFormat::default(),
            governor: GovernorConfig::default(),
            scheduler: SchedulerConfig::default(),
            fetch: FetchConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

impl AppConfig {
    /// Full startup resolution against the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env in local/dev; no-op when absent.
        let _ = dotenvy::dotenv();

        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => Self::from_file(Path::new(&p))?,
            Err(_) => {
                let p = PathBuf::from(DEFAULT_CONFIG_PATH);
                if p.exists() {
                    Self::from_file(&p)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        let mut cfg: AppConfig = toml::from_str(s)?;
        // Budgets listed in the file extend the defaults instead of replacing them.
        let mut merged = default_budgets();
        merged.extend(cfg.budgets.drain());
        cfg.budgets = merged;
        Ok(cfg)
    }

    /// Applies environment overrides through `get`, so tests can supply a map.
    pub fn apply_env<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("PORT") {
            self.port = parse_num("PORT", &v)?;
        }
        if let Some(v) = get("JOBS_ENABLED") {
            self.jobs_enabled = parse_flag("JOBS_ENABLED", &v)?;
        }
        if let Some(v) = get("SSE_ENABLED") {
            self.sse_enabled = parse_flag("SSE_ENABLED", &v)?;
        }
        if let Some(v) = get("DEBUG_ROUTES") {
            self.debug_routes = parse_flag("DEBUG_ROUTES", &v)?;
        }
        if let Some(v) = get("GOVERNOR_ENABLED") {
            self.governor.enabled = parse_flag("GOVERNOR_ENABLED", &v)?;
        }
        if let Some(v) = get("DOMAIN_BUDGETS") {
            self.domain_budgets = parse_flag("DOMAIN_BUDGETS", &v)?;
        }
        if let Some(v) = get("INGEST_SOURCES") {
            self.sources = split_list(&v);
        }
        if let Some(v) = get("FRESH_MS") {
            self.scheduler.filter.fresh_window_ms = parse_num("FRESH_MS", &v)?;
        }
        if let Some(v) = get("TICK_TIMEOUT_MS") {
            self.scheduler.tick_timeout_ms = parse_num("TICK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("MAX_BYTES_RSS") {
            self.fetch.max_bytes = parse_num("MAX_BYTES_RSS", &v)?;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.log_format = match v.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" | "compact" => LogFormat::Pretty,
                _ => return Err(invalid("LOG_FORMAT", &v)),
            };
        }

        for (host, budget) in self.budgets.iter_mut() {
            let Some(key) = budget_env_key(host) else {
                continue;
            };
            if let Some(v) = get(&key) {
                *budget = parse_num(&key, &v)?;
            }
        }

        for def in known_sources() {
            if let Some(v) = get(&def.url_env()) {
                self.urls.insert(def.key.to_string(), v);
            }
        }
        Ok(())
    }

    pub fn build_limiter(&self) -> HostLimiter {
        if self.domain_budgets {
            HostLimiter::new(self.budgets.clone())
        } else {
            HostLimiter::disabled()
        }
    }
}

/// Accepts `1/true/on/yes` and `0/false/off/no`, case-insensitively.
pub fn parse_flag(key: &str, v: &str) -> Result<bool, ConfigError> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(invalid(key, v)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, v: &str) -> Result<T, ConfigError> {
    v.trim().parse().map_err(|_| invalid(key, v))
}

fn invalid(key: &str, v: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: v.to_string(),
    }
}

/// Comma-separated list or a JSON array of strings. Blank entries are dropped.
pub fn split_list(v: &str) -> Vec<String> {
    let t = v.trim();
    if t.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<String>>(t) {
            return items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    t.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
