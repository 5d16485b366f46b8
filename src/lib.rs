// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;

use std::sync::Arc;

use anyhow::Result;

pub use crate::api::{router, AppState};
pub use crate::config::AppConfig;
pub use crate::error::{ConfigError, FetchError};

use crate::ingest::governor::build_policy;
use crate::ingest::hub::Hub;
use crate::ingest::log_gate::WarnGate;
use crate::ingest::rate_limit::host_of;
use crate::ingest::registry::{build_adapter, resolve_sources};
use crate::ingest::scheduler::{IngestDeps, IngestHandle, Scheduler, SourceSpec};
use crate::ingest::stats::StatsBoard;
use crate::ingest::telemetry::LatencyTelemetry;

/// Wires the shared ingest state from configuration. Nothing is spawned here.
pub fn build_deps(cfg: &AppConfig) -> IngestDeps {
    IngestDeps {
        policy: build_policy(&cfg.governor),
        limiter: Arc::new(cfg.build_limiter()),
        hub: Arc::new(Hub::new(cfg.hub.ring_cap)),
        telemetry: Arc::new(LatencyTelemetry::default()),
        stats: Arc::new(StatsBoard::default()),
        warn_gate: Arc::new(WarnGate::default()),
    }
}

/// HTTP state sharing the hub, telemetry and stats with ingest.
pub fn build_state(cfg: &AppConfig, deps: &IngestDeps) -> AppState {
    AppState {
        sse_enabled: cfg.sse_enabled,
        debug_routes: cfg.debug_routes,
        subscriber_buffer: cfg.hub.subscriber_buffer,
        ..AppState::new(deps.hub.clone(), deps.telemetry.clone(), deps.stats.clone())
    }
}

/// Resolves configured sources and starts one driver per source.
///
/// Unknown names fail with [`ConfigError::UnknownSources`]. A list that resolves to
/// nothing (or only to sources without a URL) disables ingest and returns `Ok(None)`.
pub fn start_ingest(cfg: &AppConfig, deps: IngestDeps) -> Result<Option<IngestHandle>> {
    let defs = resolve_sources(&cfg.sources)?;
    if defs.is_empty() {
        tracing::warn!(target: "boot", "no ingest sources configured; ingest disabled");
        return Ok(None);
    }

    let client = crate::ingest::fetch::build_client(&cfg.fetch)?;
    let mut specs = Vec::with_capacity(defs.len());
    for def in defs {
        match build_adapter(def, &cfg.urls, &client, &cfg.fetch)? {
            Some(adapter) => {
                let url = cfg
                    .urls
                    .get(def.key)
                    .map(String::as_str)
                    .or(def.default_url)
                    .unwrap_or_default();
                specs.push(SourceSpec {
                    adapter,
                    class: def.class,
                    host: host_of(url),
                });
            }
            None => {
                tracing::warn!(target: "boot", source = def.key, env = %def.url_env(), "missing URL; source skipped");
            }
        }
    }
    if specs.is_empty() {
        tracing::warn!(target: "boot", "no ingest sources have a URL; ingest disabled");
        return Ok(None);
    }

    let names: Vec<&str> = specs.iter().map(|s| s.adapter.name()).collect();
    tracing::info!(target: "boot", sources = ?names, "starting ingest");
    Ok(Scheduler::new(deps, cfg.scheduler.clone()).start(specs))
}
