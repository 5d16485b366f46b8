//! pulse-ingest binary entrypoint.
//! Boots HTTP first, then the ingest scheduler when JOBS_ENABLED is set.
//!
//! See `README.md` for configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pulse_ingest::config::LogFormat;
use pulse_ingest::ingest::hub::spawn_heartbeat;
use pulse_ingest::metrics::Metrics;
use pulse_ingest::{build_deps, build_state, router, start_ingest, AppConfig, ConfigError};

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pulse_ingest=info,ingest=info,boot=info,warn"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().compact()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A bad config must not keep the HTTP surface down; fall back to defaults.
    let (cfg, cfg_err): (AppConfig, Option<ConfigError>) = match AppConfig::load() {
        Ok(c) => (c, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    init_tracing(cfg.log_format);
    if let Some(e) = cfg_err {
        tracing::error!(target: "boot", error = %e, "config invalid; running with defaults");
    }

    let metrics = Metrics::init()?;
    let deps = build_deps(&cfg);
    let state = build_state(&cfg, &deps);
    let ingest_slot = state.ingest.clone();

    let shutdown = CancellationToken::new();
    let heartbeat = spawn_heartbeat(
        deps.hub.clone(),
        Duration::from_millis(cfg.hub.heartbeat_ms),
        shutdown.clone(),
    );

    let app = router(state).merge(metrics.router());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        target: "boot",
        %addr,
        jobs_enabled = cfg.jobs_enabled,
        sse_enabled = cfg.sse_enabled,
        governor = cfg.governor.enabled,
        domain_budgets = cfg.domain_budgets,
        "listening"
    );

    if cfg.jobs_enabled {
        match start_ingest(&cfg, deps.clone()) {
            Ok(Some(handle)) => {
                let _ = ingest_slot.set(Arc::new(handle));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(target: "boot", error = %format!("{e:#}"), "ingest not started; serving HTTP only");
            }
        }
    } else {
        tracing::info!(target: "boot", "JOBS_ENABLED is off; ingest not started");
    }

    let stop = shutdown.clone();
    let hub = deps.hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(target: "boot", "shutdown requested");
            stop.cancel();
            hub.close_all();
        })
        .await?;

    if let Some(handle) = ingest_slot.get() {
        handle.shutdown();
        handle.join().await;
    }
    let _ = heartbeat.await;
    Ok(())
}
