// src/ingest/scheduler.rs
//! One driver task per source. Each source has exactly one pending deadline and at
//! most one adapter call in flight; triggers that land while a call is running are
//! coalesced into a single rerun.
//!
//! Per run:
//! 1. Running already: mark `PendingRerun` and return.
//! 2. Governor says BACKOFF: re-arm for the remaining backoff. No adapter call, no token.
//! 3. Host bucket denies: re-arm for `max(wait, 500ms)`. Not an outcome.
//! 4. Call `tick()` under the outer deadline; overrunning it is a TIMEOUT.
//! 5. Classify, feed the governor and the quiet-streak filter, re-arm with the smaller delay.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::ingest::dedup::{layered_delay, FilterConfig, SourceFilter};
use crate::ingest::governor::{GovState, Outcome, PollPolicy};
use crate::ingest::hub::Hub;
use crate::ingest::log_gate::WarnGate;
use crate::ingest::rate_limit::{Claim, HostLimiter};
use crate::ingest::sink::ItemSink;
use crate::ingest::stats::StatsBoard;
use crate::ingest::telemetry::LatencyTelemetry;
use crate::ingest::types::{now_ms, ProbeReport, SourceAdapter, SourceClass};

/// Shared state every runtime is built from. Owned by the caller, never global.
#[derive(Clone)]
pub struct IngestDeps {
    pub policy: Arc<dyn PollPolicy>,
    pub limiter: Arc<HostLimiter>,
    pub hub: Arc<Hub>,
    pub telemetry: Arc<LatencyTelemetry>,
    pub stats: Arc<StatsBoard>,
    pub warn_gate: Arc<WarnGate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Outer deadline for one adapter call.
    pub tick_timeout_ms: u64,
    pub min_rearm_ms: u64,
    pub filter: FilterConfig,
    pub light_boot_min_ms: u64,
    pub light_boot_max_ms: u64,
    /// Start offsets for heavy sources, cycled in registration order.
    pub heavy_boot_offsets_ms: Vec<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_timeout_ms: 2_000,
            min_rearm_ms: 500,
            filter: FilterConfig::default(),
            light_boot_min_ms: 500,
            light_boot_max_ms: 5_000,
            heavy_boot_offsets_ms: vec![120_000, 180_000, 240_000],
        }
    }
}

impl SchedulerConfig {
    /// First-run delay for the `nth_heavy`-th heavy source or any light one.
    pub fn boot_delay_ms(&self, class: SourceClass, nth_heavy: usize) -> u64 {
        match class {
            SourceClass::Heavy if !self.heavy_boot_offsets_ms.is_empty() => {
                self.heavy_boot_offsets_ms[nth_heavy % self.heavy_boot_offsets_ms.len()]
            }
            _ => {
                let lo = self.light_boot_min_ms.min(self.light_boot_max_ms);
                rand::rng().random_range(lo..=self.light_boot_max_ms.max(lo))
            }
        }
    }
}

/// A source ready to be scheduled.
#[derive(Clone)]
pub struct SourceSpec {
    pub adapter: Arc<dyn SourceAdapter>,
    pub class: SourceClass,
    /// Upstream host for rate budgeting. `None` skips the limiter.
    pub host: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    PendingRerun,
}

/// What one pass through the run algorithm did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    /// Governor backoff; the adapter was not called.
    Deferred,
    /// Host budget exhausted; the adapter was not called.
    Throttled,
    Polled(Outcome),
}

pub struct AdapterRuntime {
    name: String,
    adapter: Arc<dyn SourceAdapter>,
    class: SourceClass,
    host: Option<String>,
    deps: IngestDeps,
    cfg: SchedulerConfig,
    run_state: Mutex<RunState>,
    filter: tokio::sync::Mutex<SourceFilter>,
    deadline: Mutex<Instant>,
    next_eligible_ms: AtomicU64,
    rearmed: Notify,
    last_step: Mutex<Option<RunStep>>,
}

impl AdapterRuntime {
    pub fn new(spec: SourceSpec, deps: IngestDeps, cfg: SchedulerConfig) -> Self {
        let name = spec.adapter.name().to_string();
        deps.policy.register(&name, spec.class);
        Self {
            filter: tokio::sync::Mutex::new(SourceFilter::new(cfg.filter)),
            name,
            adapter: spec.adapter,
            class: spec.class,
            host: spec.host,
            deps,
            cfg,
            run_state: Mutex::new(RunState::Idle),
            deadline: Mutex::new(Instant::now()),
            next_eligible_ms: AtomicU64::new(now_ms()),
            rearmed: Notify::new(),
            last_step: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> SourceClass {
        self.class
    }

    pub fn run_state(&self) -> RunState {
        *self.run_state.lock().expect("run state mutex poisoned")
    }

    pub fn last_step(&self) -> Option<RunStep> {
        *self.last_step.lock().expect("run step mutex poisoned")
    }

    pub fn adapter(&self) -> &Arc<dyn SourceAdapter> {
        &self.adapter
    }

    /// Milliseconds until the pending deadline, zero when due.
    pub fn next_in_ms(&self) -> u64 {
        self.next_eligible_ms.load(Ordering::Relaxed).saturating_sub(now_ms())
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().expect("deadline mutex poisoned")
    }

    /// Replaces the single pending deadline.
    pub fn arm(&self, delay_ms: u64) {
        *self.deadline.lock().expect("deadline mutex poisoned") =
            Instant::now() + Duration::from_millis(delay_ms);
        self.next_eligible_ms
            .store(now_ms().saturating_add(delay_ms), Ordering::Relaxed);
        self.rearmed.notify_one();
    }

    /// Single-flight entry point. A call that finds a run in progress only marks a
    /// rerun, which the in-flight call performs once before going idle.
    pub async fn run(&self) {
        {
            let mut st = self.run_state.lock().expect("run state mutex poisoned");
            match *st {
                RunState::Idle => *st = RunState::Running,
                RunState::Running | RunState::PendingRerun => {
                    *st = RunState::PendingRerun;
                    return;
                }
            }
        }

        loop {
            let (step, delay) = self.run_once().await;
            *self.last_step.lock().expect("run step mutex poisoned") = Some(step);
            self.arm(delay);

            let mut st = self.run_state.lock().expect("run state mutex poisoned");
            if *st == RunState::PendingRerun {
                *st = RunState::Running;
                continue;
            }
            *st = RunState::Idle;
            break;
        }
    }

    async fn run_once(&self) -> (RunStep, u64) {
        let d = &self.deps;
        let now = now_ms();

        if d.policy.state(&self.name, now) == GovState::Backoff {
            let wait = d.policy.next_in_ms(&self.name, now).max(self.cfg.min_rearm_ms);
            tracing::debug!(target: "ingest", source = %self.name, wait_ms = wait, "in backoff");
            return (RunStep::Deferred, wait);
        }

        if let Some(host) = &self.host {
            if let Claim::Denied { wait_ms } = d.limiter.claim(host, now) {
                let wait = wait_ms.max(self.cfg.min_rearm_ms);
                tracing::debug!(target: "ingest", source = %self.name, %host, wait_ms = wait, "host budget exhausted");
                return (RunStep::Throttled, wait);
            }
        }

        let mut filter = self.filter.lock().await;
        let mut sink = ItemSink::new(&self.name, &mut filter, &d.hub, &d.telemetry, now);
        let limit = Duration::from_millis(self.cfg.tick_timeout_ms);
        let result = tokio::time::timeout(limit, self.adapter.tick(&mut sink)).await;
        let accepted = sink.accepted();
        let done = now_ms();
        let recency = sink.recency_ms(done);
        drop(sink);

        let outcome = match result {
            Err(_elapsed) => {
                d.stats
                    .update(&self.name, |s| s.record_failure("tick deadline exceeded", done));
                tracing::warn!(target: "ingest", source = %self.name, timeout_ms = self.cfg.tick_timeout_ms, "tick deadline exceeded");
                Outcome::Timeout
            }
            Ok(Ok(report)) => {
                d.stats
                    .update(&self.name, |s| s.record_status(report.http_status, done));
                Outcome::from_status(report.http_status, accepted)
            }
            Ok(Err(e)) => {
                let msg = format!("{e:#}");
                d.stats.update(&self.name, |s| s.record_failure(msg.clone(), done));
                if FetchError::is_timeout_in(&e) {
                    Outcome::Timeout
                } else {
                    counter!("ingest_adapter_errors_total", "source" => self.name.clone())
                        .increment(1);
                    if d.warn_gate.should_warn(&self.name, &msg, chrono::Utc::now()) {
                        tracing::warn!(target: "ingest", source = %self.name, error = %msg, "adapter tick failed");
                    }
                    Outcome::Error
                }
            }
        };
        counter!(
            "ingest_outcomes_total",
            "source" => self.name.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        let gov_ms = d.policy.next_delay_after(&self.name, outcome, recency, done);
        let quiet_ms = match outcome {
            Outcome::New | Outcome::Http200 | Outcome::Http304 => filter.end_cycle(accepted),
            _ => None,
        };
        let delay = layered_delay(gov_ms, quiet_ms);
        tracing::debug!(
            target: "ingest",
            source = %self.name,
            outcome = %outcome,
            accepted,
            delay_ms = delay,
            "tick done"
        );
        (RunStep::Polled(outcome), delay)
    }

    /// Side-effect-free health check for diagnostics.
    pub async fn probe(&self) -> anyhow::Result<ProbeReport> {
        let limit = Duration::from_millis(self.cfg.tick_timeout_ms);
        tokio::time::timeout(limit, self.adapter.probe_once())
            .await
            .map_err(|_| anyhow::Error::new(FetchError::Timeout))?
    }

    async fn drive(self: Arc<Self>, first_delay_ms: u64, token: CancellationToken) {
        self.arm(first_delay_ms);
        loop {
            let deadline = self.deadline();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.rearmed.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.run() => {}
                    }
                }
            }
        }
        tracing::debug!(target: "ingest", source = %self.name, "driver stopped");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterDebug {
    pub name: String,
    pub class: SourceClass,
    pub host: Option<String>,
    pub state: GovState,
    pub run_state: RunState,
    pub next_in_ms: u64,
    pub watermark_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestDebug {
    pub started: bool,
    pub enabled: Vec<String>,
    pub adapters: Vec<AdapterDebug>,
    pub budgets: BTreeMap<String, crate::ingest::rate_limit::BucketSnapshot>,
}

/// Owns the driver tasks. Dropping it does not stop them; call `shutdown`.
pub struct IngestHandle {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtimes: Vec<Arc<AdapterRuntime>>,
    deps: IngestDeps,
}

impl std::fmt::Debug for IngestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestHandle")
            .field("sources", &self.sources())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl IngestHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("ingest tasks mutex poisoned"));
        for t in tasks {
            let _ = t.await;
        }
    }

    pub fn runtime(&self, source: &str) -> Option<&Arc<AdapterRuntime>> {
        self.runtimes.iter().find(|r| r.name() == source)
    }

    pub fn sources(&self) -> Vec<String> {
        self.runtimes.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn debug(&self) -> IngestDebug {
        let now = now_ms();
        let adapters = self
            .runtimes
            .iter()
            .map(|r| AdapterDebug {
                name: r.name().to_string(),
                class: r.class,
                host: r.host.clone(),
                state: self.deps.policy.state(r.name(), now),
                run_state: r.run_state(),
                next_in_ms: r.next_in_ms(),
                watermark_ms: r.filter.try_lock().ok().and_then(|f| f.watermark_ms()),
            })
            .collect();
        IngestDebug {
            started: !self.token.is_cancelled(),
            enabled: self.sources(),
            adapters,
            budgets: self.deps.limiter.budgets(),
        }
    }
}

pub struct Scheduler {
    deps: IngestDeps,
    cfg: SchedulerConfig,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(deps: IngestDeps, cfg: SchedulerConfig) -> Self {
        Self {
            deps,
            cfg,
            started: AtomicBool::new(false),
        }
    }

    /// Builds one runtime per source and spawns its driver with boot staging.
    /// Only the first call starts anything.
    pub fn start(&self, specs: Vec<SourceSpec>) -> Option<IngestHandle> {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::warn!(target: "boot", "scheduler start called again; ignored");
            return None;
        }
        crate::ingest::ensure_metrics_described();

        let token = CancellationToken::new();
        let mut tasks = Vec::with_capacity(specs.len());
        let mut runtimes = Vec::with_capacity(specs.len());
        let mut nth_heavy = 0usize;

        for spec in specs {
            let class = spec.class;
            let first = self.cfg.boot_delay_ms(class, nth_heavy);
            if class == SourceClass::Heavy {
                nth_heavy += 1;
            }
            let rt = Arc::new(AdapterRuntime::new(spec, self.deps.clone(), self.cfg.clone()));
            tracing::info!(
                target: "boot",
                source = %rt.name(),
                class = ?class,
                first_run_in_ms = first,
                "source scheduled"
            );
            tasks.push(tokio::spawn(rt.clone().drive(first, token.clone())));
            runtimes.push(rt);
        }

        Some(IngestHandle {
            token,
            tasks: Mutex::new(tasks),
            runtimes,
            deps: self.deps.clone(),
        })
    }
}
