// src/ingest/hub.rs
//! Fan-out of published items to live subscribers, plus a small ring of recent items
//! for snapshot reads. Subscribers are opaque sinks; a failing sink is dropped and
//! never affects the others.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ingest::types::{now_ms, BreakingItem};

pub const DEFAULT_RING_CAP: usize = 400;
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// One serialized event. The payload is shared, so fan-out never re-serializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: &'static str,
    pub data: Arc<str>,
}

impl Frame {
    pub fn hello(id: &str) -> Self {
        Self {
            event: "hello",
            data: serde_json::json!({ "id": id }).to_string().into(),
        }
    }

    pub fn ping(ts_ms: u64) -> Self {
        Self {
            event: "ping",
            data: ts_ms.to_string().into(),
        }
    }

    pub fn breaking(item: &BreakingItem) -> serde_json::Result<Self> {
        Ok(Self {
            event: "breaking",
            data: serde_json::to_string(item)?.into(),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("subscriber buffer full")]
    Full,
    #[error("subscriber disconnected")]
    Closed,
}

/// Anything that can accept frames without blocking the publisher.
pub trait EventSink: Send + Sync {
    fn send(&self, frame: &Frame) -> Result<(), SinkError>;
}

/// Sink backed by a bounded tokio channel. A full buffer counts as a failed write.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn send(&self, frame: &Frame) -> Result<(), SinkError> {
        self.tx.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub events_sent: u64,
}

pub struct Hub {
    sinks: Mutex<HashMap<u64, Arc<dyn EventSink>>>,
    ring: Mutex<VecDeque<BreakingItem>>,
    ring_cap: usize,
    next_key: AtomicU64,
    events_sent: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAP)
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("stats", &self.stats())
            .field("ring_cap", &self.ring_cap)
            .finish()
    }
}

impl Hub {
    pub fn new(ring_cap: usize) -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            ring: Mutex::new(VecDeque::with_capacity(ring_cap.min(4_096))),
            ring_cap: ring_cap.max(1),
            next_key: AtomicU64::new(1),
            events_sent: AtomicU64::new(0),
        }
    }

    /// Registers a sink and greets it with `hello`. Dropping the returned
    /// subscription unregisters the sink.
    pub fn subscribe_sink(self: &Arc<Self>, sink: Arc<dyn EventSink>) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let id = client_id();
        if sink.send(&Frame::hello(&id)).is_ok() {
            self.sinks
                .lock()
                .expect("hub sinks mutex poisoned")
                .insert(key, sink);
        }
        self.report_connections();
        tracing::debug!(target: "hub", client = %id, "subscriber connected");
        Subscription {
            hub: Arc::downgrade(self),
            key,
            id,
        }
    }

    /// Channel-backed subscription. The receiver sees `hello` first.
    pub fn subscribe(self: &Arc<Self>, buffer: usize) -> (Subscription, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer.max(2));
        let sub = self.subscribe_sink(Arc::new(ChannelSink::new(tx)));
        (sub, rx)
    }

    /// Sends the item to every live sink and returns how many accepted it.
    pub fn publish(&self, item: &BreakingItem) -> usize {
        let frame = match Frame::breaking(item) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(target: "hub", error = %e, id = %item.id, "item serialization failed");
                return 0;
            }
        };

        let delivered = self.broadcast(&frame);
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        counter!("hub_events_sent_total").increment(1);

        let mut ring = self.ring.lock().expect("hub ring mutex poisoned");
        ring.push_back(item.clone());
        while ring.len() > self.ring_cap {
            ring.pop_front();
        }
        delivered
    }

    /// Heartbeat to every sink. Not stored, not counted.
    pub fn ping(&self, ts_ms: u64) -> usize {
        self.broadcast(&Frame::ping(ts_ms))
    }

    fn broadcast(&self, frame: &Frame) -> usize {
        let (delivered, dropped) = {
            let mut sinks = self.sinks.lock().expect("hub sinks mutex poisoned");
            let before = sinks.len();
            sinks.retain(|_, s| s.send(frame).is_ok());
            (sinks.len(), before - sinks.len())
        };
        if dropped > 0 {
            tracing::debug!(target: "hub", dropped, "removed failing subscribers");
            self.report_connections();
        }
        delivered
    }

    /// Newest-first snapshot, optionally limited to some sources.
    pub fn recent(&self, limit: usize, sources: Option<&[String]>) -> Vec<BreakingItem> {
        let ring = self.ring.lock().expect("hub ring mutex poisoned");
        ring.iter()
            .rev()
            .filter(|it| sources.map_or(true, |s| s.iter().any(|w| w == &it.source)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections(),
            events_sent: self.events_sent.load(Ordering::Relaxed),
        }
    }

    pub fn connections(&self) -> usize {
        self.sinks.lock().expect("hub sinks mutex poisoned").len()
    }

    /// Drops every sink so channel-backed streams end. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let closed = {
            let mut sinks = self.sinks.lock().expect("hub sinks mutex poisoned");
            let n = sinks.len();
            sinks.clear();
            n
        };
        self.report_connections();
        closed
    }

    fn unsubscribe(&self, key: u64) {
        let removed = self
            .sinks
            .lock()
            .expect("hub sinks mutex poisoned")
            .remove(&key)
            .is_some();
        if removed {
            self.report_connections();
        }
    }

    fn report_connections(&self) {
        gauge!("hub_connections").set(self.connections() as f64);
    }
}

/// Registration guard for one subscriber.
#[derive(Debug)]
pub struct Subscription {
    hub: Weak<Hub>,
    key: u64,
    id: String,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.key);
            tracing::debug!(target: "hub", client = %self.id, "subscriber gone");
        }
    }
}

/// Pings every subscriber on a fixed period until cancelled.
pub fn spawn_heartbeat(hub: Arc<Hub>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; clients just got `hello`.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    hub.ping(now_ms());
                }
            }
        }
    })
}

fn client_id() -> String {
    let r: u32 = rand::rng().random();
    format!("{:x}{:08x}", now_ms(), r)
}
