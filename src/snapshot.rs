//! Throttled publisher for the live-sky snapshot.
//!
//! The dedup stage triggers a publish whenever it admits new content,
//! which at busy times is many triggers per second. The publisher starts
//! at most one delivery per window; triggers inside the window coalesce
//! into a single trailing delivery carrying the newest snapshot, and the
//! actual POST always runs in a detached task so the dedup loop never
//! waits on the network. A failed publish is logged and forgotten; the
//! next trigger supersedes it.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::airspace::SkySnapshot;
use crate::bundle;
use crate::tuning::SNAPSHOT_MIN_INTERVAL;
use crate::vitals::VitalsEvent;

/// Delivery transport for an encoded snapshot body.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn deliver(&self, body: Vec<u8>) -> Result<()>;
}

/// POSTs the snapshot body to the shared-cache webhook.
pub struct HttpSnapshotSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSnapshotSink {
    pub fn new(url: String) -> Self {
        // A publish that takes longer than a few windows is superseded
        // anyway, so the client gets a firm deadline.
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, url }
    }
}

#[async_trait]
impl SnapshotSink for HttpSnapshotSink {
    async fn deliver(&self, body: Vec<u8>) -> Result<()> {
        self.client
            .post(&self.url)
            .body(body)
            .send()
            .await
            .context("posting snapshot")?
            .error_for_status()
            .context("snapshot webhook rejected body")?;
        Ok(())
    }
}

/// Dry-run transport: logs the would-be publish.
pub struct LogSnapshotSink;

#[async_trait]
impl SnapshotSink for LogSnapshotSink {
    async fn deliver(&self, body: Vec<u8>) -> Result<()> {
        debug!("would publish snapshot ({} bytes)", body.len());
        Ok(())
    }
}

struct ThrottleState {
    last_publish: Option<Instant>,
    pending: Option<SkySnapshot>,
    trailing_armed: bool,
    in_flight: u32,
}

pub struct SnapshotPublisher {
    sink: Arc<dyn SnapshotSink>,
    vitals: mpsc::Sender<VitalsEvent>,
    state: Mutex<ThrottleState>,
}

impl SnapshotPublisher {
    pub fn new(sink: Arc<dyn SnapshotSink>, vitals: mpsc::Sender<VitalsEvent>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            vitals,
            state: Mutex::new(ThrottleState {
                last_publish: None,
                pending: None,
                trailing_armed: false,
                in_flight: 0,
            }),
        })
    }

    /// Publishes in flight right now, for shutdown reporting.
    pub fn in_flight(&self) -> u32 {
        self.state.lock().unwrap().in_flight
    }

    /// Ask for the snapshot to reach the cache. Either starts a detached
    /// publish immediately, or coalesces into the trailing publish for
    /// the current throttle window.
    pub fn request_publish(self: &Arc<Self>, snapshot: SkySnapshot) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        // Time left in the current throttle window, if we are inside one.
        let window_remaining = state
            .last_publish
            .and_then(|last| SNAPSHOT_MIN_INTERVAL.checked_sub(now.duration_since(last)))
            .filter(|remaining| !remaining.is_zero());

        let Some(remaining) = window_remaining else {
            state.last_publish = Some(now);
            state.in_flight += 1;
            drop(state);

            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.publish(snapshot).await;
            });
            return;
        };

        // Newest snapshot wins; older coalesced ones are superseded.
        state.pending = Some(snapshot);
        if state.trailing_armed {
            return;
        }
        state.trailing_armed = true;
        drop(state);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let snapshot = {
                let mut state = this.state.lock().unwrap();
                state.trailing_armed = false;
                match state.pending.take() {
                    Some(snapshot) => {
                        state.last_publish = Some(Instant::now());
                        state.in_flight += 1;
                        snapshot
                    }
                    None => return,
                }
            };
            this.publish(snapshot).await;
        });
    }

    async fn publish(&self, snapshot: SkySnapshot) {
        let started = Instant::now();
        let result = match bundle::encode_value(&snapshot) {
            Ok(body) => {
                let bytes = body.len();
                self.sink.deliver(body).await.map(|_| bytes)
            }
            Err(e) => Err(e),
        };

        let (ok, bytes) = match result {
            Ok(bytes) => (true, bytes),
            Err(e) => {
                warn!("snapshot publish failed: {e:#}");
                (false, 0)
            }
        };

        let _ = self
            .vitals
            .send(VitalsEvent::SnapshotPublish {
                millis: started.elapsed().as_millis() as u64,
                bytes,
                ok,
            })
            .await;

        self.state.lock().unwrap().in_flight -= 1;
    }
}
