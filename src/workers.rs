//! The write worker pool.
//!
//! Each worker owns one inbound queue and is the only task that ever
//! writes fragments for the aircraft ids sharded onto it. A worker
//! converts the fragment to the sink format, hands it over with the
//! current lookup snapshots, and reports stage latencies. Sink failures
//! are logged and the fragment dropped; the sink is idempotent and this
//! pipeline tolerates transient loss.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::reference::ReferenceTables;
use crate::sink::{PerfMap, TrackFragment, TrackStore, WriteOutcome};
use crate::track_buffer::Fragment;
use crate::vitals::VitalsEvent;

pub struct Worker {
    id: usize,
    inbound: mpsc::Receiver<Fragment>,
    store: Arc<dyn TrackStore>,
    references: ReferenceTables,
    vitals: mpsc::Sender<VitalsEvent>,
}

impl Worker {
    pub fn new(
        id: usize,
        inbound: mpsc::Receiver<Fragment>,
        store: Arc<dyn TrackStore>,
        references: ReferenceTables,
        vitals: mpsc::Sender<VitalsEvent>,
    ) -> Self {
        Self {
            id,
            inbound,
            store,
            references,
            vitals,
        }
    }

    pub async fn run(mut self) {
        info!("worker {:03} starting", self.id);
        while let Some(fragment) = self.inbound.recv().await {
            self.persist(fragment).await;
        }
        info!("worker {:03} exiting", self.id);
    }

    async fn persist(&self, fragment: Fragment) {
        let mut perf = PerfMap::started();

        let (airframes, schedules) = self.references.snapshots(Utc::now()).await;
        perf.checkpoint("lookup");

        let track = TrackFragment::from_fragment(&fragment);
        perf.checkpoint("build");

        let outcome = self
            .store
            .add_track_fragment(&track, &airframes, &schedules, &mut perf)
            .await;

        let (ok, created) = match outcome {
            Ok(WriteOutcome { created }) => (true, created),
            Err(e) => {
                warn!(
                    "worker {:03}: dropping {} points for {}: {e:#}",
                    self.id,
                    track.points.len(),
                    track.icao,
                );
                (false, false)
            }
        };

        let _ = self
            .vitals
            .send(VitalsEvent::DbWrite {
                worker_id: self.id,
                lookup_millis: perf.stage_millis("start"),
                build_millis: perf.stage_millis("lookup"),
                persist_millis: perf.millis_after("build"),
                total_millis: perf.total_millis(),
                created,
                ok,
            })
            .await;
    }
}
