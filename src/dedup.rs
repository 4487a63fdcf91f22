//! The dedup stage: sole owner of the airspace.
//!
//! One task, no locks. Bundles come in from the puller; the subsequence
//! of genuinely new messages goes out to the track buffer in the same
//! order; a snapshot publish is requested whenever anything new was
//! admitted. The task exits when its inbound queue closes, which is how
//! shutdown drains the pipeline stage by stage.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::airspace::Airspace;
use crate::message::CompositeMessage;
use crate::reference::ReferenceTables;
use crate::snapshot::SnapshotPublisher;
use crate::vitals::VitalsEvent;

pub struct DedupStage {
    airspace: Airspace,
    inbound: mpsc::Receiver<Vec<CompositeMessage>>,
    outbound: mpsc::Sender<Vec<CompositeMessage>>,
    snapshots: Arc<SnapshotPublisher>,
    references: ReferenceTables,
    vitals: mpsc::Sender<VitalsEvent>,
}

impl DedupStage {
    pub fn new(
        inbound: mpsc::Receiver<Vec<CompositeMessage>>,
        outbound: mpsc::Sender<Vec<CompositeMessage>>,
        snapshots: Arc<SnapshotPublisher>,
        references: ReferenceTables,
        vitals: mpsc::Sender<VitalsEvent>,
    ) -> Self {
        Self {
            airspace: Airspace::new(Utc::now()),
            inbound,
            outbound,
            snapshots,
            references,
            vitals,
        }
    }

    pub async fn run(mut self) {
        while let Some(bundle) = self.inbound.recv().await {
            if !self.handle_bundle(bundle).await {
                break;
            }
        }
        info!("dedup stage exiting");
    }

    /// Returns false when downstream has gone away.
    async fn handle_bundle(&mut self, bundle: Vec<CompositeMessage>) -> bool {
        let started = Instant::now();
        let now = Utc::now();
        let total = bundle.len();

        let new_msgs = self.airspace.filter_new(&bundle, now);
        let new_count = new_msgs.len();

        if new_count > 0 {
            let (airframes, schedules) = self.references.snapshots(now).await;
            self.airspace.enrich(&new_msgs, &airframes, &schedules);

            debug!(
                "- {:2} were new ({:2} already seen) - {}",
                new_count,
                total - new_count,
                bundle[0].receiver,
            );
            if self.outbound.send(new_msgs).await.is_err() {
                return false;
            }
            self.snapshots.request_publish(self.airspace.sky_snapshot());
        }

        let airspace_text = self.airspace.render_table(now);
        let airspace_bytes = crate::bundle::encode_value(&self.airspace.sky_snapshot())
            .map(|b| b.len())
            .unwrap_or(0);
        let _ = self
            .vitals
            .send(VitalsEvent::FilterMessages {
                total: total as u64,
                new: new_count as u64,
                signatures: self.airspace.signature_count(),
                aircraft: self.airspace.aircraft_count(),
                dedup_millis: started.elapsed().as_millis() as u64,
                airspace_text,
                airspace_bytes,
            })
            .await;

        true
    }
}
