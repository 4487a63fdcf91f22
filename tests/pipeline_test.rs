// End-to-end pipeline tests: dedup -> track buffer -> dispatcher ->
// workers, over real channels with a recording sink. The puller is not
// involved; bundles are injected where its output would arrive.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::timeout;

use skymux::dedup::DedupStage;
use skymux::dispatcher::{run_dispatcher, worker_for};
use skymux::message::{CompositeMessage, IcaoId};
use skymux::reference::{AirframeMap, ReferenceTables, ScheduleMap};
use skymux::sink::{PerfMap, TrackFragment, TrackStore, WriteOutcome};
use skymux::snapshot::{LogSnapshotSink, SnapshotPublisher};
use skymux::track_buffer::{Fragment, TrackBuffer, run_track_buffer};
use skymux::vitals::run_vitals;
use skymux::workers::Worker;

use common::message;

/// Records which worker persisted which aircraft, and the point
/// timestamps in arrival order.
#[derive(Clone, Default)]
struct Recorder {
    writes: Arc<Mutex<Vec<(usize, IcaoId, Vec<DateTime<Utc>>)>>>,
}

struct RecordingStore {
    worker_id: usize,
    recorder: Recorder,
}

#[async_trait]
impl TrackStore for RecordingStore {
    async fn add_track_fragment(
        &self,
        fragment: &TrackFragment,
        _airframes: &AirframeMap,
        _schedules: &ScheduleMap,
        perf: &mut PerfMap,
    ) -> Result<WriteOutcome> {
        perf.checkpoint("persist");
        self.writes_lock().push((
            self.worker_id,
            fragment.icao.clone(),
            fragment.points.iter().map(|p| p.timestamp).collect(),
        ));
        Ok(WriteOutcome { created: false })
    }
}

impl RecordingStore {
    fn writes_lock(&self) -> std::sync::MutexGuard<'_, Vec<(usize, IcaoId, Vec<DateTime<Utc>>)>> {
        self.recorder.writes.lock().unwrap()
    }
}

struct Pipeline {
    bundle_tx: mpsc::Sender<Vec<CompositeMessage>>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    recorder: Recorder,
}

/// Wire up everything downstream of the puller. The track buffer runs
/// with a zero max-age so fragments flush as soon as they arrive.
fn spawn_pipeline(worker_count: usize) -> Pipeline {
    let recorder = Recorder::default();
    let (vitals_tx, vitals_rx) = mpsc::channel(40);
    let mut handles = vec![tokio::spawn(run_vitals(vitals_rx))];

    let mut worker_txs = Vec::new();
    for id in 0..worker_count {
        let (tx, rx) = mpsc::channel::<Fragment>(3);
        worker_txs.push(tx);
        let store = Arc::new(RecordingStore {
            worker_id: id,
            recorder: recorder.clone(),
        });
        handles.push(tokio::spawn(
            Worker::new(id, rx, store, ReferenceTables::empty(), vitals_tx.clone()).run(),
        ));
    }

    let (fragment_tx, fragment_rx) = mpsc::channel::<Fragment>(3);
    handles.push(tokio::spawn(run_dispatcher(fragment_rx, worker_txs)));

    let (tracked_tx, tracked_rx) = mpsc::channel::<Vec<CompositeMessage>>(3);
    handles.push(tokio::spawn(run_track_buffer(
        TrackBuffer::with_max_age(chrono::Duration::zero()),
        tracked_rx,
        fragment_tx,
    )));

    let (bundle_tx, bundle_rx) = mpsc::channel::<Vec<CompositeMessage>>(20);
    let snapshots = SnapshotPublisher::new(Arc::new(LogSnapshotSink), vitals_tx.clone());
    handles.push(tokio::spawn(
        DedupStage::new(
            bundle_rx,
            tracked_tx,
            snapshots,
            ReferenceTables::empty(),
            vitals_tx,
        )
        .run(),
    ));

    Pipeline {
        bundle_tx,
        handles,
        recorder,
    }
}

impl Pipeline {
    async fn feed(&self, bundle: Vec<CompositeMessage>) {
        self.bundle_tx
            .send(bundle)
            .await
            .expect("pipeline accepts bundles");
    }

    /// Close the intake and wait for every stage to drain and exit.
    async fn shutdown(self) -> Vec<(usize, IcaoId, Vec<DateTime<Utc>>)> {
        let Pipeline {
            bundle_tx,
            handles,
            recorder,
        } = self;
        drop(bundle_tx);
        for handle in handles {
            timeout(Duration::from_secs(10), handle)
                .await
                .expect("stage exits promptly")
                .expect("stage does not panic");
        }
        recorder.writes.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn fragments_for_one_aircraft_stay_on_one_worker() {
    let pipeline = spawn_pipeline(4);

    for seq in 0..6 {
        pipeline.feed(vec![message("AAAAAA", seq)]).await;
        pipeline.feed(vec![message("BBBBBB", seq)]).await;
    }
    let writes = pipeline.shutdown().await;

    let mut worker_by_icao: HashMap<IcaoId, usize> = HashMap::new();
    for (worker_id, icao, _) in &writes {
        let expected = worker_for(icao, 4);
        assert_eq!(
            *worker_id, expected,
            "{icao} landed on worker {worker_id}, shard says {expected}"
        );
        if let Some(previous) = worker_by_icao.insert(icao.clone(), *worker_id) {
            assert_eq!(previous, *worker_id, "{icao} moved between workers");
        }
    }
    assert!(worker_by_icao.contains_key(&IcaoId::new("AAAAAA")));
    assert!(worker_by_icao.contains_key(&IcaoId::new("BBBBBB")));
}

#[tokio::test]
async fn per_aircraft_timestamps_are_monotonic_at_the_workers() {
    let pipeline = spawn_pipeline(4);

    for seq in 0..10 {
        pipeline
            .feed(vec![message("AAAAAA", seq), message("BBBBBB", seq)])
            .await;
    }
    let writes = pipeline.shutdown().await;

    let mut last_seen: HashMap<IcaoId, DateTime<Utc>> = HashMap::new();
    let mut points_seen = 0;
    for (_, icao, timestamps) in &writes {
        for ts in timestamps {
            if let Some(previous) = last_seen.get(icao) {
                assert!(
                    ts >= previous,
                    "{icao} went backwards: {previous} then {ts}"
                );
            }
            last_seen.insert(icao.clone(), *ts);
            points_seen += 1;
        }
    }
    assert_eq!(points_seen, 20, "every unique message reaches a worker");
}

#[tokio::test]
async fn duplicate_bundles_never_reach_the_workers() {
    let pipeline = spawn_pipeline(2);

    let bundle = vec![message("AAAAAA", 0), message("BBBBBB", 0)];
    pipeline.feed(bundle.clone()).await;
    pipeline.feed(bundle.clone()).await;

    // Same content again under fresh timestamps: still duplicates.
    let mut restamped = bundle.clone();
    for msg in &mut restamped {
        msg.generated_at = msg.generated_at + chrono::Duration::seconds(30);
    }
    pipeline.feed(restamped).await;

    let writes = pipeline.shutdown().await;
    let total_points: usize = writes.iter().map(|(_, _, ts)| ts.len()).sum();
    assert_eq!(total_points, 2, "only the first copy of each message lands");
}

#[tokio::test]
async fn every_worker_sees_only_its_own_shard() {
    let worker_count = 4;
    let pipeline = spawn_pipeline(worker_count);

    for i in 0..40 {
        pipeline.feed(vec![message(&format!("{i:06X}"), 0)]).await;
    }
    let writes = pipeline.shutdown().await;

    assert_eq!(writes.len(), 40);
    for (worker_id, icao, _) in &writes {
        assert_eq!(*worker_id, worker_for(icao, worker_count));
    }
}
