//! The consolidator: wires the stages together and runs until told to
//! stop.
//!
//! Topology is a straight line of bounded queues:
//!
//! ```text
//! puller -> dedup -> track buffer -> dispatcher -> worker[0..n]
//! ```
//!
//! with vitals and snapshot publishes as side channels. Shutdown is a
//! cancellation token plus channel closure: the token stops the puller,
//! the puller drops its sender, and each stage drains and exits when its
//! inbound closes, so nothing in flight is lost. A short grace delay at
//! the end lets detached snapshot publishes finish.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::admin::{self, AdminState};
use crate::dedup::DedupStage;
use crate::dispatcher::run_dispatcher;
use crate::message::CompositeMessage;
use crate::puller::{PubsubPuller, PullerConfig};
use crate::reference::{
    HttpReferenceProvider, NoopReferenceProvider, ReferenceProvider, ReferenceTables,
    run_refresher,
};
use crate::sink::{HttpTrackStore, LogTrackStore, TrackStore};
use crate::snapshot::{HttpSnapshotSink, LogSnapshotSink, SnapshotPublisher, SnapshotSink};
use crate::track_buffer::{Fragment, TrackBuffer, run_track_buffer};
use crate::tuning::{
    PIPELINE_QUEUE_SIZE, PULLER_QUEUE_SIZE, SHUTDOWN_GRACE, VITALS_QUEUE_SIZE,
};
use crate::vitals::{VitalsEvent, run_vitals};
use crate::workers::Worker;

pub struct ConsolidateConfig {
    pub nats_url: String,
    pub input_topic: String,
    pub subscription: String,
    pub snapshot_url: Option<String>,
    pub track_post_url: Option<String>,
    pub airframes_url: Option<String>,
    pub schedules_url: Option<String>,
    pub workers: usize,
    pub admin_port: u16,
    pub dry_run: bool,
    pub blacklist: Vec<String>,
}

pub async fn handle_consolidate(config: ConsolidateConfig) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "consolidate");
    });
    info!(
        "consolidator starting: topic '{}', {} workers{}",
        config.input_topic,
        config.workers,
        if config.dry_run { " (dry run)" } else { "" },
    );
    anyhow::ensure!(config.workers > 0, "worker count must be positive");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // Vitals first; every other stage reports into it.
    let (vitals_tx, vitals_rx) = mpsc::channel::<VitalsEvent>(VITALS_QUEUE_SIZE);
    let vitals_handle = tokio::spawn(run_vitals(vitals_rx));

    // Reference tables and their refresher.
    let references = ReferenceTables::empty();
    let provider: Arc<dyn ReferenceProvider> =
        match (&config.airframes_url, &config.schedules_url) {
            (Some(airframes), Some(schedules)) => {
                Arc::new(HttpReferenceProvider::new(airframes.clone(), schedules.clone()))
            }
            _ => {
                info!("no reference service configured; enrichment disabled");
                Arc::new(NoopReferenceProvider)
            }
        };
    let refresher_handle = tokio::spawn(run_refresher(
        references.clone(),
        provider,
        cancel.clone(),
    ));

    // Snapshot publisher.
    let snapshot_sink: Arc<dyn SnapshotSink> = match &config.snapshot_url {
        Some(url) => Arc::new(HttpSnapshotSink::new(url.clone())),
        None => {
            info!("no snapshot webhook configured; publishing to the log only");
            Arc::new(LogSnapshotSink)
        }
    };
    let snapshots = SnapshotPublisher::new(snapshot_sink, vitals_tx.clone());

    // Storage sink shared by the worker pool.
    let store: Arc<dyn TrackStore> = match &config.track_post_url {
        Some(url) => Arc::new(HttpTrackStore::new(url.clone())),
        None => {
            info!("no track sink configured; writes go to the log only");
            Arc::new(LogTrackStore)
        }
    };

    // The pipeline, wired back to front so each stage owns its inbound.
    let mut worker_txs = Vec::with_capacity(config.workers);
    let mut worker_handles = Vec::with_capacity(config.workers);
    for id in 0..config.workers {
        let (tx, rx) = mpsc::channel::<Fragment>(PIPELINE_QUEUE_SIZE);
        worker_txs.push(tx);
        worker_handles.push(tokio::spawn(
            Worker::new(id, rx, Arc::clone(&store), references.clone(), vitals_tx.clone()).run(),
        ));
    }

    let (fragment_tx, fragment_rx) = mpsc::channel::<Fragment>(PIPELINE_QUEUE_SIZE);
    let dispatcher_handle = tokio::spawn(run_dispatcher(fragment_rx, worker_txs));

    let (tracked_tx, tracked_rx) = mpsc::channel::<Vec<CompositeMessage>>(PIPELINE_QUEUE_SIZE);
    let buffer_handle = tokio::spawn(run_track_buffer(TrackBuffer::new(), tracked_rx, fragment_tx));

    let (bundle_tx, bundle_rx) = mpsc::channel::<Vec<CompositeMessage>>(PULLER_QUEUE_SIZE);
    let dedup_handle = tokio::spawn(
        DedupStage::new(
            bundle_rx,
            tracked_tx,
            Arc::clone(&snapshots),
            references.clone(),
            vitals_tx.clone(),
        )
        .run(),
    );

    let puller = PubsubPuller::new(
        PullerConfig {
            nats_url: config.nats_url.clone(),
            stream: config.input_topic.clone(),
            subscription: config.subscription.clone(),
            dry_run: config.dry_run,
            blacklist: config.blacklist.iter().cloned().collect::<HashSet<_>>(),
        },
        bundle_tx,
        vitals_tx.clone(),
        cancel.clone(),
    );
    let puller_handle = tokio::spawn(puller.run());

    // Admin surface. An unbindable port is a config mistake, so it is
    // fatal; after that the server holds its own vitals sender and exits
    // on cancel.
    let admin_listener = admin::bind(config.admin_port).await?;
    let admin_state = AdminState {
        vitals: vitals_tx.clone(),
        cancel: cancel.clone(),
    };
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_listener, admin_state).await {
            error!("admin surface failed: {e:#}");
        }
    });

    // Drop our own vitals sender so the collector can observe closure
    // once the stages are gone.
    drop(vitals_tx);

    // The pipeline drains front to back once the puller stops.
    let _ = puller_handle.await;
    cancel.cancel(); // covers the case where the puller died on its own
    let _ = dedup_handle.await;
    let _ = buffer_handle.await;
    let _ = dispatcher_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = admin_handle.await;
    let _ = refresher_handle.await;

    // Grace period for detached snapshot publishes, then let go: the
    // vitals collector exits once the publisher (the last sender it has)
    // is dropped, and a webhook that is still wedged past the grace is
    // not worth waiting on.
    let in_flight = snapshots.in_flight();
    if in_flight > 0 {
        info!("waiting on {in_flight} in-flight snapshot publish(es)");
    }
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    drop(snapshots);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), vitals_handle).await;

    info!("consolidator clean exit");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to register SIGTERM handler: {e}");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to register SIGINT handler: {e}");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
                _ = sigint.recv() => info!("SIGINT received, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {e}");
                return;
            }
            info!("ctrl-c received, shutting down");
        }

        cancel.cancel();
    });
}
