//! Centralized queue sizes and pipeline timing constants.
//!
//! Every bounded channel in the consolidator gets its capacity from here,
//! along with the windows and thresholds that pace the pipeline. Keeping
//! them in one place makes the backpressure story auditable: the pipeline
//! queues are deliberately tiny so that a slow stage stalls its upstream
//! instead of ballooning memory.

use std::time::Duration;

/// Inter-stage pipeline queues (puller -> dedup -> buffer -> dispatcher ->
/// worker). Single-digit capacity so the dedup stage paces the whole
/// pipeline; when downstream blocks, the puller stops pulling and the bus
/// slows delivery.
pub const PIPELINE_QUEUE_SIZE: usize = 3;

/// The puller's bundle funnel. Slightly deeper than the pipeline queues to
/// absorb delivery jitter from the bus without stalling acks.
pub const PULLER_QUEUE_SIZE: usize = 20;

/// Vitals collector inbound. Every stage reports here, so it gets more
/// headroom than the data path.
pub const VITALS_QUEUE_SIZE: usize = 40;

/// Maximum deliveries the bus may leave unacknowledged. Bounds in-flight
/// bundle memory when the pipeline is backed up.
pub const MAX_OUTSTANDING_DELIVERIES: i64 = 10;

/// Signature window rotation: roll when this much time has passed since
/// the last roll, or when the current set reaches this many entries,
/// whichever comes first.
pub const ROLL_AFTER: Duration = Duration::from_secs(5 * 60);
pub const ROLL_WHEN_THIS_MANY: usize = 20_000;

/// Aircraft whose latest message is older than this are dropped from the
/// live map at the next roll.
pub const MAX_QUIET_TIME: Duration = Duration::from_secs(5 * 60);

/// A per-aircraft pending queue is flushed once its oldest message is this
/// old. Lower values amplify storage writes; higher values add latency.
pub const MAX_FRAGMENT_AGE: Duration = Duration::from_secs(30);

/// At most one snapshot publish is started per window; extra triggers
/// coalesce into a single trailing publish.
pub const SNAPSHOT_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Reference table reload cadence, and how long the schedule table may go
/// without a successful reload before enrichment is suppressed.
pub const REFERENCE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
pub const SCHEDULE_STALE_AFTER: Duration = Duration::from_secs(20 * 60);

/// Puller reconnect backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// TrackBuffer age-check cadence when no bundles are arriving.
pub const FLUSH_TICK: Duration = Duration::from_secs(1);

/// Vitals logging cadence: a one-line liveness summary, and the full dump.
pub const VITALS_SUMMARY_INTERVAL: Duration = Duration::from_secs(5);
pub const VITALS_DUMP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Delay between the shutdown signal and process exit, giving detached
/// snapshot publishes a chance to complete.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(4);

/// Worker pool sizing.
pub const DEFAULT_WORKERS: usize = 256;
pub const DRY_RUN_WORKERS: usize = 16;
