//! Single-owner vitals collector.
//!
//! Counters, per-receiver summaries, worker-shard distribution, and
//! latency histograms all live inside one task; every stage reports by
//! sending an event down the collector's queue, and the admin surface
//! reads by sending a request with a reply channel. No atomics, no
//! locks, deterministic bookkeeping.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::tuning::{VITALS_DUMP_INTERVAL, VITALS_SUMMARY_INTERVAL};

/// How long the bus may go quiet before the liveness line turns into a
/// warning. Observation only; nothing is restarted automatically.
const QUIET_BUS_WARNING_SECS: i64 = 60;

/// Per-receiver delivery bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ReceiverSummary {
    pub messages: u64,
    pub bundles: u64,
    pub last_bundle: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum VitalsEvent {
    /// A bundle arrived from the bus.
    Bundle {
        receiver: String,
        messages: u64,
        last_message: DateTime<Utc>,
    },
    /// The dedup stage processed a bundle.
    FilterMessages {
        total: u64,
        new: u64,
        signatures: usize,
        aircraft: usize,
        dedup_millis: u64,
        airspace_text: String,
        airspace_bytes: usize,
    },
    /// A worker finished (or failed) a sink write.
    DbWrite {
        worker_id: usize,
        lookup_millis: u64,
        build_millis: u64,
        persist_millis: u64,
        total_millis: u64,
        created: bool,
        ok: bool,
    },
    /// A snapshot publish completed.
    SnapshotPublish {
        millis: u64,
        bytes: usize,
        ok: bool,
    },
    Reset,
    Summary {
        reply: oneshot::Sender<String>,
    },
    LastBundleTime {
        reply: oneshot::Sender<Option<DateTime<Utc>>>,
    },
}

/// Reservoir histogram: running count/sum/extremes plus a ring of recent
/// samples for percentile estimates.
#[derive(Debug, Clone)]
pub struct Histogram {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    samples: Vec<f64>,
    cursor: usize,
}

const HISTOGRAM_RESERVOIR: usize = 1024;

impl Histogram {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            samples: Vec::new(),
            cursor: 0,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.samples.len() < HISTOGRAM_RESERVOIR {
            self.samples.push(value);
        } else {
            self.samples[self.cursor] = value;
            self.cursor = (self.cursor + 1) % HISTOGRAM_RESERVOIR;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Percentile over the recent-sample reservoir.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    fn render(&self) -> String {
        if self.count == 0 {
            return "(no data)".to_string();
        }
        format!(
            "n={:<8} mean={:8.1} p50={:8.1} p90={:8.1} p99={:8.1} min={:.1} max={:.1}",
            self.count,
            self.mean(),
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
            self.min,
            self.max,
        )
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// The collector's state. Only [`run_vitals`] mutates it.
pub struct Vitals {
    started_at: DateTime<Utc>,
    n_bundles: u64,
    n_messages: u64,
    n_new: u64,
    n_dupes: u64,
    n_fragments: u64,
    n_write_errors: u64,
    n_snapshots: u64,
    n_snapshot_errors: u64,
    events_handled: u64,
    receivers: HashMap<String, ReceiverSummary>,
    workers: BTreeMap<usize, u64>,
    histograms: BTreeMap<&'static str, Histogram>,
    signature_count: usize,
    aircraft_count: usize,
    airspace_text: String,
    airspace_bytes: usize,
}

impl Vitals {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            n_bundles: 0,
            n_messages: 0,
            n_new: 0,
            n_dupes: 0,
            n_fragments: 0,
            n_write_errors: 0,
            n_snapshots: 0,
            n_snapshot_errors: 0,
            events_handled: 0,
            receivers: HashMap::new(),
            workers: BTreeMap::new(),
            histograms: BTreeMap::new(),
            signature_count: 0,
            aircraft_count: 0,
            airspace_text: String::new(),
            airspace_bytes: 0,
        }
    }

    fn histogram(&mut self, name: &'static str) -> &mut Histogram {
        self.histograms.entry(name).or_default()
    }

    /// Apply one event.
    pub fn apply(&mut self, event: VitalsEvent, now: DateTime<Utc>) {
        self.events_handled += 1;
        match event {
            VitalsEvent::Bundle {
                receiver,
                messages,
                last_message,
            } => {
                let summary = self.receivers.entry(receiver).or_default();
                summary.bundles += 1;
                summary.messages += messages;
                summary.last_bundle = Some(last_message);
                self.n_bundles += 1;
                self.n_messages += messages;
                self.histogram("bundle_size").record(messages as f64);
            }
            VitalsEvent::FilterMessages {
                total,
                new,
                signatures,
                aircraft,
                dedup_millis,
                airspace_text,
                airspace_bytes,
            } => {
                self.n_new += new;
                self.n_dupes += total.saturating_sub(new);
                self.signature_count = signatures;
                self.aircraft_count = aircraft;
                self.airspace_text = airspace_text;
                self.airspace_bytes = airspace_bytes;
                self.histogram("dedup_millis").record(dedup_millis as f64);
            }
            VitalsEvent::DbWrite {
                worker_id,
                lookup_millis,
                build_millis,
                persist_millis,
                total_millis,
                created: _,
                ok,
            } => {
                self.n_fragments += 1;
                if !ok {
                    self.n_write_errors += 1;
                }
                *self.workers.entry(worker_id).or_default() += 1;
                self.histogram("dbwrite_millis").record(total_millis as f64);
                self.histogram("lookup_millis").record(lookup_millis as f64);
                self.histogram("build_millis").record(build_millis as f64);
                self.histogram("persist_millis").record(persist_millis as f64);
            }
            VitalsEvent::SnapshotPublish { millis, bytes, ok } => {
                self.n_snapshots += 1;
                if !ok {
                    self.n_snapshot_errors += 1;
                }
                self.histogram("snapshot_millis").record(millis as f64);
                self.histogram("snapshot_bytes").record(bytes as f64);
            }
            VitalsEvent::Reset => self.reset(now),
            VitalsEvent::Summary { reply } => {
                let _ = reply.send(self.render(now));
            }
            VitalsEvent::LastBundleTime { reply } => {
                let _ = reply.send(self.last_bundle_time());
            }
        }
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        let events = self.events_handled;
        *self = Self::new(now);
        self.events_handled = events;
    }

    pub fn last_bundle_time(&self) -> Option<DateTime<Utc>> {
        self.receivers
            .values()
            .filter_map(|s| s.last_bundle)
            .max()
    }

    /// The full text dump served on the admin surface and logged
    /// periodically.
    pub fn render(&self, now: DateTime<Utc>) -> String {
        let mut receivers = String::new();
        let mut names: Vec<&String> = self.receivers.keys().collect();
        names.sort();
        for name in names {
            let s = &self.receivers[name];
            let age = s
                .last_bundle
                .map(|t| now.signed_duration_since(t).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(f64::NAN);
            receivers.push_str(&format!(
                "    {:<15.15}: {:7} msgs, {:7} bundles, last {:.1} s\n",
                name, s.messages, s.bundles, age
            ));
        }

        let mut workers = String::new();
        for (id, count) in &self.workers {
            workers.push_str(&format!("    {id:03}  {count:9}\n"));
        }

        let mut metrics = String::new();
        for (name, histogram) in &self.histograms {
            metrics.push_str(&format!("    {:<16} {}\n", name, histogram.render()));
        }

        let uptime = now.signed_duration_since(self.started_at);
        format!(
            "* {} messages ({} dupes; {} total; {} bundles received, {} frags written)\n\
             * Uptime: {}s (started {})\n\
             * Snapshots: {} published, {} failed; write errors: {}\n\
             * Dedup window: {} signatures, {} live aircraft\n\
             \n\
             * Receivers:-\n{}\n\
             * Workers:-\n{}\n\
             * Metrics:-\n{}\n\
             * Airspace ({} bytes, incl. deduping):-\n{}\n",
            self.n_new,
            self.n_dupes,
            self.n_messages,
            self.n_bundles,
            self.n_fragments,
            uptime.num_seconds(),
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.n_snapshots,
            self.n_snapshot_errors,
            self.n_write_errors,
            self.signature_count,
            self.aircraft_count,
            receivers,
            workers,
            metrics,
            self.airspace_bytes,
            self.airspace_text,
        )
    }
}

/// Resident set size from /proc, where available.
fn resident_set_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

/// The collector task. Exits when every sender has dropped, which is the
/// tail end of pipeline shutdown, so late events are never lost.
pub async fn run_vitals(mut inbound: mpsc::Receiver<VitalsEvent>) {
    let mut vitals = Vitals::new(Utc::now());
    let mut summary_tick = tokio::time::interval(VITALS_SUMMARY_INTERVAL);
    let mut dump_tick = tokio::time::interval(VITALS_DUMP_INTERVAL);
    summary_tick.tick().await;
    dump_tick.tick().await;

    loop {
        tokio::select! {
            maybe = inbound.recv() => match maybe {
                Some(event) => vitals.apply(event, Utc::now()),
                None => break,
            },
            _ = summary_tick.tick() => {
                let rss = resident_set_bytes()
                    .map(|b| format!("{:.1} MiB", b as f64 / (1024.0 * 1024.0)))
                    .unwrap_or_else(|| "?".to_string());
                info!(
                    "vitals: {} events, {} bundles, {} msgs ({} new), {} aircraft frags, rss {}",
                    vitals.events_handled,
                    vitals.n_bundles,
                    vitals.n_messages,
                    vitals.n_new,
                    vitals.n_fragments,
                    rss,
                );
                if let Some(last) = vitals.last_bundle_time() {
                    let quiet_secs = Utc::now().signed_duration_since(last).num_seconds();
                    if quiet_secs > QUIET_BUS_WARNING_SECS {
                        warn!("no bundle from any receiver for {quiet_secs}s");
                    }
                }
            }
            _ = dump_tick.tick() => {
                info!("vitals dump:\n{}", vitals.render(Utc::now()));
            }
        }
    }
    info!("vitals collector exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 1, 12, 0, 0).unwrap()
    }

    fn bundle_event(receiver: &str, messages: u64) -> VitalsEvent {
        VitalsEvent::Bundle {
            receiver: receiver.to_string(),
            messages,
            last_message: t0(),
        }
    }

    #[test]
    fn bundles_accumulate_per_receiver() {
        let mut v = Vitals::new(t0());
        v.apply(bundle_event("ScottsValley", 10), t0());
        v.apply(bundle_event("ScottsValley", 5), t0());
        v.apply(bundle_event("NorthPi", 3), t0());

        assert_eq!(v.n_bundles, 3);
        assert_eq!(v.n_messages, 18);
        assert_eq!(v.receivers["ScottsValley"].bundles, 2);
        assert_eq!(v.receivers["ScottsValley"].messages, 15);
        assert_eq!(v.receivers["NorthPi"].messages, 3);
    }

    #[test]
    fn filter_events_split_new_from_dupes() {
        let mut v = Vitals::new(t0());
        v.apply(
            VitalsEvent::FilterMessages {
                total: 10,
                new: 4,
                signatures: 10,
                aircraft: 4,
                dedup_millis: 2,
                airspace_text: String::new(),
                airspace_bytes: 0,
            },
            t0(),
        );
        assert_eq!(v.n_new, 4);
        assert_eq!(v.n_dupes, 6);
    }

    #[test]
    fn worker_distribution_is_tracked() {
        let mut v = Vitals::new(t0());
        for _ in 0..3 {
            v.apply(
                VitalsEvent::DbWrite {
                    worker_id: 7,
                    lookup_millis: 0,
                    build_millis: 0,
                    persist_millis: 5,
                    total_millis: 5,
                    created: false,
                    ok: true,
                },
                t0(),
            );
        }
        assert_eq!(v.workers[&7], 3);
        assert_eq!(v.n_fragments, 3);
        assert_eq!(v.n_write_errors, 0);
    }

    #[test]
    fn reset_clears_counters() {
        let mut v = Vitals::new(t0());
        v.apply(bundle_event("ScottsValley", 10), t0());
        v.apply(VitalsEvent::Reset, t0());

        assert_eq!(v.n_bundles, 0);
        assert!(v.receivers.is_empty());
    }

    #[test]
    fn last_bundle_time_is_the_freshest() {
        let mut v = Vitals::new(t0());
        v.apply(bundle_event("ScottsValley", 1), t0());
        v.apply(
            VitalsEvent::Bundle {
                receiver: "NorthPi".to_string(),
                messages: 1,
                last_message: t0() + chrono::Duration::seconds(30),
            },
            t0(),
        );
        assert_eq!(
            v.last_bundle_time(),
            Some(t0() + chrono::Duration::seconds(30))
        );
    }

    #[tokio::test]
    async fn last_bundle_time_event_replies() {
        let mut v = Vitals::new(t0());
        v.apply(bundle_event("ScottsValley", 1), t0());

        let (reply_tx, reply_rx) = oneshot::channel();
        v.apply(VitalsEvent::LastBundleTime { reply: reply_tx }, t0());
        assert_eq!(reply_rx.await.unwrap(), Some(t0()));
    }

    #[tokio::test]
    async fn summary_event_replies_with_the_dump() {
        let mut v = Vitals::new(t0());
        v.apply(bundle_event("NorthPi", 2), t0());

        let (reply_tx, reply_rx) = oneshot::channel();
        v.apply(VitalsEvent::Summary { reply: reply_tx }, t0());
        assert!(reply_rx.await.unwrap().contains("NorthPi"));
    }

    #[test]
    fn render_mentions_receivers_and_counts() {
        let mut v = Vitals::new(t0());
        v.apply(bundle_event("ScottsValley", 10), t0());
        let dump = v.render(t0() + chrono::Duration::seconds(60));
        assert!(dump.contains("ScottsValley"));
        assert!(dump.contains("1 bundles"));
        assert!(dump.contains("Uptime: 60s"));
    }

    #[test]
    fn histogram_percentiles_are_ordered() {
        let mut h = Histogram::new();
        for i in 1..=100 {
            h.record(i as f64);
        }
        assert_eq!(h.count(), 100);
        assert!(h.percentile(50.0) <= h.percentile(90.0));
        assert!(h.percentile(90.0) <= h.percentile(99.0));
        assert!((h.mean() - 50.5).abs() < 0.01);
    }

    #[test]
    fn histogram_reservoir_stays_bounded() {
        let mut h = Histogram::new();
        for i in 0..5000 {
            h.record(i as f64);
        }
        assert_eq!(h.count(), 5000);
        assert!(h.samples.len() <= HISTOGRAM_RESERVOIR);
    }
}
