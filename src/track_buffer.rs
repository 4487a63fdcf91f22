//! Groups deduplicated messages into per-aircraft track fragments.
//!
//! Messages pile up in a per-aircraft pending queue until the oldest one
//! crosses the age threshold, then the whole queue leaves as one
//! fragment. Storage writes are per-aircraft appends, so flushing young
//! queues amplifies writes and flushing late adds latency; the age knob
//! is that tradeoff.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::message::{CompositeMessage, IcaoId};
use crate::tuning::{FLUSH_TICK, MAX_FRAGMENT_AGE};

/// An ordered, non-empty run of messages for one aircraft, sorted
/// ascending by generated timestamp.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub icao: IcaoId,
    pub messages: Vec<CompositeMessage>,
}

impl Fragment {
    fn from_pending(icao: IcaoId, mut messages: Vec<CompositeMessage>) -> Self {
        messages.sort_by_key(|m| m.generated_at);
        Self { icao, messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub struct TrackBuffer {
    pending: HashMap<IcaoId, Vec<CompositeMessage>>,
    max_age: chrono::Duration,
}

impl TrackBuffer {
    pub fn new() -> Self {
        Self::with_max_age(
            chrono::Duration::from_std(MAX_FRAGMENT_AGE).unwrap_or(chrono::Duration::zero()),
        )
    }

    pub fn with_max_age(max_age: chrono::Duration) -> Self {
        Self {
            pending: HashMap::new(),
            max_age,
        }
    }

    /// Append a message to its aircraft's pending queue.
    pub fn add(&mut self, msg: CompositeMessage) {
        self.pending.entry(msg.icao.clone()).or_default().push(msg);
    }

    /// Remove and return every queue whose oldest message has aged out.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Vec<Fragment> {
        let max_age = self.max_age;
        let due: Vec<IcaoId> = self
            .pending
            .iter()
            .filter(|(_, msgs)| {
                msgs.iter()
                    .map(|m| m.generated_at)
                    .min()
                    .is_some_and(|oldest| now.signed_duration_since(oldest) > max_age)
            })
            .map(|(icao, _)| icao.clone())
            .collect();

        due.into_iter()
            .filter_map(|icao| {
                self.pending
                    .remove(&icao)
                    .map(|msgs| Fragment::from_pending(icao, msgs))
            })
            .collect()
    }

    /// Flush every non-empty queue regardless of age. Shutdown path.
    pub fn final_flush(&mut self) -> Vec<Fragment> {
        self.pending
            .drain()
            .filter(|(_, msgs)| !msgs.is_empty())
            .map(|(icao, msgs)| Fragment::from_pending(icao, msgs))
            .collect()
    }

    pub fn pending_aircraft(&self) -> usize {
        self.pending.len()
    }
}

impl Default for TrackBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The buffering stage: accepts deduplicated message runs, flushes by
/// age on a steady tick, and flushes everything on shutdown (signalled
/// by the inbound queue closing).
pub async fn run_track_buffer(
    mut buffer: TrackBuffer,
    mut inbound: mpsc::Receiver<Vec<CompositeMessage>>,
    outbound: mpsc::Sender<Fragment>,
) {
    let mut tick = tokio::time::interval(FLUSH_TICK);

    loop {
        tokio::select! {
            maybe = inbound.recv() => match maybe {
                Some(msgs) => {
                    for msg in msgs {
                        buffer.add(msg);
                    }
                    if !forward(&outbound, buffer.flush(Utc::now())).await {
                        return;
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                if !forward(&outbound, buffer.flush(Utc::now())).await {
                    return;
                }
            }
        }
    }

    let remaining = buffer.final_flush();
    if !remaining.is_empty() {
        info!("final flush: {} fragment(s)", remaining.len());
        forward(&outbound, remaining).await;
    }
    info!("track buffer exiting");
}

async fn forward(outbound: &mpsc::Sender<Fragment>, fragments: Vec<Fragment>) -> bool {
    for fragment in fragments {
        if outbound.send(fragment).await.is_err() {
            warn!("track buffer: dispatcher queue closed");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DataSource, Position};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 1, 12, 0, 0).unwrap()
    }

    fn message(icao: &str, at: DateTime<Utc>) -> CompositeMessage {
        CompositeMessage {
            icao: IcaoId::new(icao),
            callsign: None,
            position: Some(Position {
                latitude: 37.0,
                longitude: -122.0,
            }),
            altitude: Some(8000),
            ground_speed: Some(220.0),
            track: Some(45.0),
            vertical_rate: None,
            squawk: None,
            generated_at: at,
            receiver: "ScottsValley".to_string(),
            source: DataSource::Adsb,
        }
    }

    #[test]
    fn young_queues_are_not_flushed() {
        let mut tb = TrackBuffer::with_max_age(chrono::Duration::seconds(30));
        tb.add(message("AAAAAA", t0()));

        assert!(tb.flush(t0() + chrono::Duration::seconds(10)).is_empty());
        assert_eq!(tb.pending_aircraft(), 1);
    }

    #[test]
    fn aged_queue_leaves_as_one_fragment() {
        let mut tb = TrackBuffer::with_max_age(chrono::Duration::seconds(30));
        tb.add(message("AAAAAA", t0()));
        tb.add(message("AAAAAA", t0() + chrono::Duration::seconds(5)));

        let frags = tb.flush(t0() + chrono::Duration::seconds(31));
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].len(), 2);
        assert_eq!(tb.pending_aircraft(), 0);
    }

    #[test]
    fn oldest_message_drives_the_age_check() {
        let mut tb = TrackBuffer::with_max_age(chrono::Duration::seconds(30));
        tb.add(message("AAAAAA", t0()));
        // A late arrival does not reset the clock.
        tb.add(message("AAAAAA", t0() + chrono::Duration::seconds(29)));

        let frags = tb.flush(t0() + chrono::Duration::seconds(31));
        assert_eq!(frags.len(), 1);
    }

    #[test]
    fn fragments_are_sorted_by_generated_timestamp() {
        let mut tb = TrackBuffer::with_max_age(chrono::Duration::seconds(30));
        tb.add(message("AAAAAA", t0() + chrono::Duration::seconds(9)));
        tb.add(message("AAAAAA", t0()));
        tb.add(message("AAAAAA", t0() + chrono::Duration::seconds(4)));

        let frags = tb.flush(t0() + chrono::Duration::minutes(2));
        let times: Vec<_> = frags[0].messages.iter().map(|m| m.generated_at).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }

    #[test]
    fn flush_is_per_aircraft() {
        let mut tb = TrackBuffer::with_max_age(chrono::Duration::seconds(30));
        tb.add(message("AAAAAA", t0()));
        tb.add(message("BBBBBB", t0() + chrono::Duration::seconds(25)));

        let frags = tb.flush(t0() + chrono::Duration::seconds(31));
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].icao, IcaoId::new("AAAAAA"));
        assert_eq!(tb.pending_aircraft(), 1);
    }

    #[test]
    fn final_flush_empties_everything() {
        let mut tb = TrackBuffer::with_max_age(chrono::Duration::seconds(30));
        tb.add(message("AAAAAA", t0()));
        tb.add(message("BBBBBB", t0()));

        let mut frags = tb.final_flush();
        frags.sort_by(|a, b| a.icao.cmp(&b.icao));
        assert_eq!(frags.len(), 2);
        assert!(frags.iter().all(|f| !f.is_empty()));
        assert_eq!(tb.pending_aircraft(), 0);
    }
}
