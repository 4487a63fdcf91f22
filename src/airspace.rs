//! Rolling dedup window and live aircraft map.
//!
//! The airspace is the dedup stage's entire state: two signature sets
//! covering the most recently seen message content, and the map of
//! aircraft currently in the sky. It is owned by a single task and never
//! locked; everything here is synchronous and takes `now` as a parameter
//! so tests control the clock.
//!
//! Window mechanics: signatures land in `current`; a roll moves `current`
//! to `previous` and empties `current`, so any signature survives between
//! one and two rolls before it is forgotten. Rolls fire on elapsed time,
//! and also whenever `current` reaches its size bound, which keeps memory
//! flat under arbitrary traffic.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{CompositeMessage, DataSource, IcaoId, Signature};
use crate::reference::{Airframe, AirframeMap, Schedule, ScheduleMap};
use crate::tuning::{MAX_QUIET_TIME, ROLL_AFTER, ROLL_WHEN_THIS_MANY};

/// Live record for one aircraft: its latest message plus whatever
/// enrichment the lookup tables had when we last saw it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AircraftData {
    pub message: CompositeMessage,
    pub messages_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airframe: Option<Airframe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    pub source: DataSource,
}

/// The minimal view shipped to the snapshot cache: just the aircraft map,
/// never the signature sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkySnapshot {
    pub aircraft: HashMap<IcaoId, AircraftData>,
}

pub struct Airspace {
    current_signatures: HashSet<Signature>,
    previous_signatures: HashSet<Signature>,
    aircraft: HashMap<IcaoId, AircraftData>,
    time_of_last_roll: DateTime<Utc>,
    roll_after: chrono::Duration,
    max_quiet_time: chrono::Duration,
    roll_when_this_many: usize,
}

impl Airspace {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_signatures: HashSet::new(),
            previous_signatures: HashSet::new(),
            aircraft: HashMap::new(),
            time_of_last_roll: now,
            roll_after: chrono::Duration::from_std(ROLL_AFTER).unwrap_or(chrono::Duration::zero()),
            max_quiet_time: chrono::Duration::from_std(MAX_QUIET_TIME)
                .unwrap_or(chrono::Duration::zero()),
            roll_when_this_many: ROLL_WHEN_THIS_MANY,
        }
    }

    #[cfg(test)]
    pub fn with_limits(
        now: DateTime<Utc>,
        roll_after: chrono::Duration,
        max_quiet_time: chrono::Duration,
        roll_when_this_many: usize,
    ) -> Self {
        let mut a = Self::new(now);
        a.roll_after = roll_after;
        a.max_quiet_time = max_quiet_time;
        a.roll_when_this_many = roll_when_this_many;
        a
    }

    /// Retire the older signature window and evict aircraft that have
    /// gone quiet.
    pub fn roll(&mut self, now: DateTime<Utc>) {
        self.previous_signatures = std::mem::take(&mut self.current_signatures);
        self.time_of_last_roll = now;

        let quiet = self.max_quiet_time;
        self.aircraft
            .retain(|_, data| now.signed_duration_since(data.message.generated_at) <= quiet);
    }

    /// Run one bundle through the window. Returns the messages that were
    /// new content, in bundle order; duplicates within the bundle keep the
    /// first occurrence. The live map is updated for every new message.
    pub fn filter_new(
        &mut self,
        msgs: &[CompositeMessage],
        now: DateTime<Utc>,
    ) -> Vec<CompositeMessage> {
        if now.signed_duration_since(self.time_of_last_roll) > self.roll_after {
            self.roll(now);
        }

        let mut new_msgs = Vec::new();
        for msg in msgs {
            if self.observe(msg, now) {
                let seen = self
                    .aircraft
                    .get(&msg.icao)
                    .map(|data| data.messages_seen)
                    .unwrap_or(0);
                self.aircraft.insert(
                    msg.icao.clone(),
                    AircraftData {
                        message: msg.clone(),
                        messages_seen: seen + 1,
                        airframe: None,
                        schedule: None,
                        source: msg.source,
                    },
                );
                new_msgs.push(msg.clone());
            }
        }
        new_msgs
    }

    /// Record one signature. True when the content has not been seen in
    /// either window.
    fn observe(&mut self, msg: &CompositeMessage, now: DateTime<Utc>) -> bool {
        let sig = msg.signature();
        if self.current_signatures.contains(&sig) {
            return false;
        }

        // Size bound: rolling before the insert keeps the current set at
        // or below its limit no matter how large a bundle is.
        if self.current_signatures.len() >= self.roll_when_this_many {
            self.roll(now);
        }

        let seen_previously = self.previous_signatures.contains(&sig);
        self.current_signatures.insert(sig);
        !seen_previously
    }

    /// Attach registration and schedule identity to the live records for
    /// the given messages. Missing lookups leave the record bare.
    pub fn enrich(
        &mut self,
        msgs: &[CompositeMessage],
        airframes: &AirframeMap,
        schedules: &ScheduleMap,
    ) {
        for msg in msgs {
            if let Some(data) = self.aircraft.get_mut(&msg.icao) {
                data.airframe = airframes.get(&msg.icao).cloned();
                data.schedule = data
                    .message
                    .callsign
                    .as_ref()
                    .and_then(|callsign| schedules.get(callsign))
                    .cloned();
            }
        }
    }

    pub fn sky_snapshot(&self) -> SkySnapshot {
        SkySnapshot {
            aircraft: self.aircraft.clone(),
        }
    }

    pub fn signature_count(&self) -> usize {
        self.current_signatures.len()
    }

    pub fn aircraft_count(&self) -> usize {
        self.aircraft.len()
    }

    /// Age of the freshest message in the live map.
    pub fn youngest(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.aircraft
            .values()
            .map(|data| now.signed_duration_since(data.message.generated_at))
            .min()
    }

    /// One line per live aircraft, sorted by id, for the vitals dump.
    pub fn render_table(&self, now: DateTime<Utc>) -> String {
        let mut ids: Vec<&IcaoId> = self.aircraft.keys().collect();
        ids.sort();

        let mut out = String::new();
        for id in ids {
            let data = &self.aircraft[id];
            let msg = &data.message;
            let registration = data
                .airframe
                .as_ref()
                .map(|af| af.registration.as_str())
                .unwrap_or("");
            out.push_str(&format!(
                " {:>8.8}/{}/{:<8.8} ({} last:{:6.1}s, {:5} msgs) {:5}f, {:4}k\n",
                msg.callsign.as_deref().unwrap_or(""),
                msg.icao,
                registration,
                msg.source,
                now.signed_duration_since(msg.generated_at).num_milliseconds() as f64 / 1000.0,
                data.messages_seen,
                msg.altitude.unwrap_or(0),
                msg.ground_speed.unwrap_or(0.0) as i64,
            ));
        }
        out
    }
}
