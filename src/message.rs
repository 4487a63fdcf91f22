//! Composite surveillance messages and their dedup signatures.
//!
//! A `CompositeMessage` is the unit of ingest: one aircraft observation
//! with fields aggregated at the edge from the receiver's raw record
//! stream. Messages are immutable once built; everything downstream
//! passes them by value.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 24-bit ICAO transponder address, hex-encoded and uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IcaoId(String);

impl IcaoId {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IcaoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IcaoId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Which surveillance system produced an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    Adsb,
    Mlat,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Adsb => write!(f, "ADSB"),
            DataSource::Mlat => write!(f, "MLAT"),
        }
    }
}

/// WGS-84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// One aircraft observation, as bundled by an edge receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeMessage {
    /// ICAO hex address of the transmitting aircraft
    pub icao: IcaoId,
    /// Callsign, when an identification record has been seen
    pub callsign: Option<String>,
    /// Decoded position, when a position record has been seen
    pub position: Option<Position>,
    /// Pressure altitude in feet
    pub altitude: Option<i32>,
    /// Ground speed in knots
    pub ground_speed: Option<f32>,
    /// Track over ground in degrees
    pub track: Option<f32>,
    /// Vertical rate in feet/minute
    pub vertical_rate: Option<i32>,
    /// Transponder squawk code
    pub squawk: Option<String>,
    /// When the aircraft generated the transmission (edge clock, UTC)
    pub generated_at: DateTime<Utc>,
    /// Name of the edge receiver that heard it
    pub receiver: String,
    /// Which surveillance system produced it
    pub source: DataSource,
}

impl CompositeMessage {
    /// Content signature used for cross-receiver dedup.
    ///
    /// Two receivers reporting the same transmission produce messages that
    /// differ only in receiver name and in when each receiver's clock
    /// stamped them, so neither field participates. Everything else does.
    pub fn signature(&self) -> Signature {
        let mut s = String::with_capacity(64);
        s.push_str(self.icao.as_str());
        s.push('|');
        if let Some(ref callsign) = self.callsign {
            s.push_str(callsign);
        }
        s.push('|');
        if let Some(pos) = self.position {
            s.push_str(&format!("{:.5},{:.5}", pos.latitude, pos.longitude));
        }
        s.push('|');
        if let Some(alt) = self.altitude {
            s.push_str(&format!("{alt}"));
        }
        s.push('|');
        if let Some(gs) = self.ground_speed {
            s.push_str(&format!("{gs:.1}"));
        }
        s.push('|');
        if let Some(track) = self.track {
            s.push_str(&format!("{track:.1}"));
        }
        s.push('|');
        if let Some(vr) = self.vertical_rate {
            s.push_str(&format!("{vr}"));
        }
        s.push('|');
        if let Some(ref squawk) = self.squawk {
            s.push_str(squawk);
        }
        s.push('|');
        s.push_str(&self.source.to_string());
        Signature(s)
    }
}

impl fmt::Display for CompositeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>8} {:>6}f {:>4}k @{} [{}/{}]",
            self.icao,
            self.callsign.as_deref().unwrap_or("-"),
            self.altitude.unwrap_or(0),
            self.ground_speed.unwrap_or(0.0),
            self.generated_at.format("%H:%M:%S"),
            self.receiver,
            self.source,
        )
    }
}

/// Deterministic content key for a message. Equality on signatures is the
/// dedup contract: same content observed by different receivers collides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
