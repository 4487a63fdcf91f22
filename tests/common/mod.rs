// Shared builders for integration tests.

use chrono::{DateTime, TimeZone, Utc};
use skymux::message::{CompositeMessage, DataSource, IcaoId, Position};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 4, 1, 12, 0, 0).unwrap()
}

/// A message with content varied by `seq`, so consecutive messages for
/// the same aircraft are never dedup duplicates.
pub fn message(icao: &str, seq: i64) -> CompositeMessage {
    CompositeMessage {
        icao: IcaoId::new(icao),
        callsign: Some(format!("TST{}", &icao[..3])),
        position: Some(Position {
            latitude: 37.0 + seq as f64 * 0.001,
            longitude: -122.0,
        }),
        altitude: Some(10_000 + (seq as i32) * 100),
        ground_speed: Some(300.0),
        track: Some(90.0),
        vertical_rate: Some(0),
        squawk: Some("1200".to_string()),
        generated_at: base_time() + chrono::Duration::seconds(seq),
        receiver: "ScottsValley".to_string(),
        source: DataSource::Adsb,
    }
}
