//! Wire codec for message bundles.
//!
//! A bundle is the unit of delivery on the bus: an ordered sequence of
//! messages from one receiver, encoded as MessagePack with named fields.
//! Field names on the wire mean a decoder can skip fields it does not
//! know, so producers can grow the message shape without breaking older
//! consumers. The snapshot webhook body uses the same encoding.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::message::CompositeMessage;

/// Encode an ordered message sequence for publication.
pub fn encode(msgs: &[CompositeMessage]) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(msgs).context("encoding message bundle")
}

/// Decode a delivery payload. Any failure drops the whole bundle; the
/// producers emit well-formed payloads, so a bad one is not worth
/// salvaging partially.
pub fn decode(payload: &[u8]) -> Result<Vec<CompositeMessage>> {
    rmp_serde::from_slice(payload).context("decoding message bundle")
}

/// Encode an arbitrary value with the bundle conventions (named fields).
/// Used for the snapshot body and the sink fragment body.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).context("encoding payload")
}

/// Decode an arbitrary value encoded with [`encode_value`].
pub fn decode_value<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    rmp_serde::from_slice(payload).context("decoding payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DataSource, IcaoId, Position};
    use chrono::{TimeZone, Utc};

    fn sample() -> CompositeMessage {
        CompositeMessage {
            icao: IcaoId::new("AABBCC"),
            callsign: Some("SWA1234".to_string()),
            position: Some(Position {
                latitude: 37.3639,
                longitude: -121.9289,
            }),
            altitude: Some(12000),
            ground_speed: Some(310.0),
            track: Some(141.0),
            vertical_rate: Some(1024),
            squawk: None,
            generated_at: Utc.with_ymd_and_hms(2023, 4, 1, 20, 15, 30).unwrap(),
            receiver: "NorthPi".to_string(),
            source: DataSource::Adsb,
        }
    }

    #[test]
    fn bundle_survives_the_wire() {
        let msgs = vec![sample(), sample()];
        let decoded = decode(&encode(&msgs).unwrap()).unwrap();
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn decoder_tolerates_unknown_fields() {
        // A future producer that adds fields must not break this decoder.
        let wide = serde_json::json!([{
            "icao": "AABBCC",
            "callsign": "SWA1234",
            "position": { "latitude": 37.3639, "longitude": -121.9289 },
            "altitude": 12000,
            "ground_speed": 310.0,
            "track": 141.0,
            "vertical_rate": 1024,
            "squawk": null,
            "generated_at": "2023-04-01T20:15:30Z",
            "receiver": "NorthPi",
            "source": "ADSB",
            "ground_station_rssi": -17.5,
        }]);
        let payload = rmp_serde::to_vec_named(&wide).unwrap();

        let decoded = decode(&payload).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], sample());
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(decode(b"not a bundle").is_err());
        assert!(decode(&[]).is_err());
    }
}
