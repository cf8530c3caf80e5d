//! Radon readout payload decoding.
//!
//! The readout characteristic carries two reserved bytes followed by the
//! radon concentration as a little-endian IEEE-754 `f32` in pCi/L. Readings
//! are reported in Bq/m³, so decoded values are scaled by [`CALIBRATION_FACTOR`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};

/// Minimum readout payload size.
pub const PAYLOAD_LEN: usize = 6;

/// Offset of the float value within the payload.
const VALUE_OFFSET: usize = 2;

/// Conversion factor from the sensor's native pCi/L to Bq/m³.
pub const CALIBRATION_FACTOR: f32 = 37.0;

/// Unit of a calibrated reading.
pub const READING_UNIT: &str = "Bq/m³";

/// Decode the raw sensor value (pCi/L) from a readout payload.
pub fn decode_raw(payload: &[u8]) -> Result<f32> {
    if payload.len() < PAYLOAD_LEN {
        return Err(Error::Decode {
            expected: PAYLOAD_LEN,
            actual: payload.len(),
        });
    }

    let value = &payload[VALUE_OFFSET..VALUE_OFFSET + 4];
    Ok(f32::from_le_bytes([value[0], value[1], value[2], value[3]]))
}

/// Decode a readout payload into a calibrated value in Bq/m³.
///
/// # Example
///
/// ```
/// use radoneye_ble::protocol::reading::decode;
///
/// let value = decode(&[0x00, 0x00, 0x00, 0x00, 0x80, 0x3F]).unwrap();
/// assert!((value - 37.0).abs() < f32::EPSILON);
/// ```
pub fn decode(payload: &[u8]) -> Result<f32> {
    decode_raw(payload).map(|raw| raw * CALIBRATION_FACTOR)
}

/// Encode a raw sensor value (pCi/L) into the readout payload layout.
pub fn encode(raw_value: f32) -> [u8; PAYLOAD_LEN] {
    let mut payload = [0u8; PAYLOAD_LEN];
    payload[VALUE_OFFSET..].copy_from_slice(&raw_value.to_le_bytes());
    payload
}

/// A decoded radon measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// The payload as read from the sensor.
    pub raw: Bytes,
    /// The sensor value before calibration (pCi/L).
    pub raw_value: f32,
    /// The factor applied to obtain [`SensorReading::value`].
    pub calibration_factor: f32,
    /// The calibrated value in [`SensorReading::unit`].
    pub value: f32,
    /// Unit of the calibrated value.
    pub unit: &'static str,
    /// When the payload was received.
    pub taken_at: DateTime<Utc>,
}

impl SensorReading {
    /// Decode a reading from a readout payload, timestamped now.
    pub fn from_payload(payload: Bytes) -> Result<Self> {
        let raw_value = decode_raw(&payload)?;

        Ok(Self {
            raw: payload,
            raw_value,
            calibration_factor: CALIBRATION_FACTOR,
            value: raw_value * CALIBRATION_FACTOR,
            unit: READING_UNIT,
            taken_at: Utc::now(),
        })
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.value, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_one() {
        let value = decode(&[0x00, 0x00, 0x00, 0x00, 0x80, 0x3F]).unwrap();
        assert!((value - 37.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_decode_ignores_reserved_and_trailing_bytes() {
        let mut payload = vec![0xAB, 0xCD];
        payload.extend_from_slice(&0.5f32.to_le_bytes());
        payload.extend_from_slice(&[0xFF, 0xFF]);
        let value = decode(&payload).unwrap();
        assert!((value - 18.5).abs() < 1e-5);
    }

    #[test]
    fn test_decode_too_short() {
        for len in 0..PAYLOAD_LEN {
            let payload = vec![0u8; len];
            match decode(&payload) {
                Err(Error::Decode { expected, actual }) => {
                    assert_eq!(expected, PAYLOAD_LEN);
                    assert_eq!(actual, len);
                }
                other => panic!("unexpected result for {} bytes: {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_encode_layout() {
        let payload = encode(1.0);
        assert_eq!(payload, [0x00, 0x00, 0x00, 0x00, 0x80, 0x3F]);
    }

    #[test]
    fn test_reading_from_payload() {
        let reading = SensorReading::from_payload(Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x00, 0x00, 0x40,
        ]))
        .unwrap();
        assert!((reading.raw_value - 2.0).abs() < f32::EPSILON);
        assert!((reading.value - 74.0).abs() < 1e-4);
        assert_eq!(reading.calibration_factor, CALIBRATION_FACTOR);
        assert_eq!(reading.unit, READING_UNIT);
        assert_eq!(reading.raw.len(), PAYLOAD_LEN);
        assert_eq!(reading.to_string(), "74.00 Bq/m³");
    }

    #[test]
    fn test_reading_from_short_payload() {
        assert!(SensorReading::from_payload(Bytes::from_static(&[0x00, 0x00])).is_err());
    }
}
