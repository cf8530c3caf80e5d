//! Protocol module for the RadonEye readout payload.
//!
//! This module contains the decoding of the readout characteristic value
//! into calibrated sensor readings.

pub mod reading;

pub use reading::{SensorReading, CALIBRATION_FACTOR, PAYLOAD_LEN, READING_UNIT};
