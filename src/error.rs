//! Error types for the radoneye-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The controller rejected the connection attempt.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Operation requires a connection but no session is active.
    #[error("Sensor not connected")]
    NotConnected,

    /// A readout cycle was requested while a session is still active.
    #[error("A connection session is already active")]
    SessionBusy,

    /// A characteristic handle is unknown to the link.
    #[error("Characteristic not found: {handle:#06x}")]
    CharacteristicNotFound {
        /// The value handle that was looked up.
        handle: u16,
    },

    /// The sensor answered the trigger write with a non-success status.
    #[error("Write failed with GATT status {status:#04x}")]
    WriteFailed {
        /// The ATT status reported for the write.
        status: u16,
    },

    /// The readout request failed without returning a value.
    #[error("Read failed with GATT status {status:#04x}")]
    ReadFailed {
        /// The ATT status reported for the read.
        status: u16,
    },

    /// A sensor payload was too short to decode.
    #[error("Payload too short: expected at least {expected} bytes, got {actual}")]
    Decode {
        /// Minimum payload length.
        expected: usize,
        /// Received payload length.
        actual: usize,
    },

    /// A textual address or similar value could not be parsed.
    #[error("Invalid format for {input:?}: {reason}")]
    Format {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The reading could not be handed to the home-automation endpoint.
    #[error("Forwarding failed: {reason}")]
    Forwarding {
        /// Description of the delivery failure.
        reason: String,
    },

    /// HTTP transport error while forwarding.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The configuration is incomplete or inconsistent.
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },

    /// I/O error (configuration file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration JSON could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A readout cycle did not finish in time.
    #[error("Operation timed out")]
    Timeout,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a [`Error::Format`] for the given input.
    pub(crate) fn format(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Format {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`Error::Config`].
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<crate::gatt::CycleFailure> for Error {
    fn from(failure: crate::gatt::CycleFailure) -> Self {
        use crate::gatt::CycleFailure;

        match failure {
            CycleFailure::ConnectionRejected => Self::ConnectionFailed {
                reason: failure.to_string(),
            },
            CycleFailure::WriteRejected { status } => Self::WriteFailed { status },
            CycleFailure::ReadRejected { status } => Self::ReadFailed { status },
            CycleFailure::PayloadTooShort { len } => Self::Decode {
                expected: crate::protocol::PAYLOAD_LEN,
                actual: len,
            },
            CycleFailure::WatchdogExpired => Self::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::WriteFailed { status: 0x03 };
        assert_eq!(err.to_string(), "Write failed with GATT status 0x03");

        let err = Error::Decode {
            expected: 6,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "Payload too short: expected at least 6 bytes, got 2"
        );

        let err = Error::from(crate::gatt::CycleFailure::WriteRejected { status: 0x03 });
        assert_eq!(err.to_string(), "Write failed with GATT status 0x03");

        let err = Error::from(crate::gatt::CycleFailure::ReadRejected { status: 0x0E });
        assert_eq!(err.to_string(), "Read failed with GATT status 0x0e");

        let err = Error::CharacteristicNotFound { handle: 0x14 };
        assert_eq!(err.to_string(), "Characteristic not found: 0x0014");
    }
}
