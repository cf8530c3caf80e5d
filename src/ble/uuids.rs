//! BLE Service and Characteristic UUIDs.
//!
//! Contains the RadonEye GATT profile identifiers and the fixed protocol
//! constants exchanged over it.

use uuid::Uuid;

// Standard GAP service, reported by every peripheral during discovery
/// Generic Access service UUID.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1800_0000_1000_8000_00805f9b34fb);
/// Device Name characteristic UUID.
pub const DEVICE_NAME_UUID: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_00805f9b34fb);

// Radon service (RadonEye custom, Nordic base)
/// RadonEye radon service UUID.
pub const RADON_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1523_1212_efde_1523_785feabcd123);
/// Trigger characteristic UUID (write). Writing [`TRIGGER_VALUE`] asks the
/// sensor to refresh the readout characteristic.
pub const RADON_TRIGGER_UUID: Uuid = Uuid::from_u128(0x0000_1524_1212_efde_1523_785feabcd123);
/// Readout characteristic UUID (read).
pub const RADON_READOUT_UUID: Uuid = Uuid::from_u128(0x0000_1525_1212_efde_1523_785feabcd123);

/// Value written to the trigger characteristic (`'P'`).
pub const TRIGGER_VALUE: u8 = 0x50;

/// Local name advertised by the sensor emulator.
pub const EMULATOR_LOCAL_NAME: &str = "RadonEye-Spoofer";

/// Check if a service UUID is the radon service.
pub fn is_radon_service(uuid: &Uuid) -> bool {
    *uuid == RADON_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            RADON_SERVICE_UUID.to_string(),
            "00001523-1212-efde-1523-785feabcd123"
        );
        assert_eq!(
            RADON_TRIGGER_UUID.to_string(),
            "00001524-1212-efde-1523-785feabcd123"
        );
        assert_eq!(
            RADON_READOUT_UUID.to_string(),
            "00001525-1212-efde-1523-785feabcd123"
        );
        assert!(GENERIC_ACCESS_SERVICE_UUID.to_string().contains("1800"));
    }

    #[test]
    fn test_is_radon_service() {
        assert!(is_radon_service(&RADON_SERVICE_UUID));
        assert!(!is_radon_service(&RADON_READOUT_UUID));
        assert!(!is_radon_service(&GENERIC_ACCESS_SERVICE_UUID));
    }

    #[test]
    fn test_trigger_value_is_ascii_p() {
        assert_eq!(TRIGGER_VALUE, b'P');
    }
}
