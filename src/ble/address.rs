//! Bluetooth device address handling.
//!
//! Converts between the 6-byte binary address used on the radio and the
//! canonical colon-separated hex text used in configuration and logs.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Number of bytes in a Bluetooth device address.
pub const ADDRESS_LEN: usize = 6;

/// A 6-byte Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BdAddress([u8; ADDRESS_LEN]);

impl BdAddress {
    /// Create an address from its raw bytes.
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Parse a textual address.
    ///
    /// Accepts six hex byte groups separated by colons (`AA:BB:CC:DD:EE:FF`)
    /// or the same twelve hex digits without separators. Hex digits may be of
    /// either case.
    ///
    /// # Example
    ///
    /// ```
    /// use radoneye_ble::ble::BdAddress;
    ///
    /// let addr = BdAddress::parse("c4:7c:8d:6a:00:1f").unwrap();
    /// assert_eq!(addr.to_string(), "C4:7C:8D:6A:00:1F");
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let digits: String = if text.contains(':') {
            let groups: Vec<&str> = text.split(':').collect();
            if groups.len() != ADDRESS_LEN || groups.iter().any(|g| g.len() != 2) {
                return Err(Error::format(
                    text,
                    "expected six colon-separated hex byte groups",
                ));
            }
            groups.concat()
        } else {
            text.to_string()
        };

        if digits.len() != ADDRESS_LEN * 2 {
            return Err(Error::format(
                text,
                format!("expected {} hex digits", ADDRESS_LEN * 2),
            ));
        }

        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::format(text, "contains non-hex characters"));
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &digits[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::format(text, format!("invalid hex byte {:?}", pair)))?;
        }

        Ok(Self(bytes))
    }

    /// Build an address from a byte slice, rejecting any length other than 6.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let bytes: [u8; ADDRESS_LEN] = raw.try_into().map_err(|_| {
            Error::format(
                format!("{:02x?}", raw),
                format!("expected {} address bytes, got {}", ADDRESS_LEN, raw.len()),
            )
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for BdAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for BdAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&[u8]> for BdAddress {
    type Error = Error;

    fn try_from(raw: &[u8]) -> Result<Self> {
        Self::from_slice(raw)
    }
}

impl From<[u8; ADDRESS_LEN]> for BdAddress {
    fn from(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<btleplug::api::BDAddr> for BdAddress {
    fn from(addr: btleplug::api::BDAddr) -> Self {
        Self(addr.into_inner())
    }
}

impl From<BdAddress> for btleplug::api::BDAddr {
    fn from(addr: BdAddress) -> Self {
        btleplug::api::BDAddr::from(addr.0)
    }
}

/// Decode raw address bytes into canonical text.
///
/// Fails with a format error when `raw` is not exactly 6 bytes long.
pub fn decode(raw: &[u8]) -> Result<String> {
    BdAddress::from_slice(raw).map(|addr| addr.to_string())
}

/// Encode a textual address into its 6 raw bytes.
pub fn encode(text: &str) -> Result<[u8; ADDRESS_LEN]> {
    BdAddress::parse(text).map(|addr| addr.0)
}

/// Bluetooth address type, as used when initiating a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AddressType {
    /// Public device address.
    #[default]
    Public = 0,
    /// Random (static or private) device address.
    Random = 1,
}

impl AddressType {
    /// Create from the raw value used in configuration (0 = public, otherwise random).
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::Public,
            _ => Self::Random,
        }
    }

    /// Convert to raw value.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }
}

impl From<btleplug::api::AddressType> for AddressType {
    fn from(value: btleplug::api::AddressType) -> Self {
        match value {
            btleplug::api::AddressType::Public => Self::Public,
            btleplug::api::AddressType::Random => Self::Random,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Random => write!(f, "random"),
        }
    }
}
