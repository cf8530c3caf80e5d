//! Advertising data parsing.
//!
//! Advertisement payloads are a sequence of AD structures, each laid out as
//! `[length, type, value...]` where `length` counts the type byte plus the
//! value. Payloads come from untrusted peers, so nothing here fails on
//! truncated or malformed input.

use std::fmt;

/// AD type for the shortened local name.
pub const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
/// AD type for the complete local name.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// AD type for manufacturer-specific data.
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Maximum legacy advertising payload size.
pub const MAX_ADV_DATA_LEN: usize = 31;

/// Find the value of the first AD structure with the given type.
///
/// Returns `None` if no such structure exists, or if the scan reaches a
/// structure whose declared length overruns the payload.
///
/// # Example
///
/// ```
/// use radoneye_ble::ble::advertising::find;
///
/// let payload = [0x04, 0x09, b'F', b'o', b'o'];
/// assert_eq!(find(0x09, &payload), Some(&b"Foo"[..]));
/// ```
pub fn find(ad_type: u8, payload: &[u8]) -> Option<&[u8]> {
    let mut i = 0;
    while i + 1 < payload.len() {
        let len = payload[i] as usize;
        if len == 0 {
            // Zero length marks the start of padding
            return None;
        }
        let end = i + 1 + len;
        if end > payload.len() {
            return None;
        }
        if payload[i + 1] == ad_type {
            return Some(&payload[i + 2..end]);
        }
        i = end;
    }
    None
}

/// Iterate over all well-formed AD structures as `(type, value)` pairs.
///
/// Iteration stops at the first malformed structure.
pub fn structures(payload: &[u8]) -> impl Iterator<Item = (u8, &[u8])> + '_ {
    let mut i = 0;
    std::iter::from_fn(move || {
        if i + 1 >= payload.len() {
            return None;
        }
        let len = payload[i] as usize;
        let end = i + 1 + len;
        if len == 0 || end > payload.len() {
            return None;
        }
        let item = (payload[i + 1], &payload[i + 2..end]);
        i = end;
        Some(item)
    })
}

/// A device name decoded from an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceName<'a> {
    /// The name was valid UTF-8.
    Text(&'a str),
    /// Raw bytes, when the name was not UTF-8 or no name was advertised.
    Raw(&'a [u8]),
}

impl DeviceName<'_> {
    /// Get the name as text, if it decoded.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(name) => Some(*name),
            Self::Raw(_) => None,
        }
    }
}

impl fmt::Display for DeviceName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(name) => write!(f, "{}", name),
            Self::Raw(bytes) => write!(f, "{:02x?}", bytes),
        }
    }
}

/// Decode the complete local name of an advertisement.
///
/// This is a debug aid and never fails: a name that is not valid UTF-8 is
/// returned as its raw bytes, and a payload without a (non-empty) name
/// structure is returned whole.
pub fn decode_name(payload: &[u8]) -> DeviceName<'_> {
    match find(AD_TYPE_COMPLETE_LOCAL_NAME, payload) {
        Some(name) if !name.is_empty() => match std::str::from_utf8(name) {
            Ok(text) => DeviceName::Text(text),
            Err(_) => DeviceName::Raw(name),
        },
        _ => DeviceName::Raw(payload),
    }
}

/// Encode a single AD structure.
///
/// Values longer than 254 bytes are truncated so the length byte stays valid.
pub fn encode_structure(ad_type: u8, value: &[u8]) -> Vec<u8> {
    let value = &value[..value.len().min(u8::MAX as usize - 1)];
    let mut out = Vec::with_capacity(value.len() + 2);
    out.push(value.len() as u8 + 1);
    out.push(ad_type);
    out.extend_from_slice(value);
    out
}

/// Build an advertisement payload carrying only a complete local name.
pub fn name_payload(name: &str) -> Vec<u8> {
    encode_structure(AD_TYPE_COMPLETE_LOCAL_NAME, name.as_bytes())
}
