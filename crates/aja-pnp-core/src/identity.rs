//! Persistent device identifiers
//!
//! A device identity is the string `0x` + 8 lowercase hex digits of board ID +
//! `/` + 16 lowercase hex digits of serial number, e.g.
//! `0x10538200/0000000000a1b2c3`. It is 27 characters long and is the only thing
//! this crate expects callers to persist across runs.
//!
//! Decoders only look at fixed offsets, so characters past byte 27 are ignored.
//! Anything shorter, or without the `0x` / `/` markers in place, never decodes.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a canonical identity string
pub const IDENTITY_LEN: usize = 27;

const PREFIX: &str = "0x";
const SEPARATOR_POS: usize = 10;
const BOARD_ID_RANGE: std::ops::Range<usize> = 2..10;
const SERIAL_RANGE: std::ops::Range<usize> = 11..27;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity too short: {0} characters, need at least 27")]
    TooShort(usize),
    #[error("identity does not start with '0x'")]
    MissingPrefix,
    #[error("identity has no '/' at offset 10")]
    MissingSeparator,
    #[error("identity {field} is not hexadecimal")]
    InvalidHex { field: &'static str },
}

/// Canonical device key built from a board ID and serial number.
///
/// The empty identity stands for a device whose identification registers
/// could not be read (currently NTV4 boards).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Encode a board ID and serial number. Never fails.
    pub fn new(board_id: u32, serial: u64) -> Self {
        Self(encode(board_id, serial))
    }

    /// Identity for a device that has no readable identification
    pub fn unknown() -> Self {
        Self(String::new())
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode both components
    pub fn decode(&self) -> Result<(u32, u64), IdentityError> {
        decode(&self.0)
    }

    pub fn board_id(&self) -> Option<u32> {
        decode_board_id(&self.0).ok()
    }

    pub fn serial(&self) -> Option<u64> {
        decode_serial(&self.0).ok()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceIdentity {
    type Err = IdentityError;

    /// Only well-formed identities parse; trailing characters are dropped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (board_id, serial) = decode(s)?;
        Ok(Self::new(board_id, serial))
    }
}

impl AsRef<str> for DeviceIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Lets maps keyed by identity be queried with a plain &str
impl Borrow<str> for DeviceIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// `0x{board_id:08x}/{serial:016x}`
pub fn encode(board_id: u32, serial: u64) -> String {
    format!("{PREFIX}{}/{}", encode_board_id(board_id), encode_serial(serial))
}

/// Eight lowercase hex digits, zero padded
pub fn encode_board_id(board_id: u32) -> String {
    format!("{board_id:08x}")
}

/// Sixteen lowercase hex digits, zero padded
pub fn encode_serial(serial: u64) -> String {
    format!("{serial:016x}")
}

pub fn decode(identity: &str) -> Result<(u32, u64), IdentityError> {
    Ok((decode_board_id(identity)?, decode_serial(identity)?))
}

/// Decode only the board ID (bytes 2..10).
pub fn decode_board_id(identity: &str) -> Result<u32, IdentityError> {
    check_length(identity)?;
    if !identity.starts_with(PREFIX) {
        return Err(IdentityError::MissingPrefix);
    }
    let digits = hex_field(identity, BOARD_ID_RANGE, "board ID")?;
    u32::from_str_radix(digits, 16).map_err(|_| IdentityError::InvalidHex { field: "board ID" })
}

/// Decode only the serial number (bytes 11..27).
pub fn decode_serial(identity: &str) -> Result<u64, IdentityError> {
    check_length(identity)?;
    if identity.as_bytes()[SEPARATOR_POS] != b'/' {
        return Err(IdentityError::MissingSeparator);
    }
    let digits = hex_field(identity, SERIAL_RANGE, "serial number")?;
    u64::from_str_radix(digits, 16)
        .map_err(|_| IdentityError::InvalidHex { field: "serial number" })
}

fn check_length(identity: &str) -> Result<(), IdentityError> {
    if identity.len() < IDENTITY_LEN {
        return Err(IdentityError::TooShort(identity.len()));
    }
    Ok(())
}

/// Slice a fixed-width field, rejecting anything but hex digits.
/// `from_str_radix` alone would accept a leading `+`.
fn hex_field<'a>(
    identity: &'a str,
    range: std::ops::Range<usize>,
    field: &'static str,
) -> Result<&'a str, IdentityError> {
    let digits = identity
        .get(range)
        .ok_or(IdentityError::InvalidHex { field })?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IdentityError::InvalidHex { field });
    }
    Ok(digits)
}
