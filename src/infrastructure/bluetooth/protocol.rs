//! OBD-II over BLE Protocol
//!
//! This module contains the wire format used to talk to an ELM327-style
//! OBD-II dongle: commands go out as raw bytes, responses come back as
//! ASCII-hex text frames.

use crate::domain::error::{ConfigError, DecodeError, EncodeError};
use tracing::trace;
use uuid::Uuid;

/// Advertised local name of the dongle
pub const DEFAULT_TARGET_NAME: &str = "OBDBLE";

/// OBD-II data service UUID
pub const SERVICE_UUID: &str = "DDEAF648-037B-46F4-9706-72DF00D8C8C3";

/// Notify/write characteristic UUID (16-bit form)
pub const DATA_CHAR_UUID: &str = "FFF1";

/// Mode 01, PID 0D: vehicle speed
pub const SPEED_COMMAND: &str = "010D";

/// One-byte payload written once after subscribing
pub const ENABLE_PAYLOAD: &str = "01";

/// Default poll interval in milliseconds
pub const POLL_INTERVAL_MS: u64 = 1000;

/// Carriage return closing each ELM327 response line
pub const FRAME_TERMINATOR: u8 = b'\r';

/// Bluetooth SIG base UUID, used to expand 16/32-bit short forms
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Layout of a response frame for the active command
///
/// # Speed Response (7 bytes)
///
/// ```text
/// [0-1] : '4' '1'   mode 01 response
/// [2-3] : '0' 'D'   PID echo
/// [4-5] : 'H' 'L'   value, one ASCII hex digit per nibble
/// [6]   : '\r'      terminator
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFormat {
    /// Exact frame length including the terminator
    pub frame_len: usize,
    /// Bytes between the value nibbles and the end of the body
    pub value_offset: usize,
    /// Trailing byte excluded from the body when present
    pub terminator: Option<u8>,
}

impl Default for ResponseFormat {
    fn default() -> Self {
        Self {
            frame_len: 7,
            value_offset: 0,
            terminator: Some(FRAME_TERMINATOR),
        }
    }
}

impl ResponseFormat {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_len < self.value_offset + 2 {
            return Err(ConfigError::ResponseFormat {
                frame_len: self.frame_len,
                value_offset: self.value_offset,
            });
        }
        Ok(())
    }
}

/// Encode a textual command into wire bytes
///
/// Whitespace separates tokens; each token is read as pairs of hex digits.
/// Encoding stops at the first pair that is not two hex digits.
pub fn encode(command: &str) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();

    'tokens: for token in command.split_ascii_whitespace() {
        for pair in token.as_bytes().chunks(2) {
            match pair {
                [hi, lo] => match (hex_nibble(*hi), hex_nibble(*lo)) {
                    (Some(hi), Some(lo)) => bytes.push(hi << 4 | lo),
                    _ => break 'tokens,
                },
                _ => break 'tokens,
            }
        }
    }

    if bytes.is_empty() {
        return Err(EncodeError::EmptyOrInvalid(command.to_string()));
    }
    Ok(bytes)
}

/// Decode a response frame into its 8-bit value
pub fn decode(frame: &[u8], format: &ResponseFormat) -> Result<u8, DecodeError> {
    if frame.len() != format.frame_len {
        return Err(DecodeError::UnexpectedLength {
            expected: format.frame_len,
            actual: frame.len(),
        });
    }

    let body = match (format.terminator, frame.split_last()) {
        (Some(term), Some((last, rest))) if *last == term => rest,
        _ => frame,
    };

    let end = body
        .len()
        .checked_sub(format.value_offset)
        .filter(|end| *end >= 2)
        .ok_or(DecodeError::UnexpectedLength {
            expected: format.frame_len,
            actual: frame.len(),
        })?;
    let nibbles = [body[end - 2], body[end - 1]];

    #[cfg(debug_assertions)]
    trace!("Raw frame: {:02X?}", frame);

    match (hex_nibble(nibbles[0]), hex_nibble(nibbles[1])) {
        (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
        _ => Err(DecodeError::NonHexPayload(nibbles)),
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

/// Parse a service or characteristic UUID
///
/// Accepts the 16-bit (`FFF1`), 32-bit, and full 128-bit forms; short
/// forms are expanded against the Bluetooth base UUID.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, ConfigError> {
    let invalid = || ConfigError::InvalidUuid(uuid_str.to_string());
    let trimmed = uuid_str.trim();
    let hex = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    match hex.len() {
        4 | 8 => {
            let short = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
            Ok(Uuid::from_u128(BASE_UUID | (u128::from(short) << 96)))
        }
        _ => Uuid::parse_str(hex).map_err(|_| invalid()),
    }
}
