use itertools::Itertools;
use std::str::FromStr;
use thiserror::Error;

use super::status::{Status, StatusLayout};
use super::{ETX, MASTER_ADDRESS, STX};

/// Longest payload (sequence byte plus command string) a frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Bytes scanned for a complete frame before the input is declared garbage.
pub const SCAN_WINDOW: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// XOR of every byte from STX through ETX.
    Xor,
    /// Sum of every byte from STX through ETX, modulo 256.
    Sum,
}

impl Default for ChecksumKind {
    fn default() -> Self {
        ChecksumKind::Xor
    }
}

impl ChecksumKind {
    pub fn compute(&self, bytes: &[u8]) -> u8 {
        match self {
            ChecksumKind::Xor => bytes.iter().fold(0u8, |acc, b| acc ^ b),
            ChecksumKind::Sum => bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChecksumKindError {
    #[error("invalid checksum kind '{0}'")]
    BadKind(String),
}

impl FromStr for ChecksumKind {
    type Err = ChecksumKindError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "xor" => Ok(ChecksumKind::Xor),
            "sum" => Ok(ChecksumKind::Sum),
            _ => Err(ChecksumKindError::BadKind(input.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("incomplete frame ({0} bytes buffered)")]
    Incomplete(usize),
    #[error("checksum mismatch: computed {expected:#04x}, received {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("response from unexpected address {0:#04x}")]
    UnexpectedAddress(u8),
    #[error("unparseable report data {0:?}")]
    BadData(String),
}

/// A delimited frame with markers and checksum stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub address: u8,
    pub payload: Vec<u8>,
}

pub fn encode(address: u8, payload: &[u8], checksum: ChecksumKind) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);

    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(STX);
    frame.push(address);
    frame.extend_from_slice(payload);
    frame.push(ETX);
    frame.push(checksum.compute(&frame));
    frame
}

/// Finds and validates the first frame in `raw`.
///
/// Bytes ahead of the start marker are skipped. A candidate that fails its
/// checksum or is too short is dropped and the scan resumes at the next
/// `STX`, so a stray start byte in leading junk does not hide the frame
/// behind it. `Incomplete` means more input may still complete the frame;
/// every other error is final for this buffer.
pub fn decode(raw: &[u8], checksum: ChecksumKind) -> Result<RawFrame, DecodeError> {
    let mut first_error = None;

    for start in raw.iter().positions(|&b| b == STX) {
        match decode_at(&raw[start..], raw.len(), checksum) {
            Ok(frame) => return Ok(frame),
            // later candidates end at the same missing byte
            Err(e @ DecodeError::Incomplete(_)) => return Err(e),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None if raw.len() > SCAN_WINDOW => Err(DecodeError::Malformed("no start marker")),
        None => Err(DecodeError::Incomplete(raw.len())),
    }
}

/// True when `raw` holds a whole frame except for its checksum byte.
pub fn awaiting_checksum(raw: &[u8]) -> bool {
    raw.last() == Some(&ETX) && raw.contains(&STX)
}

/// Validates the frame starting at `frame[0]`, an `STX`.
fn decode_at(frame: &[u8], buffered: usize, checksum: ChecksumKind) -> Result<RawFrame, DecodeError> {
    let stop = match frame.iter().position(|&b| b == ETX) {
        Some(stop) => stop,
        None if frame.len() > SCAN_WINDOW => return Err(DecodeError::Malformed("no terminator")),
        None => return Err(DecodeError::Incomplete(buffered)),
    };

    if stop < 2 {
        return Err(DecodeError::Malformed("frame too short"));
    }

    if frame.len() < stop + 2 {
        return Err(DecodeError::Incomplete(buffered));
    }

    let expected = checksum.compute(&frame[..=stop]);
    let actual = frame[stop + 1];
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }

    Ok(RawFrame {
        address: frame[1],
        payload: frame[2..stop].to_vec(),
    })
}

/// A validated answer from a pump.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub data: Vec<u8>,
}

impl Response {
    pub fn from_frame(frame: RawFrame, layout: &StatusLayout) -> Result<Self, DecodeError> {
        if frame.address != MASTER_ADDRESS {
            return Err(DecodeError::UnexpectedAddress(frame.address));
        }

        let (&status, data) = frame
            .payload
            .split_first()
            .ok_or(DecodeError::Malformed("missing status byte"))?;

        Ok(Response {
            status: layout.decode(status),
            data: data.to_vec(),
        })
    }

    pub fn data_str(&self) -> Result<&str, DecodeError> {
        std::str::from_utf8(&self.data)
            .map(str::trim)
            .map_err(|_| DecodeError::BadData(String::from_utf8_lossy(&self.data).into_owned()))
    }

    pub fn data_int(&self) -> Result<i64, DecodeError> {
        let text = self.data_str()?;
        text.parse()
            .map_err(|_| DecodeError::BadData(text.to_string()))
    }
}
