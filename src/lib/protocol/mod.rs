pub mod chain;
pub mod command;
pub mod frame;
pub mod status;

use std::{fmt::Display, str::FromStr};
use thiserror::Error;

pub use chain::{ChainBuilder, ChainError, CommandFrame, ResponseShape};
pub use command::{CommandError, InitDirection, Primitive, QueryKind, ValveDirection};
pub use frame::{ChecksumKind, DecodeError, RawFrame, Response};
pub use status::{DeviceError, ErrorCode, Status, StatusLayout};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Address byte the pumps use when answering the bus master.
pub const MASTER_ADDRESS: u8 = 0x30;

const DEVICE_ADDRESS_BASE: u8 = 0x31;
const MAX_DEVICE_ADDRESS: u8 = 15;

/// Position of a pump on the daisy chain, as set by its address switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u8);

impl Address {
    pub fn new(switch: u8) -> Option<Self> {
        if switch <= MAX_DEVICE_ADDRESS {
            Some(Address(switch))
        } else {
            None
        }
    }

    pub fn switch(&self) -> u8 {
        self.0
    }

    pub fn to_byte(&self) -> u8 {
        DEVICE_ADDRESS_BASE + self.0
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        byte.checked_sub(DEVICE_ADDRESS_BASE).and_then(Address::new)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    #[error("invalid pump address '{0}'")]
    BadAddress(String),
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        input
            .parse::<u8>()
            .ok()
            .and_then(Address::new)
            .ok_or_else(|| AddressError::BadAddress(input.to_string()))
    }
}

/// Sequence byte carried by every command frame.
///
/// The counter cycles through `1..=7`; a retransmission keeps the number and
/// sets the repeat flag so the pump can discard a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequence {
    number: u8,
    repeat: bool,
}

impl Sequence {
    const BASE: u8 = 0x30;
    const REPEAT_FLAG: u8 = 0x08;

    pub fn first() -> Self {
        Sequence {
            number: 1,
            repeat: false,
        }
    }

    pub fn next(&self) -> Self {
        Sequence {
            number: if self.number >= 7 { 1 } else { self.number + 1 },
            repeat: false,
        }
    }

    pub fn repeated(&self) -> Self {
        Sequence {
            number: self.number,
            repeat: true,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn is_repeat(&self) -> bool {
        self.repeat
    }

    pub fn to_byte(&self) -> u8 {
        let flag = if self.repeat { Self::REPEAT_FLAG } else { 0 };
        Self::BASE | flag | self.number
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0xF0 != Self::BASE {
            return None;
        }
        let number = byte & 0x07;
        if number == 0 {
            return None;
        }
        Some(Sequence {
            number,
            repeat: byte & Self::REPEAT_FLAG != 0,
        })
    }
}
