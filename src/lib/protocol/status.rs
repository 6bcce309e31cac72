use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    InitializationError = 1,
    InvalidCommand = 2,
    InvalidOperand = 3,
    InvalidSequence = 4,
    EepromFailure = 6,
    NotInitialized = 7,
    PlungerOverload = 9,
    ValveOverload = 10,
    MoveNotAllowed = 11,
    CommandOverflow = 15,
}

impl ErrorCode {
    /// Errors after which the pump accepts nothing but an initialization.
    pub fn requires_init(&self) -> bool {
        matches!(
            self,
            ErrorCode::InitializationError
                | ErrorCode::NotInitialized
                | ErrorCode::PlungerOverload
                | ErrorCode::ValveOverload
        )
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::InitializationError => "initialization error",
            ErrorCode::InvalidCommand => "invalid command",
            ErrorCode::InvalidOperand => "invalid operand",
            ErrorCode::InvalidSequence => "invalid command sequence",
            ErrorCode::EepromFailure => "EEPROM failure",
            ErrorCode::NotInitialized => "device not initialized",
            ErrorCode::PlungerOverload => "plunger overload",
            ErrorCode::ValveOverload => "valve overload",
            ErrorCode::MoveNotAllowed => "plunger move not allowed",
            ErrorCode::CommandOverflow => "command overflow",
        }
        .fmt(f)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{0}")]
    Known(ErrorCode),
    #[error("unknown device error (status {0:#04x})")]
    UnknownError(u8),
}

impl DeviceError {
    pub fn requires_init(&self) -> bool {
        match self {
            DeviceError::Known(code) => code.requires_init(),
            DeviceError::UnknownError(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub mask: u8,
    pub shift: u8,
}

impl BitField {
    pub const fn new(mask: u8, shift: u8) -> Self {
        BitField { mask, shift }
    }

    pub fn extract(&self, byte: u8) -> u8 {
        (byte & self.mask) >> self.shift
    }
}

/// Where each piece of state sits inside the status byte.
///
/// Firmware revisions differ here, so the layout is part of the protocol
/// configuration. The default matches the Cavro XP/XLP/XCalibur family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLayout {
    /// Set when the pump is ready, clear while busy.
    pub ready_mask: u8,
    pub error: BitField,
    /// Flag announcing a valid error field. Without one, a non-zero code is an error.
    pub error_flag: Option<u8>,
    /// Chain step currently executing, on firmware that reports it.
    pub step: Option<BitField>,
}

impl Default for StatusLayout {
    fn default() -> Self {
        StatusLayout {
            ready_mask: 0x20,
            error: BitField::new(0x0F, 0),
            error_flag: None,
            step: None,
        }
    }
}

impl StatusLayout {
    pub fn decode(&self, byte: u8) -> Status {
        let code = self.error.extract(byte);
        let flagged = match self.error_flag {
            Some(flag) => byte & flag != 0,
            None => code != 0,
        };

        let error = if flagged {
            Some(match ErrorCode::from_u8(code) {
                Some(code) => DeviceError::Known(code),
                None => DeviceError::UnknownError(byte),
            })
        } else {
            None
        };

        Status {
            raw: byte,
            ready: byte & self.ready_mask != 0,
            error,
            step: self.step.map(|field| field.extract(byte)),
        }
    }
}

/// Decodes a status byte laid out the default way.
pub fn decode(byte: u8) -> Status {
    StatusLayout::default().decode(byte)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub raw: u8,
    pub ready: bool,
    pub error: Option<DeviceError>,
    pub step: Option<u8>,
}

impl Status {
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_busy(&self) -> bool {
        !self.ready
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", if self.ready { "ready" } else { "busy" })?;
        if let Some(error) = &self.error {
            write!(f, ", {}", error)?;
        }
        if let Some(step) = self.step {
            write!(f, ", step {}", step)?;
        }
        Ok(())
    }
}
