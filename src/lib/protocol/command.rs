use lazy_static::lazy_static;
use regex::Regex;
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

use super::chain::ChainError;
use crate::config::DeviceConfig;

/// Top speed in pulses per second for each `S` speed code.
pub const SPEED_CODE_PULSES: [u16; 41] = [
    6000, 5600, 5000, 4400, 3800, 3200, 2600, 2200, 2000, 1800, 1600, 1400, 1200, 1000, 800, 600,
    400, 200, 190, 180, 170, 160, 150, 140, 130, 120, 110, 100, 90, 80, 70, 60, 50, 40, 30, 20, 18,
    16, 14, 12, 10,
];

pub fn top_speed_for_code(code: u8) -> Option<u16> {
    SPEED_CODE_PULSES.get(usize::from(code)).copied()
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("{what} {value} outside {min}..={max}")]
    OutOfRange {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("valve port {0} not available on this pump")]
    InvalidPort(u8),
    #[error("pump not initialized: plunger position unknown")]
    PumpNotInitialized,
    #[error("invalid command '{0}'")]
    BadMnemonic(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

fn check_range(what: &'static str, value: i64, min: i64, max: i64) -> Result<(), CommandError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CommandError::OutOfRange {
            what,
            value,
            min,
            max,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitDirection {
    /// Valve initializes clockwise, `Z`.
    Clockwise,
    /// Valve initializes counter-clockwise, `Y`.
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveDirection {
    /// Input-side rotation, `I`.
    Clockwise,
    /// Output-side rotation, `O`.
    CounterClockwise,
}

impl ValveDirection {
    /// Shorter way round a valve from `from` to `to`.
    pub fn shortest(from: u8, to: u8) -> Self {
        let delta = i16::from(to) - i16::from(from);
        let diff = if delta.abs() >= 7 { -delta } else { delta };
        if diff < 0 {
            ValveDirection::CounterClockwise
        } else {
            ValveDirection::Clockwise
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    PlungerPosition,
    StartSpeed,
    TopSpeed,
    CutoffSpeed,
    EncoderPosition,
    ValvePosition,
    BufferStatus,
    Configuration,
    FirmwareVersion,
}

impl QueryKind {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            QueryKind::PlungerPosition => "?",
            QueryKind::StartSpeed => "?1",
            QueryKind::TopSpeed => "?2",
            QueryKind::CutoffSpeed => "?3",
            QueryKind::EncoderPosition => "?4",
            QueryKind::ValvePosition => "?6",
            QueryKind::BufferStatus => "?10",
            QueryKind::Configuration => "?76",
            QueryKind::FirmwareVersion => "&",
        }
    }

    fn from_mnemonic(text: &str) -> Option<Self> {
        Some(match text {
            "?" => QueryKind::PlungerPosition,
            "?1" => QueryKind::StartSpeed,
            "?2" => QueryKind::TopSpeed,
            "?3" => QueryKind::CutoffSpeed,
            "?4" => QueryKind::EncoderPosition,
            "?6" => QueryKind::ValvePosition,
            "?10" => QueryKind::BufferStatus,
            "?76" => QueryKind::Configuration,
            "&" => QueryKind::FirmwareVersion,
            _ => return None,
        })
    }
}

/// One pump operation with its operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// Home plunger and valve. Port `0` leaves the choice to the pump.
    Initialize {
        direction: InitDirection,
        force: u8,
        in_port: u8,
        out_port: u8,
    },
    MoveAbsolute(u32),
    /// Positive aspirates (`P`), negative dispenses (`D`).
    MoveRelative(i32),
    /// Without a direction the chain builder picks the shorter rotation.
    SelectValve {
        port: u8,
        direction: Option<ValveDirection>,
    },
    SetSpeed(u8),
    SetTopSpeed(u16),
    SetStartSpeed(u16),
    SetCutoffSpeed(u16),
    SetSlope(u8),
    Delay(u16),
    /// Wait for an `R` or a low TTL input: 0 either, 1 or 2 that pin.
    Halt(u8),
    MarkRepeat,
    Repeat(u16),
    SetMicrostep(bool),
    Terminate,
    QueryStatus,
    Query(QueryKind),
}

impl Primitive {
    pub fn initialize(config: &DeviceConfig) -> Self {
        Primitive::Initialize {
            direction: config.init_direction,
            force: config.init_force,
            in_port: 0,
            out_port: config.init_out_port.unwrap_or(0),
        }
    }

    pub fn valve(port: u8) -> Self {
        Primitive::SelectValve {
            port,
            direction: None,
        }
    }

    /// Report commands answer with data and run without `R`.
    pub fn is_report(&self) -> bool {
        matches!(self, Primitive::QueryStatus | Primitive::Query(_))
    }

    /// Commands the pump only accepts on their own.
    pub fn is_standalone(&self) -> bool {
        self.is_report()
            || matches!(
                self,
                Primitive::Initialize { .. } | Primitive::SetMicrostep(_) | Primitive::Terminate
            )
    }

    /// Operand checks that need nothing but the pump configuration.
    ///
    /// Relative moves are bounded by the chain builder, which knows where the
    /// plunger will be when the move runs.
    pub fn check(&self, config: &DeviceConfig, microstep: bool) -> Result<(), CommandError> {
        let check_port = |port: u8| {
            if config.valve_ports.contains(&port) {
                Ok(())
            } else {
                Err(CommandError::InvalidPort(port))
            }
        };

        match *self {
            Primitive::Initialize {
                force,
                in_port,
                out_port,
                ..
            } => {
                if !(force <= 2 || (10..=40).contains(&force)) {
                    return Err(CommandError::OutOfRange {
                        what: "initialization force",
                        value: i64::from(force),
                        min: 0,
                        max: 40,
                    });
                }
                for port in [in_port, out_port] {
                    if port != 0 {
                        check_port(port)?;
                    }
                }
                Ok(())
            }
            Primitive::MoveAbsolute(steps) => check_range(
                "plunger position",
                i64::from(steps),
                0,
                i64::from(config.stroke(microstep)),
            ),
            Primitive::SelectValve { port, .. } => check_port(port),
            Primitive::SetSpeed(code) => check_range("speed code", i64::from(code), 0, 40),
            Primitive::SetTopSpeed(pps) => check_range("top speed", i64::from(pps), 5, 6000),
            Primitive::SetStartSpeed(pps) => check_range("start speed", i64::from(pps), 50, 1000),
            Primitive::SetCutoffSpeed(pps) => {
                check_range("cutoff speed", i64::from(pps), 50, 2700)
            }
            Primitive::SetSlope(slope) => check_range("slope code", i64::from(slope), 1, 20),
            Primitive::Delay(ms) => check_range("delay", i64::from(ms), 1, 29999),
            Primitive::Halt(input) => check_range("halt input", i64::from(input), 0, 2),
            Primitive::Repeat(count) => check_range("repeat count", i64::from(count), 1, 29999),
            Primitive::MoveRelative(_)
            | Primitive::MarkRepeat
            | Primitive::SetMicrostep(_)
            | Primitive::Terminate
            | Primitive::QueryStatus
            | Primitive::Query(_) => Ok(()),
        }
    }
}

impl Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Primitive::Initialize {
                direction,
                force,
                in_port,
                out_port,
            } => {
                let cmd = match direction {
                    InitDirection::Clockwise => 'Z',
                    InitDirection::CounterClockwise => 'Y',
                };
                write!(f, "{}{},{},{}", cmd, force, in_port, out_port)
            }
            Primitive::MoveAbsolute(steps) => write!(f, "A{}", steps),
            Primitive::MoveRelative(delta) if *delta < 0 => write!(f, "D{}", delta.unsigned_abs()),
            Primitive::MoveRelative(delta) => write!(f, "P{}", delta),
            Primitive::SelectValve { port, direction } => match direction {
                Some(ValveDirection::CounterClockwise) => write!(f, "O{}", port),
                _ => write!(f, "I{}", port),
            },
            Primitive::SetSpeed(code) => write!(f, "S{}", code),
            Primitive::SetTopSpeed(pps) => write!(f, "V{}", pps),
            Primitive::SetStartSpeed(pps) => write!(f, "v{}", pps),
            Primitive::SetCutoffSpeed(pps) => write!(f, "c{}", pps),
            Primitive::SetSlope(slope) => write!(f, "L{}", slope),
            Primitive::Delay(ms) => write!(f, "M{}", ms),
            Primitive::Halt(input) => write!(f, "H{}", input),
            Primitive::MarkRepeat => "g".fmt(f),
            Primitive::Repeat(count) => write!(f, "G{}", count),
            Primitive::SetMicrostep(on) => write!(f, "N{}", u8::from(*on)),
            Primitive::Terminate => "T".fmt(f),
            Primitive::QueryStatus => "Q".fmt(f),
            Primitive::Query(kind) => kind.mnemonic().fmt(f),
        }
    }
}

impl FromStr for Primitive {
    type Err = CommandError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^([ZYAPDIOSVvcLMHgGNTQ])(\d+)?(?:,(\d+),(\d+))?$").unwrap();
        }

        let bad = || CommandError::BadMnemonic(input.to_string());

        if let Some(kind) = QueryKind::from_mnemonic(input) {
            return Ok(Primitive::Query(kind));
        }

        let c = RE.captures(input).ok_or_else(bad)?;
        let cmd = c.get(1).map(|m| m.as_str()).ok_or_else(bad)?;
        let operand = |idx: usize| -> Option<Result<u32, CommandError>> {
            c.get(idx).map(|m| m.as_str().parse::<u32>().map_err(|_| bad()))
        };
        let number = || -> Result<u32, CommandError> { operand(2).ok_or_else(bad)? };
        let narrow = |value: u32| u16::try_from(value).map_err(|_| bad());
        let tiny = |value: u32| u8::try_from(value).map_err(|_| bad());

        if c.get(3).is_some() && !matches!(cmd, "Z" | "Y") {
            return Err(bad());
        }

        let primitive = match cmd {
            "Z" | "Y" => Primitive::Initialize {
                direction: if cmd == "Z" {
                    InitDirection::Clockwise
                } else {
                    InitDirection::CounterClockwise
                },
                force: tiny(operand(2).unwrap_or(Ok(0))?)?,
                in_port: tiny(operand(3).unwrap_or(Ok(0))?)?,
                out_port: tiny(operand(4).unwrap_or(Ok(0))?)?,
            },
            "A" => Primitive::MoveAbsolute(number()?),
            "P" => Primitive::MoveRelative(i32::try_from(number()?).map_err(|_| bad())?),
            "D" => Primitive::MoveRelative(-i32::try_from(number()?).map_err(|_| bad())?),
            "I" | "O" => Primitive::SelectValve {
                port: tiny(number()?)?,
                direction: Some(if cmd == "I" {
                    ValveDirection::Clockwise
                } else {
                    ValveDirection::CounterClockwise
                }),
            },
            "S" => Primitive::SetSpeed(tiny(number()?)?),
            "V" => Primitive::SetTopSpeed(narrow(number()?)?),
            "v" => Primitive::SetStartSpeed(narrow(number()?)?),
            "c" => Primitive::SetCutoffSpeed(narrow(number()?)?),
            "L" => Primitive::SetSlope(tiny(number()?)?),
            "M" => Primitive::Delay(narrow(number()?)?),
            "H" => Primitive::Halt(tiny(operand(2).unwrap_or(Ok(0))?)?),
            "G" => Primitive::Repeat(narrow(number()?)?),
            "N" => match number()? {
                0 => Primitive::SetMicrostep(false),
                1 => Primitive::SetMicrostep(true),
                _ => return Err(bad()),
            },
            "g" | "T" | "Q" if c.get(2).is_some() => return Err(bad()),
            "g" => Primitive::MarkRepeat,
            "T" => Primitive::Terminate,
            "Q" => Primitive::QueryStatus,
            _ => return Err(bad()),
        };

        Ok(primitive)
    }
}
