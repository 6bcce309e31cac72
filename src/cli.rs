use anyhow::Result;
pub use clap::Parser;
use clap::Subcommand;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

use cavro::protocol::{ChecksumKind, QueryKind};
use cavro::{Address, Primitive};

#[derive(Error, Debug)]
pub enum RangeError {
    #[error("invalid address range '{0}'")]
    BadRange(String),
}

/// Pump addresses given as `0,2-4`.
#[derive(Debug)]
pub struct AddressRange(Vec<Address>);

impl Deref for AddressRange {
    type Target = Vec<Address>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for AddressRange {
    type Err = RangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^(\d+)(?:-(\d+))?$").unwrap();
        }

        let mut result: Vec<Address> = Vec::new();

        for s in input.split(',') {
            let bad = || RangeError::BadRange(s.to_string());
            let c = RE.captures(s.trim()).ok_or_else(bad)?;
            let switch = |idx: usize| -> Result<u8, RangeError> {
                c.get(idx)
                    .and_then(|m| m.as_str().parse::<u8>().ok())
                    .ok_or_else(bad)
            };

            let first = switch(1)?;
            let last = if c.get(2).is_some() { switch(2)? } else { first };

            for n in cmp::min(first, last)..=cmp::max(first, last) {
                result.push(Address::new(n).ok_or_else(bad)?);
            }
        }

        Ok(AddressRange(result.into_iter().sorted().dedup().collect()))
    }
}

/// A query by name (`position`, `valve`, ...) or by its mnemonic (`?`, `?6`).
#[derive(Debug, Clone, Copy)]
pub struct QuerySpec(pub QueryKind);

impl FromStr for QuerySpec {
    type Err = RangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let kind = match input {
            "position" | "plunger" => QueryKind::PlungerPosition,
            "start-speed" => QueryKind::StartSpeed,
            "top-speed" => QueryKind::TopSpeed,
            "cutoff-speed" => QueryKind::CutoffSpeed,
            "encoder" => QueryKind::EncoderPosition,
            "valve" => QueryKind::ValvePosition,
            "buffer" => QueryKind::BufferStatus,
            "config" => QueryKind::Configuration,
            "firmware" => QueryKind::FirmwareVersion,
            other => match other.parse::<Primitive>() {
                Ok(Primitive::Query(kind)) => kind,
                _ => return Err(RangeError::BadRange(input.to_string())),
            },
        };
        Ok(QuerySpec(kind))
    }
}

fn parse_with_radix<T>(input: &str) -> Result<T, T::FromStrRadixErr>
where
    T: num::Num,
    <T as num::Num>::FromStrRadixErr: std::error::Error + Send + Sync,
{
    if input.starts_with("0x") {
        T::from_str_radix(input.trim_start_matches("0x"), 16)
    } else if input.starts_with("0b") {
        T::from_str_radix(input.trim_start_matches("0b"), 2)
    } else {
        T::from_str_radix(input, 10)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip sanity checks
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// UART device
    #[clap(long, short)]
    pub port: String,

    /// UART baud rate
    #[clap(long, short, default_value_t = 9600)]
    pub baudrate: u32,

    /// Pump addresses, e.g. 0,2-4
    #[clap(long, short, default_value = "0")]
    pub addresses: AddressRange,

    /// Number of valve ports
    #[clap(long, default_value_t = 3)]
    pub ports: u8,

    /// Full plunger stroke in steps
    #[clap(long, default_value_t = 3000, parse(try_from_str=parse_with_radix))]
    pub max_steps: u32,

    /// Response timeout in milliseconds
    #[clap(long, short, default_value_t = 100)]
    pub timeout: u64,

    /// Attempts per transaction
    #[clap(long, default_value_t = 5)]
    pub attempts: usize,

    /// Frame checksum, 'xor' or 'sum'
    #[clap(long, default_value = "xor")]
    pub checksum: ChecksumKind,

    /// Wait for the pumps to become ready after each command
    #[clap(long, short)]
    pub wait: bool,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Home plunger and valve
    Init {
        /// Initialization force: 0 full, 1 half, 2 third, 10-40 custom
        #[clap(long, default_value_t = 0)]
        strength: u8,
        /// Initialize the valve counter-clockwise
        #[clap(long)]
        ccw: bool,
        /// Valve port to end on
        #[clap(long)]
        out_port: Option<u8>,
    },

    /// Move plunger to an absolute position
    #[clap(visible_alias = "abs")]
    Move {
        #[clap(parse(try_from_str=parse_with_radix))]
        position: u32,
    },

    /// Draw the plunger down by a number of steps
    #[clap(visible_alias = "aspirate")]
    Pickup {
        #[clap(parse(try_from_str=parse_with_radix))]
        steps: u32,
        /// Switch to this port first
        #[clap(long)]
        from: Option<u8>,
    },

    /// Push the plunger up by a number of steps
    Dispense {
        #[clap(parse(try_from_str=parse_with_radix))]
        steps: u32,
        /// Switch to this port first
        #[clap(long)]
        to: Option<u8>,
    },

    /// Switch the valve
    Valve {
        port: u8,
        /// Rotate clockwise
        #[clap(long, conflicts_with = "ccw")]
        cw: bool,
        /// Rotate counter-clockwise
        #[clap(long)]
        ccw: bool,
    },

    /// Set plunger speeds
    Speed {
        /// Speed code 0-40
        code: Option<u8>,
        /// Top speed, pulses/s
        #[clap(long)]
        top: Option<u16>,
        /// Start speed, pulses/s
        #[clap(long)]
        start: Option<u16>,
        /// Cutoff speed, pulses/s
        #[clap(long)]
        cutoff: Option<u16>,
        /// Acceleration slope code 1-20
        #[clap(long)]
        slope: Option<u8>,
        /// Use microstep mode
        #[clap(long)]
        microstep: Option<bool>,
    },

    /// Show pump status
    Status,

    /// Read pump values (position, valve, firmware, ... or ?, ?6, &)
    Query {
        #[clap(required = true)]
        kinds: Vec<QuerySpec>,
    },

    /// Run raw commands as one chain, e.g. 'I1 A3000 I2 A0'
    Chain {
        #[clap(required = true)]
        steps: Vec<Primitive>,
        /// Print the encoded frame instead of sending it
        #[clap(long)]
        dry_run: bool,
    },

    /// Wait until the pumps are ready
    Wait {
        /// Give up after this many milliseconds
        #[clap(long, default_value_t = 10000)]
        limit: u64,
        /// Poll interval in milliseconds
        #[clap(long, default_value_t = 300)]
        interval: u64,
    },

    /// Stop the running command
    Terminate,
}
