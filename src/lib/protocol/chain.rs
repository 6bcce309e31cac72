use itertools::Itertools;
use log::debug;
use std::time::Duration;
use thiserror::Error;

use super::command::{CommandError, Primitive, QueryKind, ValveDirection};
use super::frame::{self, ChecksumKind, MAX_PAYLOAD_LEN};
use super::{Address, Sequence};
use crate::config::DeviceConfig;
use crate::regs::{project, PumpState};

/// Execute command closing every action chain.
const RUN: &str = "R";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("command string of {len} bytes exceeds the {max} byte limit")]
    TooLong { len: usize, max: usize },
    #[error("'{0}' cannot share a chain with other commands")]
    IncompatibleSequencing(String),
    #[error("empty chain")]
    Empty,
    #[error("repeat loops too large to track")]
    LoopTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    StatusOnly,
    StatusAndData,
}

/// A finished chain, ready to be framed for one address.
///
/// Only [`ChainBuilder::finalize`] makes one, so the command string always
/// fits the payload cap and matches `steps`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    address: Address,
    steps: Vec<Primitive>,
    command: String,
    shape: ResponseShape,
    estimate: Duration,
}

impl CommandFrame {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn steps(&self) -> &[Primitive] {
        &self.steps
    }

    /// Command string as sent, `R` included.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn shape(&self) -> ResponseShape {
        self.shape
    }

    /// How long the pump should stay busy running this chain.
    pub fn estimate(&self) -> Duration {
        self.estimate
    }

    pub fn to_bytes(&self, seq: Sequence, checksum: ChecksumKind) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.command.len() + 1);
        payload.push(seq.to_byte());
        payload.extend_from_slice(self.command.as_bytes());
        frame::encode(self.address.to_byte(), &payload, checksum)
    }

    /// The value this frame asks the pump to report, if it is a query.
    pub fn report(&self) -> Option<QueryKind> {
        match self.steps.as_slice() {
            [Primitive::Query(kind)] => Some(*kind),
            _ => None,
        }
    }

    pub fn is_report(&self) -> bool {
        self.steps.iter().all(Primitive::is_report)
    }
}

/// Accumulates primitives for one pump, checking each against where the
/// pump will be when it runs.
#[derive(Debug, Clone)]
pub struct ChainBuilder<'a> {
    config: &'a DeviceConfig,
    base: PumpState,
    projected: PumpState,
    estimate: Duration,
    steps: Vec<Primitive>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(config: &'a DeviceConfig, state: &PumpState) -> Self {
        ChainBuilder {
            config,
            base: state.clone(),
            projected: state.clone(),
            estimate: Duration::ZERO,
            steps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Pump state once everything pushed so far has run.
    pub fn projected(&self) -> &PumpState {
        &self.projected
    }

    pub fn estimate(&self) -> Duration {
        self.estimate
    }

    pub fn max_len(&self) -> usize {
        self.config.max_command_len.min(MAX_PAYLOAD_LEN - 1)
    }

    /// Appends `primitive`. On error the chain is left as it was.
    pub fn push(&mut self, primitive: Primitive) -> Result<(), CommandError> {
        primitive.check(self.config, self.projected.microstep)?;

        if let Some(first) = self.steps.first() {
            if primitive.is_standalone() {
                return Err(ChainError::IncompatibleSequencing(primitive.to_string()).into());
            }
            if first.is_standalone() {
                return Err(ChainError::IncompatibleSequencing(first.to_string()).into());
            }
        }

        let primitive = match primitive {
            Primitive::SelectValve {
                port,
                direction: None,
            } => Primitive::SelectValve {
                port,
                direction: Some(ValveDirection::shortest(
                    self.projected.valve.unwrap_or(1),
                    port,
                )),
            },
            other => other,
        };

        let len = command_len(&self.steps, Some(&primitive));
        if len > self.max_len() {
            return Err(ChainError::TooLong {
                len,
                max: self.max_len(),
            }
            .into());
        }

        let mut steps = self.steps.clone();
        steps.push(primitive);
        let projection = project(self.config, &self.base, &steps)?;
        self.projected = projection.state;
        self.estimate = projection.duration;
        self.steps = steps;
        Ok(())
    }

    /// Serializes the accepted primitives. Calling it twice gives the same frame.
    pub fn finalize(&self) -> Result<CommandFrame, ChainError> {
        if self.steps.is_empty() {
            return Err(ChainError::Empty);
        }

        let report = self.steps.iter().all(Primitive::is_report);
        let mut command = self.steps.iter().join("");
        if !report {
            command.push_str(RUN);
        }

        let shape = match self.steps.last() {
            Some(Primitive::Query(_)) => ResponseShape::StatusAndData,
            _ => ResponseShape::StatusOnly,
        };

        debug!("chain for pump {}: {}", self.config.address, command);
        Ok(CommandFrame {
            address: self.config.address,
            steps: self.steps.clone(),
            command,
            shape,
            estimate: self.estimate,
        })
    }
}

fn command_len(steps: &[Primitive], extra: Option<&Primitive>) -> usize {
    let all: Vec<&Primitive> = steps.iter().chain(extra).collect();
    let body: usize = all.iter().map(|p| p.to_string().len()).sum();
    if all.iter().all(|p| p.is_report()) {
        body
    } else {
        body + RUN.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QueryKind;

    fn config() -> DeviceConfig {
        DeviceConfig::new(Address::new(2).unwrap()).with_ports(1..=8)
    }

    fn homed() -> PumpState {
        PumpState {
            plunger: Some(0),
            valve: Some(1),
            initialized: true,
            ..PumpState::default()
        }
    }

    #[test]
    fn absolute_move_frame() {
        let config = config();
        let mut chain = ChainBuilder::new(&config, &PumpState::default());
        chain.push(Primitive::MoveAbsolute(1500)).unwrap();
        let frame = chain.finalize().unwrap();

        assert_eq!(frame.command(), "A1500R");
        assert_eq!(frame.shape(), ResponseShape::StatusOnly);
        assert_eq!(
            frame.to_bytes(Sequence::first(), ChecksumKind::Xor),
            [0x02, 0x33, 0x31, b'A', b'1', b'5', b'0', b'0', b'R', 0x03, 0x14]
        );
    }

    #[test]
    fn reports_skip_run() {
        let config = config();
        let mut chain = ChainBuilder::new(&config, &PumpState::default());
        chain.push(Primitive::Query(QueryKind::ValvePosition)).unwrap();
        let frame = chain.finalize().unwrap();
        assert_eq!(frame.command(), "?6");
        assert_eq!(frame.shape(), ResponseShape::StatusAndData);
        assert_eq!(frame.report(), Some(QueryKind::ValvePosition));

        let mut chain = ChainBuilder::new(&config, &PumpState::default());
        chain.push(Primitive::QueryStatus).unwrap();
        let frame = chain.finalize().unwrap();
        assert_eq!(frame.command(), "Q");
        assert_eq!(frame.shape(), ResponseShape::StatusOnly);
        assert!(frame.is_report());
    }

    #[test]
    fn too_long_keeps_chain() {
        let mut config = config();
        config.max_command_len = 12;

        let accepted = [Primitive::MoveAbsolute(1500), Primitive::valve(2)];

        let mut plain = ChainBuilder::new(&config, &homed());
        for step in accepted {
            plain.push(step).unwrap();
        }

        let mut rejected = ChainBuilder::new(&config, &homed());
        for step in accepted {
            rejected.push(step).unwrap();
        }
        assert_eq!(
            rejected.push(Primitive::MoveAbsolute(3000)),
            Err(CommandError::Chain(ChainError::TooLong { len: 13, max: 12 }))
        );
        assert_eq!(rejected.len(), 2);

        let frame = rejected.finalize().unwrap();
        assert_eq!(frame.command(), "A1500I2R");
        assert_eq!(frame, plain.finalize().unwrap());
        assert_eq!(
            frame.to_bytes(Sequence::first(), ChecksumKind::Xor),
            plain
                .finalize()
                .unwrap()
                .to_bytes(Sequence::first(), ChecksumKind::Xor)
        );

        // still usable after the rejection
        rejected.push(Primitive::MoveAbsolute(30)).unwrap();
        assert_eq!(rejected.finalize().unwrap().command(), "A1500I2A30R");
    }

    #[test]
    fn payload_cap_bounds_length() {
        let mut config = config();
        config.max_command_len = 1000;
        let mut chain = ChainBuilder::new(&config, &homed());
        assert_eq!(chain.max_len(), MAX_PAYLOAD_LEN - 1);

        // "M1000" is five bytes; fifty of them and the `R` fill 251
        while chain.push(Primitive::Delay(1000)).is_ok() {}
        assert_eq!(chain.len(), 50);
        let sent = chain.finalize().unwrap();
        assert_eq!(sent.command().len(), 251);

        let bytes = sent.to_bytes(Sequence::first(), ChecksumKind::Xor);
        let raw = frame::decode(&bytes, ChecksumKind::Xor).unwrap();
        assert!(raw.payload.len() <= MAX_PAYLOAD_LEN);
        assert_eq!(&raw.payload[1..], sent.command().as_bytes());
    }

    #[test]
    fn estimate_follows_chain() {
        let config = config();
        let mut chain = ChainBuilder::new(&config, &homed());
        chain.push(Primitive::valve(2)).unwrap();
        chain.push(Primitive::Delay(300)).unwrap();
        chain.push(Primitive::MoveAbsolute(3000)).unwrap();
        let frame = chain.finalize().unwrap();
        assert_eq!(frame.estimate(), chain.estimate());
        assert!(frame.estimate() > Duration::from_millis(500 + 4000));

        let mut query = ChainBuilder::new(&config, &homed());
        query.push(Primitive::QueryStatus).unwrap();
        assert_eq!(query.finalize().unwrap().estimate(), Duration::ZERO);
    }

    #[test]
    fn standalone_commands() {
        let config = config();

        let mut chain = ChainBuilder::new(&config, &PumpState::default());
        chain.push(Primitive::initialize(&config)).unwrap();
        assert_eq!(
            chain.push(Primitive::MoveAbsolute(10)),
            Err(CommandError::Chain(ChainError::IncompatibleSequencing(
                "Z0,0,0".to_string()
            )))
        );
        assert_eq!(chain.finalize().unwrap().command(), "Z0,0,0R");

        let mut chain = ChainBuilder::new(&config, &homed());
        chain.push(Primitive::MoveAbsolute(10)).unwrap();
        assert_eq!(
            chain.push(Primitive::Terminate),
            Err(CommandError::Chain(ChainError::IncompatibleSequencing(
                "T".to_string()
            )))
        );
        assert!(matches!(
            chain.push(Primitive::Query(QueryKind::PlungerPosition)),
            Err(CommandError::Chain(ChainError::IncompatibleSequencing(_)))
        ));
        assert_eq!(chain.finalize().unwrap().command(), "A10R");
    }

    #[test]
    fn relative_moves_need_position() {
        let config = config();
        let mut chain = ChainBuilder::new(&config, &PumpState::default());
        assert_eq!(
            chain.push(Primitive::MoveRelative(100)),
            Err(CommandError::PumpNotInitialized)
        );

        // an absolute move earlier in the chain makes the position known
        chain.push(Primitive::MoveAbsolute(1000)).unwrap();
        chain.push(Primitive::MoveRelative(-400)).unwrap();
        assert_eq!(chain.projected().plunger, Some(600));
        assert!(matches!(
            chain.push(Primitive::MoveRelative(-601)),
            Err(CommandError::OutOfRange { value: -1, .. })
        ));
        assert_eq!(chain.finalize().unwrap().command(), "A1000D400R");
    }

    #[test]
    fn loops_checked_when_closed() {
        let config = config();
        let mut chain = ChainBuilder::new(&config, &homed());
        chain.push(Primitive::MarkRepeat).unwrap();
        chain.push(Primitive::MoveRelative(1000)).unwrap();
        chain.push(Primitive::Repeat(3)).unwrap();
        assert!(matches!(
            chain.push(Primitive::Repeat(4)),
            Err(CommandError::OutOfRange { .. })
        ));
        assert_eq!(chain.projected().plunger, Some(3000));
    }

    #[test]
    fn valve_direction_resolved() {
        let config = config();
        let mut chain = ChainBuilder::new(&config, &homed());
        chain.push(Primitive::valve(3)).unwrap();
        chain.push(Primitive::valve(2)).unwrap();
        chain.push(Primitive::valve(8)).unwrap();
        chain
            .push(Primitive::SelectValve {
                port: 1,
                direction: Some(ValveDirection::CounterClockwise),
            })
            .unwrap();
        assert_eq!(chain.finalize().unwrap().command(), "I3O2I8O1R");
    }

    #[test]
    fn bounds_errors_write_nothing() {
        let config = config();
        let mut chain = ChainBuilder::new(&config, &homed());
        assert_eq!(
            chain.push(Primitive::valve(9)),
            Err(CommandError::InvalidPort(9))
        );
        assert!(chain.is_empty());
        assert_eq!(chain.finalize(), Err(ChainError::Empty));
    }

    #[test]
    fn finalize_is_repeatable() {
        let config = config();
        let mut chain = ChainBuilder::new(&config, &homed());
        chain.push(Primitive::SetSpeed(11)).unwrap();
        chain.push(Primitive::MoveAbsolute(3000)).unwrap();
        assert_eq!(chain.finalize(), chain.finalize());
    }
}
