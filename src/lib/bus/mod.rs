pub mod worker;

pub use worker::{BusClient, BusWorker};

use log::{debug, warn};
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{DeviceConfig, ProtocolConfig};
use crate::protocol::{
    frame, Address, CommandError, CommandFrame, DecodeError, DeviceError, Primitive, QueryKind,
    Response, Sequence, Status, ETX,
};
use crate::regs::RegisterModel;
use crate::transport::{Transport, TransportError};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("no valid response after {attempts} attempts, last: {last}")]
    Exhausted { attempts: usize, last: DecodeError },
    #[error("no pump configured at address {0}")]
    UnknownAddress(Address),
}

#[derive(Error, Debug)]
pub enum PumpError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("pump {address}: {error}")]
    Device { address: Address, error: DeviceError },
    #[error("pump {0} still busy after {1:?}")]
    WaitTimeout(Address, Duration),
    #[error("bus worker stopped")]
    Disconnected,
}

/// Result of one completed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: Status,
    pub data: String,
    /// Expected run time of the accepted chain; zero for reports.
    pub estimate: Duration,
}

impl Outcome {
    fn from_response(status: Status, response: &Response, estimate: Duration) -> Self {
        Outcome {
            status,
            data: String::from_utf8_lossy(&response.data).trim().to_string(),
            estimate,
        }
    }

    pub fn value(&self) -> Option<i64> {
        self.data.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sending,
    AwaitingResponse,
    Decoding,
    Retrying,
    Applied,
    Failed,
}

/// Why one attempt produced no usable response.
enum Failure {
    Transport(TransportError),
    Timeout,
    Decode(DecodeError),
}

struct Device {
    model: RegisterModel,
    sequence: Option<Sequence>,
    /// When the last accepted chain should be done.
    busy_until: Option<Instant>,
}

impl Device {
    fn next_sequence(&mut self) -> Sequence {
        let seq = self.sequence.map_or_else(Sequence::first, |s| s.next());
        self.sequence = Some(seq);
        seq
    }
}

/// Every pump sharing one transport, driven one transaction at a time.
pub struct Bus<T: Transport> {
    transport: T,
    protocol: ProtocolConfig,
    devices: BTreeMap<Address, Device>,
}

impl<T: Transport> Bus<T> {
    pub fn new(transport: T, protocol: ProtocolConfig) -> Self {
        Bus {
            transport,
            protocol,
            devices: BTreeMap::new(),
        }
    }

    /// Registers a pump, starting from an all-unknown model.
    pub fn add_device(&mut self, config: DeviceConfig) {
        self.devices.insert(
            config.address,
            Device {
                model: RegisterModel::new(config),
                sequence: None,
                busy_until: None,
            },
        );
    }

    pub fn with_device(mut self, config: DeviceConfig) -> Self {
        self.add_device(config);
        self
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.devices.keys().copied()
    }

    pub fn model(&self, address: Address) -> Option<&RegisterModel> {
        self.devices.get(&address).map(|d| &d.model)
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.protocol
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn device(&self, address: Address) -> Result<&Device, ExecError> {
        self.devices
            .get(&address)
            .ok_or(ExecError::UnknownAddress(address))
    }

    /// Validates `primitives` as one chain against the current model.
    pub fn build(&self, address: Address, primitives: &[Primitive]) -> Result<CommandFrame, PumpError> {
        let model = &self.device(address)?.model;
        let mut chain = model.chain();
        for &primitive in primitives {
            chain.push(primitive)?;
        }
        Ok(chain.finalize().map_err(CommandError::from)?)
    }

    /// Builds and executes one chain with the pump's configured timeout and
    /// attempt budget. Device-reported errors come back inside the outcome.
    pub fn run(&mut self, address: Address, primitives: &[Primitive]) -> Result<Outcome, PumpError> {
        let frame = self.build(address, primitives)?;
        let config = self.device(address)?.model.config();
        let (timeout, attempts) = (config.timeout, config.max_attempts);
        let (status, response) = self.transact(&frame, timeout, attempts)?;
        let estimate = if status.error.is_none() {
            frame.estimate()
        } else {
            Duration::ZERO
        };
        Ok(Outcome::from_response(status, &response, estimate))
    }

    /// Time left before the last chain sent to `address` should finish.
    pub fn settle_delay(&self, address: Address) -> Duration {
        self.devices
            .get(&address)
            .and_then(|d| d.busy_until)
            .map_or(Duration::ZERO, |until| {
                until.saturating_duration_since(Instant::now())
            })
    }

    pub fn status(&mut self, address: Address) -> Result<Status, PumpError> {
        self.run(address, &[Primitive::QueryStatus])
            .map(|outcome| outcome.status)
    }

    pub fn query(&mut self, address: Address, kind: QueryKind) -> Result<Outcome, PumpError> {
        self.run(address, &[Primitive::Query(kind)])
    }

    pub fn initialize(&mut self, address: Address) -> Result<Status, PumpError> {
        let init = Primitive::initialize(self.device(address)?.model.config());
        self.run(address, &[init]).map(|outcome| outcome.status)
    }

    /// Polls with `Q` until the pump is ready.
    ///
    /// Polling starts once the running chain's estimated time has passed,
    /// or the timeout, whichever is sooner. A device error ends the wait
    /// with `PumpError::Device`.
    pub fn wait_ready(
        &mut self,
        address: Address,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Status, PumpError> {
        let deadline = Instant::now() + timeout;
        let settle = self.settle_delay(address).min(timeout);
        if !settle.is_zero() {
            debug!("pump {}: settling for {:?}", address, settle);
            thread::sleep(settle);
        }
        loop {
            let status = self.status(address)?;
            if let Some(error) = status.error {
                return Err(PumpError::Device { address, error });
            }
            if status.is_ready() {
                return Ok(status);
            }
            if Instant::now() + interval > deadline {
                return Err(PumpError::WaitTimeout(address, timeout));
            }
            thread::sleep(interval);
        }
    }

    /// Sends `frame` until a response decodes, at most `max_attempts` times.
    ///
    /// Busy and error statuses are successful transactions.
    pub fn execute(
        &mut self,
        frame: &CommandFrame,
        timeout: Duration,
        max_attempts: usize,
    ) -> Result<Status, ExecError> {
        self.transact(frame, timeout, max_attempts)
            .map(|(status, _)| status)
    }

    fn transact(
        &mut self,
        frame: &CommandFrame,
        timeout: Duration,
        max_attempts: usize,
    ) -> Result<(Status, Response), ExecError> {
        let address = frame.address();
        let protocol = self.protocol;
        let device = self
            .devices
            .get_mut(&address)
            .ok_or(ExecError::UnknownAddress(address))?;
        let transport = &mut self.transport;

        let sequence = device.next_sequence();
        let attempts = max_attempts.max(1);
        let mut phase = Phase::Sending;
        let mut last = Failure::Timeout;

        for attempt in 1..=attempts {
            let seq = if attempt == 1 {
                sequence
            } else {
                sequence.repeated()
            };
            let bytes = frame.to_bytes(seq, protocol.checksum);

            enter(&mut phase, Phase::Sending, address);
            transport.discard_input()?;
            debug!("send {:02X?}", bytes);
            transport.write(&bytes)?;

            enter(&mut phase, Phase::AwaitingResponse, address);
            let failure = match receive(transport, &protocol, timeout, &mut phase, address) {
                Ok(response) => match device.model.apply(frame, &response) {
                    Ok(status) => {
                        enter(&mut phase, Phase::Applied, address);
                        if status.error.is_none() && !frame.estimate().is_zero() {
                            device.busy_until = Some(Instant::now() + frame.estimate());
                        }
                        return Ok((status, response));
                    }
                    Err(e) => Failure::Decode(e),
                },
                Err(Failure::Transport(e)) => {
                    enter(&mut phase, Phase::Failed, address);
                    return Err(e.into());
                }
                Err(failure) => failure,
            };

            match &failure {
                Failure::Timeout => warn!(
                    "pump {}: no response to '{}' (attempt {}/{})",
                    address, frame.command(), attempt, attempts
                ),
                Failure::Decode(e) => warn!(
                    "pump {}: bad response to '{}': {} (attempt {}/{})",
                    address, frame.command(), e, attempt, attempts
                ),
                Failure::Transport(_) => {}
            }
            last = failure;

            if attempt < attempts {
                enter(&mut phase, Phase::Retrying, address);
                thread::sleep(protocol.retry_backoff * attempt as u32);
            }
        }

        enter(&mut phase, Phase::Failed, address);
        Err(match last {
            Failure::Decode(last) => ExecError::Exhausted { attempts, last },
            Failure::Transport(e) => ExecError::Transport(e),
            Failure::Timeout => ExecError::Timeout(timeout),
        })
    }
}

fn enter(phase: &mut Phase, next: Phase, address: Address) {
    debug!("pump {}: {:?} -> {:?}", address, phase, next);
    *phase = next;
}

/// Collects one response frame, reading on while it is incomplete and time
/// remains. Once a frame is only missing its checksum, the next read returns
/// whatever arrives instead of waiting for another `ETX`.
fn receive<T: Transport>(
    transport: &mut T,
    protocol: &ProtocolConfig,
    timeout: Duration,
    phase: &mut Phase,
    address: Address,
) -> Result<Response, Failure> {
    let deadline = Instant::now() + timeout;
    let mut buffer = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let chunk = if remaining.is_zero() {
            Err(TransportError::Timeout)
        } else if frame::awaiting_checksum(&buffer) {
            transport.read(remaining)
        } else {
            transport.read_until(ETX, remaining)
        };

        match chunk {
            Ok(chunk) => buffer.extend(chunk),
            Err(TransportError::Timeout) if buffer.is_empty() => return Err(Failure::Timeout),
            Err(TransportError::Timeout) => {
                return Err(Failure::Decode(DecodeError::Incomplete(buffer.len())))
            }
            Err(e) => return Err(Failure::Transport(e)),
        }
        debug!("recv {:02X?}", buffer);

        if *phase != Phase::Decoding {
            enter(phase, Phase::Decoding, address);
        }
        match frame::decode(&buffer, protocol.checksum) {
            Ok(raw) => return Response::from_frame(raw, &protocol.status).map_err(Failure::Decode),
            Err(DecodeError::Incomplete(_)) => continue,
            Err(e) => return Err(Failure::Decode(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChecksumKind, ErrorCode, MASTER_ADDRESS};
    use crate::sim::{Fault, SimulatedBus};
    use std::collections::VecDeque;

    /// Hands out a canned reply in pieces, each after `gap`.
    struct Trickle {
        chunks: VecDeque<Vec<u8>>,
        gap: Duration,
    }

    impl Transport for Trickle {
        fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            match self.chunks.pop_front() {
                Some(chunk) if self.gap <= timeout => {
                    thread::sleep(self.gap);
                    Ok(chunk)
                }
                other => {
                    if let Some(chunk) = other {
                        self.chunks.push_front(chunk);
                    }
                    thread::sleep(timeout);
                    Err(TransportError::Timeout)
                }
            }
        }

        fn discard_input(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn pump(n: u8) -> Address {
        Address::new(n).unwrap()
    }

    fn protocol() -> ProtocolConfig {
        ProtocolConfig {
            retry_backoff: Duration::ZERO,
            ..ProtocolConfig::default()
        }
    }

    fn config(n: u8) -> DeviceConfig {
        let mut config = DeviceConfig::new(pump(n)).with_ports(1..=8);
        config.timeout = Duration::from_millis(20);
        config
    }

    fn bus(addresses: &[u8]) -> (Bus<SimulatedBus>, SimulatedBus) {
        let sim = SimulatedBus::new(protocol());
        let mut bus = Bus::new(sim.clone(), protocol());
        for &n in addresses {
            sim.add_pump(config(n));
            bus.add_device(config(n));
        }
        (bus, sim)
    }

    fn initialized(addresses: &[u8]) -> (Bus<SimulatedBus>, SimulatedBus) {
        let (mut bus, sim) = bus(addresses);
        for &n in addresses {
            bus.initialize(pump(n)).unwrap();
        }
        (bus, sim)
    }

    #[test]
    fn absolute_move_updates_model() {
        let (mut bus, sim) = initialized(&[2]);
        let outcome = bus.run(pump(2), &[Primitive::MoveAbsolute(1500)]).unwrap();

        assert!(outcome.status.is_ready());
        assert!(outcome.status.error.is_none());
        assert_eq!(bus.model(pump(2)).unwrap().plunger_position(), Some(1500));

        let frame = sim.sent().last().cloned().unwrap();
        assert_eq!(&frame[..2], &[0x02, 0x33]);
        assert_eq!(&frame[3..frame.len() - 2], b"A1500R");
        assert_eq!(frame[frame.len() - 2], 0x03);
        assert_eq!(
            frame[frame.len() - 1],
            ChecksumKind::Xor.compute(&frame[..frame.len() - 1])
        );
    }

    #[test]
    fn invalid_port_never_written() {
        let (mut bus, sim) = bus(&[0]);
        let result = bus.run(pump(0), &[Primitive::valve(9)]);
        assert!(matches!(
            result,
            Err(PumpError::Command(CommandError::InvalidPort(9)))
        ));
        assert_eq!(sim.writes(), 0);
    }

    #[test]
    fn corrupted_replies_are_retried() {
        let (mut bus, sim) = initialized(&[1]);
        let attempts = config(1).max_attempts;
        for _ in 0..attempts - 1 {
            sim.push_fault(Fault::Corrupt);
        }

        let writes = sim.writes();
        let outcome = bus.run(pump(1), &[Primitive::MoveAbsolute(700)]).unwrap();
        assert!(outcome.status.is_ready());
        assert_eq!(sim.writes() - writes, attempts);
        assert_eq!(bus.model(pump(1)).unwrap().plunger_position(), Some(700));

        // retransmissions carry the repeat flag, so the pump ran the move once
        assert_eq!(sim.executed(pump(1)), 2);
        let sent = sim.sent();
        assert_eq!(sent[sent.len() - 1][2] & 0x08, 0x08);
        assert_eq!(sent[sent.len() - attempts][2] & 0x08, 0);
    }

    #[test]
    fn corruption_exhausts_budget() {
        let (mut bus, sim) = initialized(&[1]);
        let attempts = config(1).max_attempts;
        for _ in 0..attempts {
            sim.push_fault(Fault::Corrupt);
        }

        let result = bus.run(pump(1), &[Primitive::MoveAbsolute(700)]);
        assert!(matches!(
            result,
            Err(PumpError::Exec(ExecError::Exhausted {
                last: DecodeError::ChecksumMismatch { .. },
                ..
            }))
        ));
        // never confirmed, so never applied
        assert_eq!(bus.model(pump(1)).unwrap().plunger_position(), Some(0));
    }

    #[test]
    fn silence_times_out() {
        let (mut bus, sim) = bus(&[]);
        bus.add_device(config(5));
        let result = bus.status(pump(5));
        assert!(matches!(
            result,
            Err(PumpError::Exec(ExecError::Timeout(_)))
        ));
        assert_eq!(sim.writes(), config(5).max_attempts);
    }

    #[test]
    fn dropped_reply_recovers() {
        let (mut bus, sim) = initialized(&[3]);
        sim.push_fault(Fault::Drop);
        bus.run(pump(3), &[Primitive::valve(4)]).unwrap();
        assert_eq!(bus.model(pump(3)).unwrap().valve_port(), Some(4));
        assert_eq!(sim.executed(pump(3)), 2);
    }

    #[test]
    fn split_and_stray_bytes() {
        let (mut bus, sim) = initialized(&[0]);
        sim.push_fault(Fault::Split(4));
        sim.push_fault(Fault::Stray(vec![0xFF, 0x00]));
        sim.push_fault(Fault::Late(vec![0x02, 0x30, 0x60]));

        let one = bus.query(pump(0), QueryKind::PlungerPosition).unwrap();
        assert_eq!(one.value(), Some(0));
        bus.run(pump(0), &[Primitive::MoveAbsolute(42)]).unwrap();
        bus.run(pump(0), &[Primitive::MoveAbsolute(43)]).unwrap();

        // the late fragment left behind by the third reply is flushed first
        assert_eq!(
            bus.query(pump(0), QueryKind::PlungerPosition).unwrap().value(),
            Some(43)
        );
    }

    #[test]
    fn relative_move_needs_init() {
        let (mut bus, sim) = bus(&[2]);
        assert!(matches!(
            bus.run(pump(2), &[Primitive::MoveRelative(100)]),
            Err(PumpError::Command(CommandError::PumpNotInitialized))
        ));
        assert_eq!(sim.writes(), 0);

        bus.initialize(pump(2)).unwrap();
        bus.run(pump(2), &[Primitive::MoveRelative(100)]).unwrap();
        assert_eq!(bus.model(pump(2)).unwrap().plunger_position(), Some(100));
    }

    #[test]
    fn device_error_is_a_status() {
        let (mut bus, sim) = initialized(&[0]);
        sim.inject_error(pump(0), ErrorCode::PlungerOverload);

        let outcome = bus.run(pump(0), &[Primitive::MoveAbsolute(3000)]).unwrap();
        assert_eq!(
            outcome.status.error,
            Some(DeviceError::Known(ErrorCode::PlungerOverload))
        );
        let model = bus.model(pump(0)).unwrap();
        assert!(!model.is_initialized());
        assert_eq!(model.plunger_position(), None);
        assert_eq!(model.last_status(), Some(outcome.status));
    }

    #[test]
    fn wait_ready_polls() {
        let (mut bus, sim) = initialized(&[1]);
        sim.set_busy_polls(pump(1), 3);
        let outcome = bus.run(pump(1), &[Primitive::MoveAbsolute(30)]).unwrap();
        assert!(outcome.status.is_busy());

        let status = bus
            .wait_ready(pump(1), Duration::from_secs(1), Duration::from_millis(1))
            .unwrap();
        assert!(status.is_ready());
        assert!(!bus.model(pump(1)).unwrap().is_busy());

        sim.set_busy_polls(pump(1), 1000);
        bus.run(pump(1), &[Primitive::MoveAbsolute(0)]).unwrap();
        assert!(matches!(
            bus.wait_ready(pump(1), Duration::from_millis(20), Duration::from_millis(5)),
            Err(PumpError::WaitTimeout(_, _))
        ));
    }

    #[test]
    fn wait_ready_settles_first() {
        let (mut bus, sim) = initialized(&[1]);
        sim.set_busy_polls(pump(1), 2);
        let outcome = bus.run(pump(1), &[Primitive::MoveAbsolute(10)]).unwrap();
        assert!(outcome.estimate > Duration::from_millis(10));
        assert!(bus.settle_delay(pump(1)) <= outcome.estimate);

        let started = Instant::now();
        let polls = sim.writes();
        bus.wait_ready(pump(1), Duration::from_secs(1), Duration::from_millis(1))
            .unwrap();
        assert!(started.elapsed() >= outcome.estimate - Duration::from_millis(5));
        // one busy poll, then ready
        assert_eq!(sim.writes() - polls, 2);
        assert_eq!(bus.settle_delay(pump(1)), Duration::ZERO);

        // reports and refused chains leave nothing to wait for
        assert_eq!(
            bus.query(pump(1), QueryKind::PlungerPosition).unwrap().estimate,
            Duration::ZERO
        );
        sim.inject_error(pump(1), ErrorCode::PlungerOverload);
        let refused = bus.run(pump(1), &[Primitive::MoveAbsolute(3000)]).unwrap();
        assert_eq!(refused.estimate, Duration::ZERO);
        assert_eq!(bus.settle_delay(pump(1)), Duration::ZERO);
    }

    #[test]
    fn late_checksum_byte_is_prompt() {
        let reply = frame::encode(MASTER_ADDRESS, b"`", ChecksumKind::Xor);
        let (body, checksum) = reply.split_at(reply.len() - 1);
        let trickle = Trickle {
            chunks: VecDeque::from(vec![body.to_vec(), checksum.to_vec()]),
            gap: Duration::from_millis(5),
        };

        let mut slow = config(0);
        slow.timeout = Duration::from_millis(500);
        let mut bus = Bus::new(trickle, protocol()).with_device(slow);

        let started = Instant::now();
        let status = bus.status(pump(0)).unwrap();
        assert!(status.is_ready());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn addresses_are_independent() {
        let (mut bus, _sim) = initialized(&[0, 4]);
        bus.run(pump(0), &[Primitive::MoveAbsolute(10)]).unwrap();
        bus.run(pump(4), &[Primitive::MoveAbsolute(20)]).unwrap();
        assert_eq!(bus.model(pump(0)).unwrap().plunger_position(), Some(10));
        assert_eq!(bus.model(pump(4)).unwrap().plunger_position(), Some(20));
        assert_eq!(bus.addresses().collect::<Vec<_>>(), vec![pump(0), pump(4)]);

        assert!(matches!(
            bus.status(pump(9)),
            Err(PumpError::Exec(ExecError::UnknownAddress(_)))
        ));
    }

    #[test]
    fn sum_checksum_bus() {
        let protocol = ProtocolConfig {
            checksum: ChecksumKind::Sum,
            ..protocol()
        };
        let sim = SimulatedBus::new(protocol);
        sim.add_pump(config(0));
        let mut bus = Bus::new(sim, protocol).with_device(config(0));
        bus.initialize(pump(0)).unwrap();
        assert_eq!(
            bus.query(pump(0), QueryKind::ValvePosition).unwrap().value(),
            Some(1)
        );
    }
}
