//! Simulated pumps on a shared line, for exercising the driver without
//! hardware.
//!
//! Replies use the default status layout. Faults are queued bus-wide and
//! each one is applied to the next reply any pump sends.

use log::debug;
use num_traits::ToPrimitive;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::{DeviceConfig, ProtocolConfig};
use crate::protocol::{frame, Address, ErrorCode, Primitive, QueryKind, Sequence, MASTER_ADDRESS};
use crate::regs::{project, PumpState};
use crate::transport::{Transport, TransportError};

const STATUS_BASE: u8 = 0x40;
const STATUS_READY: u8 = 0x20;
const FIRMWARE: &str = "XP3000 SIM 1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Flip a bit of the status byte.
    Corrupt,
    /// Lose the reply entirely.
    Drop,
    /// Deliver the reply in two reads, split after this many bytes.
    Split(usize),
    /// Junk arriving just ahead of the reply.
    Stray(Vec<u8>),
    /// Junk arriving after the reply, left for the next transaction.
    Late(Vec<u8>),
}

#[derive(Debug)]
struct SimPump {
    config: DeviceConfig,
    state: PumpState,
    busy_polls: usize,
    busy_left: usize,
    last_error: Option<ErrorCode>,
    injected: Option<ErrorCode>,
    last_reply: Option<(u8, Vec<u8>)>,
    executed: usize,
}

impl SimPump {
    fn new(config: DeviceConfig) -> Self {
        SimPump {
            config,
            state: PumpState {
                plunger: Some(0),
                valve: Some(1),
                speed_code: Some(11),
                top_speed: Some(1400),
                start_speed: Some(900),
                cutoff_speed: Some(900),
                slope: Some(14),
                microstep: false,
                initialized: false,
            },
            busy_polls: 0,
            busy_left: 0,
            last_error: None,
            injected: None,
            last_reply: None,
            executed: 0,
        }
    }

    fn status(&self, error: Option<ErrorCode>) -> u8 {
        let ready = if self.busy_left == 0 { STATUS_READY } else { 0 };
        let code = error.and_then(|e| e.to_u8()).unwrap_or(0);
        STATUS_BASE | ready | code
    }

    fn fail(&mut self, code: ErrorCode) -> (u8, String) {
        if code.requires_init() {
            self.state.initialized = false;
        }
        self.last_error = Some(code);
        (self.status(Some(code)), String::new())
    }

    fn report(&self, kind: QueryKind) -> String {
        let state = &self.state;
        match kind {
            QueryKind::PlungerPosition | QueryKind::EncoderPosition => {
                state.plunger.unwrap_or(0).to_string()
            }
            QueryKind::StartSpeed => state.start_speed.unwrap_or(0).to_string(),
            QueryKind::TopSpeed => state.top_speed.unwrap_or(0).to_string(),
            QueryKind::CutoffSpeed => state.cutoff_speed.unwrap_or(0).to_string(),
            QueryKind::ValvePosition => state.valve.unwrap_or(1).to_string(),
            QueryKind::BufferStatus => "0".to_string(),
            QueryKind::Configuration => format!(
                "{} steps, {} ports",
                self.config.max_steps,
                self.config.valve_port_count()
            ),
            QueryKind::FirmwareVersion => FIRMWARE.to_string(),
        }
    }

    /// Runs one command string, returning the status byte and reply data.
    fn handle(&mut self, command: &str) -> (u8, String) {
        self.executed += 1;

        let (body, run) = match command.strip_suffix('R') {
            Some(body) => (body, true),
            None => (command, false),
        };
        let steps = match tokenize(body)
            .into_iter()
            .map(str::parse::<Primitive>)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(steps) if !steps.is_empty() => steps,
            _ => return (self.status(Some(ErrorCode::InvalidCommand)), String::new()),
        };

        match steps.as_slice() {
            [Primitive::QueryStatus] => {
                self.busy_left = self.busy_left.saturating_sub(1);
                return (self.status(self.last_error), String::new());
            }
            [Primitive::Query(kind)] => return (self.status(self.last_error), self.report(*kind)),
            _ => {}
        }

        if !run {
            // buffered until an R arrives
            return (self.status(None), String::new());
        }

        if let Some(code) = self.injected.take() {
            return self.fail(code);
        }
        if self.busy_left > 0 {
            return (self.status(Some(ErrorCode::CommandOverflow)), String::new());
        }
        if steps.len() > 1 && steps.iter().any(Primitive::is_standalone) {
            return self.fail(ErrorCode::InvalidSequence);
        }
        if steps
            .iter()
            .any(|step| step.check(&self.config, self.state.microstep).is_err())
        {
            return self.fail(ErrorCode::InvalidOperand);
        }

        let moves = steps.iter().any(|step| {
            matches!(
                step,
                Primitive::Initialize { .. }
                    | Primitive::MoveAbsolute(_)
                    | Primitive::MoveRelative(_)
                    | Primitive::SelectValve { .. }
            )
        });
        let homing = matches!(steps[0], Primitive::Initialize { .. });
        if moves && !homing && !self.state.initialized {
            return self.fail(ErrorCode::NotInitialized);
        }

        if steps[0] != Primitive::Terminate {
            match project(&self.config, &self.state, &steps) {
                Ok(projection) => {
                    let mut next = projection.state;
                    next.valve = next.valve.or(Some(1));
                    self.state = next;
                }
                Err(_) => return self.fail(ErrorCode::InvalidOperand),
            }
        }

        self.last_error = None;
        self.busy_left = if moves { self.busy_polls } else { 0 };
        (self.status(None), String::new())
    }
}

/// Splits a command string at each mnemonic letter.
fn tokenize(body: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    for (idx, c) in body.char_indices() {
        if idx > start && (c.is_ascii_alphabetic() || c == '?' || c == '&') {
            tokens.push(&body[start..idx]);
            start = idx;
        }
    }
    if start < body.len() {
        tokens.push(&body[start..]);
    }
    tokens
}

#[derive(Debug, Default)]
struct Line {
    protocol: ProtocolConfig,
    pumps: BTreeMap<Address, SimPump>,
    faults: VecDeque<Fault>,
    incoming: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    writes: usize,
    discards: usize,
}

impl Line {
    fn respond(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        let raw = frame::decode(bytes, self.protocol.checksum).ok()?;
        let address = Address::from_byte(raw.address)?;
        let pump = self.pumps.get_mut(&address)?;
        let (&seq_byte, command) = raw.payload.split_first()?;
        let seq = Sequence::from_byte(seq_byte);

        let duplicate = match (&pump.last_reply, seq) {
            (Some((number, reply)), Some(seq)) if seq.is_repeat() && seq.number() == *number => {
                Some(reply.clone())
            }
            _ => None,
        };

        let payload = match duplicate {
            Some(reply) => {
                debug!("sim pump {}: duplicate frame, resending reply", address);
                reply
            }
            None => {
                let (status, data) = pump.handle(&String::from_utf8_lossy(command));
                let mut reply = vec![status];
                reply.extend(data.bytes());
                pump.last_reply = seq.map(|s| (s.number(), reply.clone()));
                reply
            }
        };

        Some(frame::encode(MASTER_ADDRESS, &payload, self.protocol.checksum))
    }

    fn deliver(&mut self, mut reply: Vec<u8>) {
        match self.faults.pop_front() {
            None => self.incoming.push_back(reply),
            Some(Fault::Corrupt) => {
                reply[2] ^= 0x01;
                self.incoming.push_back(reply);
            }
            Some(Fault::Drop) => {}
            Some(Fault::Split(at)) => {
                let tail = reply.split_off(at.min(reply.len()));
                self.incoming.push_back(reply);
                if !tail.is_empty() {
                    self.incoming.push_back(tail);
                }
            }
            Some(Fault::Stray(mut junk)) => {
                junk.extend(reply);
                self.incoming.push_back(junk);
            }
            Some(Fault::Late(junk)) => {
                self.incoming.push_back(reply);
                self.incoming.push_back(junk);
            }
        }
    }
}

/// Handle to a simulated line. Clones share the same pumps.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    line: Arc<Mutex<Line>>,
}

impl SimulatedBus {
    pub fn new(protocol: ProtocolConfig) -> Self {
        SimulatedBus {
            line: Arc::new(Mutex::new(Line {
                protocol,
                ..Line::default()
            })),
        }
    }

    fn line(&self) -> MutexGuard<'_, Line> {
        self.line.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_pump(&self, config: DeviceConfig) {
        self.line().pumps.insert(config.address, SimPump::new(config));
    }

    pub fn push_fault(&self, fault: Fault) {
        self.line().faults.push_back(fault);
    }

    /// Status polls a pump answers busy after each move.
    pub fn set_busy_polls(&self, address: Address, polls: usize) {
        if let Some(pump) = self.line().pumps.get_mut(&address) {
            pump.busy_polls = polls;
        }
    }

    /// Makes the pump reject its next action command with `code`.
    pub fn inject_error(&self, address: Address, code: ErrorCode) {
        if let Some(pump) = self.line().pumps.get_mut(&address) {
            pump.injected = Some(code);
        }
    }

    pub fn writes(&self) -> usize {
        self.line().writes
    }

    pub fn discards(&self) -> usize {
        self.line().discards
    }

    /// Every frame written so far, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.line().sent.clone()
    }

    /// Command strings a pump has acted on, duplicates excluded.
    pub fn executed(&self, address: Address) -> usize {
        self.line().pumps.get(&address).map_or(0, |p| p.executed)
    }

    pub fn pump_state(&self, address: Address) -> Option<PumpState> {
        self.line().pumps.get(&address).map(|p| p.state.clone())
    }
}

impl Transport for SimulatedBus {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut line = self.line();
        line.writes += 1;
        line.sent.push(bytes.to_vec());
        if let Some(reply) = line.respond(bytes) {
            line.deliver(reply);
        }
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.line()
            .incoming
            .pop_front()
            .ok_or(TransportError::Timeout)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        let mut line = self.line();
        if !line.incoming.is_empty() {
            line.discards += 1;
            line.incoming.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{status, ChecksumKind, DeviceError, Response};

    fn pump() -> Address {
        Address::new(0).unwrap()
    }

    fn sim() -> SimulatedBus {
        let sim = SimulatedBus::new(ProtocolConfig::default());
        sim.add_pump(DeviceConfig::new(pump()).with_ports(1..=6));
        sim
    }

    fn send(sim: &mut SimulatedBus, seq: u8, command: &str) -> Response {
        let mut payload = vec![seq];
        payload.extend(command.bytes());
        sim.write(&frame::encode(pump().to_byte(), &payload, ChecksumKind::Xor))
            .unwrap();
        let raw = sim.read(Duration::ZERO).unwrap();
        let raw = frame::decode(&raw, ChecksumKind::Xor).unwrap();
        Response::from_frame(raw, &Default::default()).unwrap()
    }

    fn error(response: &Response) -> Option<DeviceError> {
        response.status.error
    }

    #[test]
    fn tokenizes_chains() {
        assert_eq!(tokenize("Z0,0,0"), ["Z0,0,0"]);
        assert_eq!(tokenize("gA3000M500A0G10"), ["g", "A3000", "M500", "A0", "G10"]);
        assert_eq!(tokenize("?10"), ["?10"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn requires_initialization() {
        let mut sim = sim();
        let reply = send(&mut sim, 0x31, "A100R");
        assert_eq!(
            error(&reply),
            Some(DeviceError::Known(ErrorCode::NotInitialized))
        );

        assert_eq!(error(&send(&mut sim, 0x32, "Z0,0,0R")), None);
        assert_eq!(error(&send(&mut sim, 0x33, "A100R")), None);
        assert_eq!(sim.pump_state(pump()).unwrap().plunger, Some(100));
        assert_eq!(send(&mut sim, 0x34, "?").data_str().unwrap(), "100");
    }

    #[test]
    fn rejects_bad_commands() {
        let mut sim = sim();
        send(&mut sim, 0x31, "Z0,0,0R");

        assert_eq!(
            error(&send(&mut sim, 0x32, "X5R")),
            Some(DeviceError::Known(ErrorCode::InvalidCommand))
        );
        assert_eq!(
            error(&send(&mut sim, 0x33, "A9000R")),
            Some(DeviceError::Known(ErrorCode::InvalidOperand))
        );
        assert_eq!(
            error(&send(&mut sim, 0x34, "I7R")),
            Some(DeviceError::Known(ErrorCode::InvalidOperand))
        );
        assert_eq!(
            error(&send(&mut sim, 0x35, "A10Z0,0,0R")),
            Some(DeviceError::Known(ErrorCode::InvalidSequence))
        );
        assert_eq!(sim.pump_state(pump()).unwrap().plunger, Some(0));
    }

    #[test]
    fn repeated_frames_run_once() {
        let mut sim = sim();
        send(&mut sim, 0x31, "Z0,0,0R");
        send(&mut sim, 0x32, "P100R");
        send(&mut sim, 0x3A, "P100R");
        assert_eq!(sim.pump_state(pump()).unwrap().plunger, Some(100));
        assert_eq!(sim.executed(pump()), 2);

        // a fresh sequence number runs again
        send(&mut sim, 0x33, "P100R");
        assert_eq!(sim.pump_state(pump()).unwrap().plunger, Some(200));
    }

    #[test]
    fn busy_pump_refuses_moves() {
        let mut sim = sim();
        sim.set_busy_polls(pump(), 2);
        let reply = send(&mut sim, 0x31, "Z0,0,0R");
        assert!(reply.status.is_busy());

        assert_eq!(
            error(&send(&mut sim, 0x32, "A10R")),
            Some(DeviceError::Known(ErrorCode::CommandOverflow))
        );
        assert!(send(&mut sim, 0x33, "Q").status.is_busy());
        assert!(send(&mut sim, 0x34, "Q").status.is_ready());
        assert_eq!(error(&send(&mut sim, 0x35, "A10R")), None);
    }

    #[test]
    fn faults_shape_replies() {
        let mut sim = sim();
        sim.push_fault(Fault::Drop);
        sim.write(&frame::encode(pump().to_byte(), b"1Q", ChecksumKind::Xor))
            .unwrap();
        assert!(matches!(
            sim.read(Duration::ZERO),
            Err(TransportError::Timeout)
        ));

        sim.push_fault(Fault::Late(vec![0xAA]));
        send(&mut sim, 0x32, "Q");
        sim.discard_input().unwrap();
        assert_eq!(sim.discards(), 1);
        assert_eq!(sim.writes(), 2);

        let unknown = Address::new(7).unwrap();
        sim.write(&frame::encode(unknown.to_byte(), b"1Q", ChecksumKind::Xor))
            .unwrap();
        assert!(sim.read(Duration::ZERO).is_err());
    }

    #[test]
    fn status_byte_layout() {
        let mut sim = sim();
        let reply = send(&mut sim, 0x31, "Q");
        assert_eq!(reply.status, status::decode(0x60));
    }
}
