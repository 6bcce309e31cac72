use log::{debug, warn};
use std::time::Duration;

use crate::config::DeviceConfig;
use crate::protocol::chain::{ChainBuilder, ChainError, CommandFrame};
use crate::protocol::command::{top_speed_for_code, CommandError};
use crate::protocol::{DecodeError, Primitive, QueryKind, Response, Status};

/// Upper bound on primitives visited while unrolling repeat loops.
const UNROLL_BUDGET: usize = 1_000_000;

// Power-up speed registers, used while the real ones are unknown.
const DEFAULT_TOP_SPEED: u16 = 1400;
const DEFAULT_START_SPEED: u16 = 900;
const DEFAULT_CUTOFF_SPEED: u16 = 900;
const DEFAULT_SLOPE: u8 = 14;
/// Acceleration in pulses/s² per slope code.
const SLOPE_ACCELERATION: f64 = 2500.0;
const VALVE_MOVE_TIME: Duration = Duration::from_millis(200);

/// Physical pump registers. `None` means not known to the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpState {
    pub plunger: Option<u32>,
    pub valve: Option<u8>,
    pub speed_code: Option<u8>,
    pub top_speed: Option<u16>,
    pub start_speed: Option<u16>,
    pub cutoff_speed: Option<u16>,
    pub slope: Option<u8>,
    pub microstep: bool,
    pub initialized: bool,
}

impl PumpState {
    fn clamp_speeds(&mut self) {
        if let Some(top) = self.top_speed {
            self.start_speed = self.start_speed.map(|v| v.min(top));
            self.cutoff_speed = self.cutoff_speed.map(|v| v.min(top));
        }
    }

    fn forget_position(&mut self) {
        self.plunger = None;
        self.valve = None;
    }

    /// Time the plunger needs for `steps`, ramping from the start speed
    /// to the top speed and back down to the cutoff speed.
    fn travel_time(&self, config: &DeviceConfig, steps: u32) -> Duration {
        let mut steps = f64::from(steps);
        if self.microstep {
            steps /= f64::from(config.microstep_factor.max(1));
        }
        if steps == 0.0 {
            return Duration::ZERO;
        }

        let top = f64::from(self.top_speed.unwrap_or(DEFAULT_TOP_SPEED).max(1));
        let start = f64::from(self.start_speed.unwrap_or(DEFAULT_START_SPEED)).min(top);
        let cutoff = f64::from(self.cutoff_speed.unwrap_or(DEFAULT_CUTOFF_SPEED)).min(top);
        let accel = f64::from(self.slope.unwrap_or(DEFAULT_SLOPE).max(1)) * SLOPE_ACCELERATION;
        let half_steps = 2.0 * steps;

        let ramp_up = (top * top - start * start) / (2.0 * accel);
        let ramp_down = (top * top - cutoff * cutoff) / (2.0 * accel);
        let secs = if ramp_up + ramp_down > half_steps {
            // never reaches the top speed
            let peak = (accel * half_steps + (start * start + cutoff * cutoff) / 2.0).sqrt();
            (2.0 * peak - start - cutoff) / accel
        } else {
            (top - start) / accel + (top - cutoff) / accel + (half_steps - ramp_up - ramp_down) / top
        };
        Duration::from_secs_f64(secs)
    }

    /// Applies one primitive and returns how long the pump spends on it.
    fn step(&mut self, config: &DeviceConfig, primitive: &Primitive) -> Result<Duration, CommandError> {
        let mut elapsed = Duration::ZERO;
        match *primitive {
            Primitive::Initialize { out_port, .. } => {
                self.plunger = Some(0);
                self.valve = if out_port == 0 { None } else { Some(out_port) };
                self.initialized = true;
            }
            Primitive::MoveAbsolute(steps) => {
                elapsed = self.travel_time(config, steps.abs_diff(self.plunger.unwrap_or(0)));
                self.plunger = Some(steps);
            }
            Primitive::MoveRelative(delta) => {
                let current = self.plunger.ok_or(CommandError::PumpNotInitialized)?;
                let max = config.stroke(self.microstep);
                let target = i64::from(current) + i64::from(delta);
                if !(0..=i64::from(max)).contains(&target) {
                    return Err(CommandError::OutOfRange {
                        what: "plunger position",
                        value: target,
                        min: 0,
                        max: i64::from(max),
                    });
                }
                elapsed = self.travel_time(config, delta.unsigned_abs());
                self.plunger = Some(target as u32);
            }
            Primitive::SelectValve { port, .. } => {
                elapsed = VALVE_MOVE_TIME;
                self.valve = Some(port);
            }
            Primitive::SetSpeed(code) => {
                self.speed_code = Some(code);
                self.top_speed = top_speed_for_code(code);
                self.clamp_speeds();
            }
            Primitive::SetTopSpeed(pps) => {
                self.speed_code = None;
                self.top_speed = Some(pps);
                self.clamp_speeds();
            }
            Primitive::SetStartSpeed(pps) => self.start_speed = Some(pps),
            Primitive::SetCutoffSpeed(pps) => self.cutoff_speed = Some(pps),
            Primitive::SetSlope(slope) => self.slope = Some(slope),
            Primitive::SetMicrostep(on) => {
                if on != self.microstep {
                    let factor = config.microstep_factor.max(1);
                    self.plunger = match self.plunger {
                        Some(pos) if on => Some(pos.checked_mul(factor).ok_or(
                            CommandError::OutOfRange {
                                what: "plunger position",
                                value: i64::from(pos) * i64::from(factor),
                                min: 0,
                                max: i64::from(config.stroke(true)),
                            },
                        )?),
                        Some(pos) => Some(pos / factor),
                        None => None,
                    };
                    self.microstep = on;
                }
            }
            // Stops mid-move; position has to be read back.
            Primitive::Terminate => self.plunger = None,
            Primitive::Delay(ms) => elapsed = Duration::from_millis(u64::from(ms)),
            // open ended; only the pump knows when the input fires
            Primitive::Halt(_)
            | Primitive::MarkRepeat
            | Primitive::Repeat(_)
            | Primitive::QueryStatus
            | Primitive::Query(_) => {}
        }
        Ok(elapsed)
    }

    fn run(
        &mut self,
        config: &DeviceConfig,
        steps: &[Primitive],
        budget: &mut usize,
        elapsed: &mut Duration,
    ) -> Result<(), CommandError> {
        let mut marks: Vec<usize> = Vec::new();

        for (idx, primitive) in steps.iter().enumerate() {
            *budget = budget.checked_sub(1).ok_or(ChainError::LoopTooLarge)?;
            match primitive {
                Primitive::MarkRepeat => marks.push(idx + 1),
                Primitive::Repeat(count) => {
                    let body = &steps[marks.pop().unwrap_or(0)..idx];
                    for _ in 1..*count {
                        self.run(config, body, budget, elapsed)?;
                    }
                }
                _ => *elapsed = elapsed.saturating_add(self.step(config, primitive)?),
            }
        }
        Ok(())
    }
}

/// Outcome of running a chain on paper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub state: PumpState,
    /// Estimated execution time, loops and delays included. `H` counts as zero.
    pub duration: Duration,
}

/// State the pump ends up in after running `steps` from `base`.
///
/// Loops are unrolled, so a relative move that leaves the stroke on any pass
/// is rejected.
pub fn project(
    config: &DeviceConfig,
    base: &PumpState,
    steps: &[Primitive],
) -> Result<Projection, CommandError> {
    let mut state = base.clone();
    let mut budget = UNROLL_BUDGET;
    let mut duration = Duration::ZERO;
    state.run(config, steps, &mut budget, &mut duration)?;
    Ok(Projection { state, duration })
}

/// The driver's view of one pump, changed only by confirmed responses.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterModel {
    config: DeviceConfig,
    state: PumpState,
    busy: bool,
    last_status: Option<Status>,
    firmware: Option<String>,
}

impl RegisterModel {
    pub fn new(config: DeviceConfig) -> Self {
        RegisterModel {
            config,
            state: PumpState::default(),
            busy: false,
            last_status: None,
            firmware: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> &PumpState {
        &self.state
    }

    pub fn chain(&self) -> ChainBuilder<'_> {
        ChainBuilder::new(&self.config, &self.state)
    }

    pub fn plunger_position(&self) -> Option<u32> {
        self.state.plunger
    }

    pub fn valve_port(&self) -> Option<u8> {
        self.state.valve
    }

    pub fn speed_code(&self) -> Option<u8> {
        self.state.speed_code
    }

    pub fn top_speed(&self) -> Option<u16> {
        self.state.top_speed
    }

    pub fn start_speed(&self) -> Option<u16> {
        self.state.start_speed
    }

    pub fn cutoff_speed(&self) -> Option<u16> {
        self.state.cutoff_speed
    }

    pub fn slope(&self) -> Option<u8> {
        self.state.slope
    }

    pub fn is_microstep(&self) -> bool {
        self.state.microstep
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn last_status(&self) -> Option<Status> {
        self.last_status
    }

    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    /// Plunger fully up (syringe empty).
    pub fn at_top(&self) -> Option<bool> {
        self.state.plunger.map(|pos| pos == 0)
    }

    /// Plunger fully down (syringe full).
    pub fn at_bottom(&self) -> Option<bool> {
        let max = self.config.stroke(self.state.microstep);
        self.state.plunger.map(|pos| pos == max)
    }

    /// Folds a validated response to `sent` into the model.
    ///
    /// Nothing changes when the report data cannot be parsed or lies outside
    /// what the matching set command would accept. On a device error only
    /// the status and the initialization state move.
    pub(crate) fn apply(
        &mut self,
        sent: &CommandFrame,
        response: &Response,
    ) -> Result<Status, DecodeError> {
        let status = response.status;
        let mut next = self.state.clone();
        let mut firmware = None;
        let micro = next.microstep;

        match status.error {
            Some(error) => {
                warn!("pump {}: {} after '{}'", self.config.address, error, sent.command());
                if error.requires_init() {
                    next.initialized = false;
                    next.forget_position();
                }
            }
            None => match sent.report() {
                Some(kind) => match kind {
                    QueryKind::PlungerPosition => {
                        next.plunger = Some(self.bounded(response, micro, Primitive::MoveAbsolute)?)
                    }
                    QueryKind::ValvePosition => {
                        next.valve = Some(self.bounded(response, micro, Primitive::valve)?)
                    }
                    QueryKind::StartSpeed => {
                        next.start_speed = Some(self.bounded(response, micro, Primitive::SetStartSpeed)?)
                    }
                    QueryKind::TopSpeed => {
                        next.top_speed = Some(self.bounded(response, micro, Primitive::SetTopSpeed)?)
                    }
                    QueryKind::CutoffSpeed => {
                        next.cutoff_speed = Some(self.bounded(response, micro, Primitive::SetCutoffSpeed)?)
                    }
                    QueryKind::EncoderPosition | QueryKind::BufferStatus => {
                        response.data_int()?;
                    }
                    QueryKind::FirmwareVersion => {
                        firmware = Some(response.data_str()?.to_string());
                    }
                    QueryKind::Configuration => {
                        response.data_str()?;
                    }
                },
                None => match project(&self.config, &self.state, sent.steps()) {
                    Ok(projection) => next = projection.state,
                    Err(e) => {
                        warn!(
                            "pump {}: accepted '{}' but cannot track it ({}), position unknown",
                            self.config.address,
                            sent.command(),
                            e
                        );
                        next.forget_position();
                    }
                },
            },
        }

        if next != self.state {
            debug!("pump {}: {:?} -> {:?}", self.config.address, self.state, next);
        }
        self.state = next;
        if firmware.is_some() {
            self.firmware = firmware;
        }
        self.busy = status.is_busy();
        self.last_status = Some(status);
        Ok(status)
    }

    /// Parses a report and holds it to the bounds of the command that sets it.
    fn bounded<T: TryFrom<i64> + Copy>(
        &self,
        response: &Response,
        microstep: bool,
        setter: fn(T) -> Primitive,
    ) -> Result<T, DecodeError> {
        let value = parse(response)?;
        setter(value).check(&self.config, microstep).map_err(|e| {
            DecodeError::BadData(format!("{} ({})", response.data_str().unwrap_or_default(), e))
        })?;
        Ok(value)
    }
}

fn parse<T: TryFrom<i64>>(response: &Response) -> Result<T, DecodeError> {
    let value = response.data_int()?;
    T::try_from(value).map_err(|_| DecodeError::BadData(value.to_string()))
}
