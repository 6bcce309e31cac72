use std::collections::BTreeSet;
use std::time::Duration;

use crate::protocol::{Address, ChecksumKind, InitDirection, StatusLayout};

/// Full plunger stroke in standard (non-microstep) mode.
pub const DEFAULT_MAX_STEPS: u32 = 3000;
pub const DEFAULT_MICROSTEP_FACTOR: u32 = 8;
/// Longest command string the pump buffers, including the trailing `R`.
pub const DEFAULT_MAX_COMMAND_LEN: usize = 255;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
/// Pause before retry `n` is `n` times this.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-pump settings, fixed for the lifetime of a bus.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub address: Address,
    pub max_steps: u32,
    pub microstep_factor: u32,
    pub valve_ports: BTreeSet<u8>,
    pub max_command_len: usize,
    pub timeout: Duration,
    pub max_attempts: usize,
    pub init_force: u8,
    pub init_direction: InitDirection,
    /// Port the valve returns to after initialization.
    pub init_out_port: Option<u8>,
}

impl DeviceConfig {
    pub fn new(address: Address) -> Self {
        DeviceConfig {
            address,
            max_steps: DEFAULT_MAX_STEPS,
            microstep_factor: DEFAULT_MICROSTEP_FACTOR,
            valve_ports: (1..=3).collect(),
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            init_force: 0,
            init_direction: InitDirection::Clockwise,
            init_out_port: None,
        }
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u8>) -> Self {
        self.valve_ports = ports.into_iter().collect();
        self
    }

    /// Upper plunger bound in the given stepping mode.
    pub fn stroke(&self, microstep: bool) -> u32 {
        if microstep {
            self.max_steps.saturating_mul(self.microstep_factor)
        } else {
            self.max_steps
        }
    }

    pub fn valve_port_count(&self) -> u8 {
        self.valve_ports.iter().next_back().copied().unwrap_or(0)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig::new(Address::default())
    }
}

/// Bus-wide protocol settings shared by every pump on one link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolConfig {
    pub checksum: ChecksumKind,
    pub status: StatusLayout,
    pub retry_backoff: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            checksum: ChecksumKind::default(),
            status: StatusLayout::default(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}
