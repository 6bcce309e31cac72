#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "linux")]
use linux::is_port_open;
#[cfg(target_os = "macos")]
use macos::is_port_open;

pub use serialport::SerialPort;

use anyhow::{Context, Result};
use core::time::Duration;
use log::info;
use serialport::{DataBits, Parity, StopBits};
use thiserror::Error;

use crate::transport::SerialTransport;

pub const DEFAULT_BAUDRATE: u32 = 9600;

#[derive(Error, Debug)]
pub enum OpenPortError {
    #[error("{port_name:?} busy")]
    PortBusy { port_name: String },
    #[error("rs485 configuration failed on {port_name:?}")]
    Rs485Error { port_name: String },
}

trait Rs485 {
    fn rs485_is_enabled(&self) -> Result<bool>;
    fn rs485_enable(&self, enable: bool) -> Result<()>;

    fn rs485_is_supported(&self) -> bool {
        match self.rs485_is_enabled() {
            Ok(enabled) => self.rs485_enable(enabled).is_ok(),
            Err(_) => false,
        }
    }
}

/// Opens the serial line the pumps hang off, 8N1 as the pumps expect.
///
/// Ports in use by another process are refused unless `force` is set. On
/// adapters that support it the line is switched to RS-485 mode.
pub fn open_port(port_name: &str, baudrate: u32, force: bool) -> Result<Box<dyn SerialPort>> {
    if !force && is_port_open(port_name) {
        return Err(OpenPortError::PortBusy {
            port_name: port_name.to_string(),
        }
        .into());
    }

    let mut port = serialport::new(port_name, baudrate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native()
        .with_context(|| format!("Can't open port '{}'", port_name))?;

    if port.rs485_is_supported() && port.rs485_enable(true).is_err() && !force {
        return Err(OpenPortError::Rs485Error {
            port_name: port_name.to_string(),
        }
        .into());
    }

    port.set_timeout(Duration::from_millis(10))?;

    info!("opened {} @ {} baud", port_name, baudrate);
    Ok(Box::new(port))
}

pub fn open_transport(port_name: &str, baudrate: u32, force: bool) -> Result<SerialTransport> {
    open_port(port_name, baudrate, force).map(SerialTransport::new)
}
