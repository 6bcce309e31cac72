use super::{OpenPortError, Rs485};
use anyhow::Result;
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use serialport::SerialPort;
use serialport::TTYPort as NativePort;

/// True when another process holds `port_name` exclusively.
///
/// `serialport` marks the ports it opens `TIOCEXCL`, so a second open fails
/// with `EBUSY`. Holders that did not ask for exclusive access go unnoticed.
pub fn is_port_open(port_name: &str) -> bool {
    let flags = OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK;
    match fcntl::open(port_name, flags, Mode::empty()) {
        Ok(fd) => {
            let _ = unistd::close(fd);
            false
        }
        Err(Errno::EBUSY) => true,
        Err(_) => false,
    }
}

fn unsupported(port: &NativePort) -> anyhow::Error {
    OpenPortError::Rs485Error {
        port_name: port.name().unwrap_or_default(),
    }
    .into()
}

/// Darwin tty drivers have no RS-485 ioctl; the line stays as it is.
impl Rs485 for NativePort {
    fn rs485_is_enabled(&self) -> Result<bool> {
        Err(unsupported(self))
    }

    fn rs485_enable(&self, _enable: bool) -> Result<()> {
        Err(unsupported(self))
    }
}
