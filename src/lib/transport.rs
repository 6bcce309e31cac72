use log::debug;
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use thiserror::Error;

const READ_CHUNK: usize = 256;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("no data before timeout")]
    Timeout,
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        TransportError::Io(err.into())
    }
}

/// Byte stream carrying frames to and from the pumps on one link.
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Returns the bytes available within `timeout`, at least one.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Drops anything received but not yet read.
    fn discard_input(&mut self) -> Result<(), TransportError>;

    /// Reads until `terminator` has been seen or the time runs out.
    ///
    /// Bytes that arrived before the deadline are returned even without the
    /// terminator; `Timeout` means nothing arrived at all.
    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buffer = Vec::new();

        while !buffer.contains(&terminator) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.read(remaining) {
                Ok(chunk) => buffer.extend(chunk),
                Err(TransportError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }

        if buffer.is_empty() {
            Err(TransportError::Timeout)
        } else {
            Ok(buffer)
        }
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        SerialTransport { port }
    }

    pub fn port(&self) -> &dyn SerialPort {
        self.port.as_ref()
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.port.set_timeout(timeout)?;

        let mut buffer = [0u8; READ_CHUNK];
        match self.port.read(&mut buffer) {
            Ok(0) => Err(TransportError::Timeout),
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(TransportError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        let pending = self.port.bytes_to_read()?;
        if pending > 0 {
            debug!("discarding {} stale bytes", pending);
        }
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
