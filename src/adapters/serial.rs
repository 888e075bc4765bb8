//! Serial-port transport.
//!
//! Wraps the `serialport` crate behind the [`Transport`] port.  Reads are
//! non-blocking: `receive` only takes what the driver already buffered.
//! Without the `serial` feature every open fails with
//! [`TransportError::Unsupported`].

#[cfg(feature = "serial")]
use std::io::{Read, Write};

#[cfg(feature = "serial")]
use log::info;

use crate::app::ports::{PortOpener, PortSpec, Transport};
use crate::config::SerialSettings;
#[cfg(feature = "serial")]
use crate::config::Parity;
use crate::error::{Result, TransportError};

/// One open serial port.
pub struct SerialTransport {
    #[cfg(feature = "serial")]
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    #[cfg(feature = "serial")]
    pub fn open(path: &str, settings: SerialSettings) -> std::result::Result<Self, TransportError> {
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        let stop_bits = if settings.stop_bits == 2 {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        };
        let port = serialport::new(path, settings.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(std::time::Duration::from_millis(1))
            .open()
            .map_err(|e| TransportError::Open {
                port: path.to_string(),
                reason: e.to_string(),
            })?;
        info!(
            "serial: opened {} at {} baud, {:?}, {} stop bit(s)",
            path, settings.baud, settings.parity, settings.stop_bits
        );
        Ok(Self { port })
    }

    #[cfg(not(feature = "serial"))]
    pub fn open(_path: &str, _settings: SerialSettings) -> std::result::Result<Self, TransportError> {
        Err(TransportError::Unsupported)
    }
}

#[cfg(feature = "serial")]
fn io_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Io(e.to_string())
}

#[cfg(feature = "serial")]
impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> std::result::Result<(), TransportError> {
        self.port.write_all(data).map_err(io_error)?;
        self.port.flush().map_err(io_error)
    }

    fn receive(&mut self) -> std::result::Result<Vec<u8>, TransportError> {
        let available = self.port.bytes_to_read().map_err(io_error)? as usize;
        if available == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0; available];
        let n = self.port.read(&mut buf).map_err(io_error)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn clear_input_buffer(&mut self) -> std::result::Result<(), TransportError> {
        self.port.clear(serialport::ClearBuffer::Input).map_err(io_error)
    }
}

#[cfg(not(feature = "serial"))]
impl Transport for SerialTransport {
    fn send(&mut self, _data: &[u8]) -> std::result::Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    fn receive(&mut self) -> std::result::Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported)
    }

    fn clear_input_buffer(&mut self) -> std::result::Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }
}

/// Opens every device on its configured serial port.
#[derive(Debug, Default)]
pub struct SerialPorts;

impl PortOpener for SerialPorts {
    fn open(&mut self, spec: &PortSpec<'_>) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(spec.port, spec.serial)?))
    }
}
