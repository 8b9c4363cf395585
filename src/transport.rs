//! Byte transports a sensor connection can drive.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::info;

use crate::errors::Result;

/// Trait for Read + Write + Send, allowing different transport backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Opens the transport behind a port name.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str) -> Result<Box<dyn Transport>>;
}

/// Opens serial ports with a short read timeout so the owning worker can
/// interleave reads with commands.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl PortOpener for SerialOpener {
    fn open(&self, port: &str) -> Result<Box<dyn Transport>> {
        let serial = serialport::new(port, self.baud_rate)
            .timeout(self.read_timeout)
            .open()?;
        info!("opened {} at {} baud", port, self.baud_rate);
        Ok(Box::new(serial))
    }
}

/// One read; an expired read timeout yields `Ok(0)`.
pub fn read_chunk(transport: &mut dyn Transport, buf: &mut [u8]) -> io::Result<usize> {
    match transport.read(buf) {
        Ok(n) => Ok(n),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        }
        Err(e) => Err(e),
    }
}
