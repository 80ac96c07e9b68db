//! Serial connection to the stage controller.
//!
//! `StageLink` owns the port and knows nothing about the command set: it writes
//! complete lines and reads back one terminated reply with a bounded poll loop.
//! The byte-level port is reached through [`PortIo`] so the simulated
//! controller in [`crate::hardware::mock`] can stand in for real hardware.

use std::io;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::config::StageConfig;
use crate::error::{AppResult, SlaError};

/// Delay between checks for incoming bytes while waiting for a reply.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Byte-level access to an open serial port.
///
/// Every call must return promptly: `read_bytes` is only called when
/// `bytes_available` reported data.
pub trait PortIo: Send {
    /// Write `bytes`, returning how many were accepted.
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<usize>;
    /// Bytes waiting in the input buffer.
    fn bytes_available(&mut self) -> io::Result<usize>;
    /// Read into `buf`, returning the byte count.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Discard pending input.
    fn clear_input(&mut self) -> io::Result<()>;

    /// False once the port has gone away.
    fn is_open(&self) -> bool {
        true
    }
}

#[cfg(feature = "instrument_serial")]
impl PortIo for Box<dyn serialport::SerialPort> {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let written = io::Write::write(self, bytes)?;
        io::Write::flush(self)?;
        Ok(written)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let count = self.bytes_to_read().map_err(io::Error::from)?;
        Ok(count as usize)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// The controller's serial connection.
pub struct StageLink {
    port_name: String,
    port: Option<Box<dyn PortIo>>,
}

impl StageLink {
    /// Configure and open the serial port named in `config`.
    ///
    /// The controller needs a short settle after configuration before the
    /// port is opened and checked.
    pub async fn open(config: &StageConfig) -> AppResult<Self> {
        if config.port.is_empty() {
            return Err(SlaError::Configuration(
                "stage.port is not set".to_string(),
            ));
        }

        #[cfg(feature = "instrument_serial")]
        {
            let builder = serialport::new(&config.port, config.baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::Software)
                .timeout(config.read_timeout());

            sleep(config.open_settle()).await;

            let port = builder.open().map_err(|e| SlaError::SerialOpen {
                port: config.port.clone(),
                reason: e.to_string(),
            })?;

            debug!(
                port = %config.port,
                baud_rate = config.baud_rate,
                "stage serial port opened"
            );
            Self::with_port(config.port.clone(), Box::new(port))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(SlaError::SerialFeatureDisabled)
        }
    }

    /// Wrap an already open port.
    pub fn with_port(port_name: impl Into<String>, port: Box<dyn PortIo>) -> AppResult<Self> {
        let port_name = port_name.into();
        if !port.is_open() {
            return Err(SlaError::SerialOpen {
                port: port_name,
                reason: "port did not report open".to_string(),
            });
        }
        Ok(Self::from_port(port_name, port))
    }

    /// Wrap a port without checking that it reports open.
    pub fn from_port(port_name: impl Into<String>, port: Box<dyn PortIo>) -> Self {
        Self {
            port_name: port_name.into(),
            port: Some(port),
        }
    }

    /// Name the link was opened with.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// False once the link has been closed.
    pub fn is_open(&self) -> bool {
        self.port.as_ref().is_some_and(|port| port.is_open())
    }

    fn port_mut(&mut self) -> AppResult<&mut Box<dyn PortIo>> {
        self.port.as_mut().ok_or(SlaError::SerialPortNotConnected)
    }

    /// Write `line` as-is. Fails unless every byte was accepted.
    pub fn write_line(&mut self, line: &str) -> AppResult<()> {
        let port = self.port_mut()?;
        let written = port.write_bytes(line.as_bytes())?;
        if written != line.len() {
            return Err(SlaError::ShortWrite {
                written,
                expected: line.len(),
            });
        }
        trace!(line = line.trim_end(), "wrote stage line");
        Ok(())
    }

    /// Read bytes until `terminator` is seen.
    ///
    /// Fails with `BufferFull` once `max_bytes` arrive without a terminator and
    /// with `Timeout` when `timeout` passes first. Bytes after the terminator
    /// stay in the port for the next read.
    pub async fn read_line(
        &mut self,
        terminator: u8,
        max_bytes: usize,
        timeout: Duration,
    ) -> AppResult<Vec<u8>> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut buffer = Vec::with_capacity(max_bytes);
        let mut byte = [0u8; 1];

        loop {
            let port = self.port_mut()?;
            let mut available = port.bytes_available()?;
            while available > 0 {
                if port.read_bytes(&mut byte)? == 0 {
                    break;
                }
                available -= 1;
                buffer.push(byte[0]);
                if byte[0] == terminator {
                    return Ok(buffer);
                }
                if buffer.len() >= max_bytes {
                    return Err(SlaError::BufferFull(buffer.len()));
                }
            }

            if Instant::now() >= deadline {
                return Err(SlaError::Timeout {
                    waiting_for: "stage reply".to_string(),
                    elapsed: started.elapsed(),
                });
            }
            sleep(READ_POLL_INTERVAL).await;
        }
    }

    /// Discard unread input so the next reply cannot be a stale one.
    pub fn flush_input(&mut self) -> AppResult<()> {
        self.port_mut()?.clear_input()?;
        Ok(())
    }

    /// Number of bytes waiting to be read.
    pub fn available(&mut self) -> AppResult<usize> {
        Ok(self.port_mut()?.bytes_available()?)
    }

    /// Close the port. Calling this again is a no-op.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "stage serial port closed");
        }
    }
}

impl std::fmt::Debug for StageLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLink")
            .field("port_name", &self.port_name)
            .field("open", &self.is_open())
            .finish()
    }
}
