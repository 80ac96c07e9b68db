//! Newport SMC100 single-axis motion controller
//!
//! Protocol: ASCII lines, `<address><command>[value|?]\r\n` out, `\n`-terminated
//! replies in. 57600 baud, 8N1, XON/XOFF.
//!
//! Set commands are fire-and-confirm-transmission: they succeed once the line
//! is on the wire, with no acknowledgement from the device. Device-side
//! rejections show up later through [`Smc100Controller::get_last_error`].
//! Queries flush stale input, send, wait a short settle interval, then read
//! one reply line.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::StageConfig;
use crate::error::{AppResult, SlaError};
use crate::hardware::stage_link::StageLink;
use crate::protocol::command::{encode, CommandRequest, CommandType, LINE_TERMINATOR};
use crate::protocol::reply::{
    decode_error, decode_numeric, decode_status, DeviceErrorCode, ReplyField, StatusCode,
    StatusReading,
};

/// Replies end with a line feed.
const REPLY_TERMINATOR: u8 = b'\n';

/// Device-level operations on one SMC100 controller.
#[derive(Debug)]
pub struct Smc100Controller {
    link: StageLink,
    address: String,
    read_timeout: Duration,
    query_settle: Duration,
    max_reply_bytes: usize,
}

impl Smc100Controller {
    /// Open the serial port named in `config` and take ownership of it.
    pub async fn open(config: &StageConfig) -> AppResult<Self> {
        let link = StageLink::open(config).await?;
        Ok(Self::with_link(link, config))
    }

    /// Drive a controller over an already open link.
    pub fn with_link(link: StageLink, config: &StageConfig) -> Self {
        Self {
            link,
            address: config.address.clone(),
            read_timeout: config.read_timeout(),
            query_settle: config.query_settle(),
            max_reply_bytes: config.max_reply_bytes,
        }
    }

    /// Address prefixed to every command.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// True until the link is closed.
    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn send(&mut self, request: CommandRequest) -> AppResult<()> {
        let line = encode(&self.address, &request)?;
        self.link.write_line(&line)?;
        debug!(command = line.trim_end(), "sent stage command");
        Ok(())
    }

    async fn exchange(&mut self, line: &str) -> AppResult<String> {
        self.link.flush_input()?;
        self.link.write_line(line)?;
        sleep(self.query_settle).await;

        let reply = match self
            .link
            .read_line(REPLY_TERMINATOR, self.max_reply_bytes, self.read_timeout)
            .await
        {
            Ok(bytes) => bytes,
            Err(SlaError::Timeout { .. }) => {
                return Err(SlaError::NoResponse {
                    command: line.trim_end().to_string(),
                    timeout: self.read_timeout,
                })
            }
            Err(e) => return Err(e),
        };

        let reply = String::from_utf8_lossy(&reply).trim_end().to_string();
        debug!(command = line.trim_end(), reply = %reply, "stage query");
        Ok(reply)
    }

    async fn query(&mut self, command: CommandType) -> AppResult<String> {
        let line = encode(&self.address, &CommandRequest::get(command))?;
        self.exchange(&line).await
    }

    async fn query_value(&mut self, field: ReplyField) -> AppResult<f64> {
        let reply = self.query(field.command()).await?;
        decode_numeric(&reply, field)
    }

    // =========================================================================
    // Motion and set commands
    // =========================================================================

    /// Start the home search (`OR`).
    pub fn home(&mut self) -> AppResult<()> {
        self.send(CommandRequest::action(CommandType::HomeSearch))
    }

    /// Move by `distance` from the current position (`PR`).
    pub fn relative_move(&mut self, distance: f64) -> AppResult<()> {
        self.send(CommandRequest::set(CommandType::MoveRelative, distance))
    }

    /// Move to `position` (`PA`).
    pub fn absolute_move(&mut self, position: f64) -> AppResult<()> {
        self.send(CommandRequest::set(CommandType::MoveAbsolute, position))
    }

    /// `VA`
    pub fn set_velocity(&mut self, velocity: f64) -> AppResult<()> {
        self.send(CommandRequest::set(CommandType::Velocity, velocity))
    }

    /// `AC`
    pub fn set_acceleration(&mut self, acceleration: f64) -> AppResult<()> {
        self.send(CommandRequest::set(CommandType::Acceleration, acceleration))
    }

    /// `JR`
    pub fn set_jerk_time(&mut self, jerk_time: f64) -> AppResult<()> {
        self.send(CommandRequest::set(CommandType::JerkTime, jerk_time))
    }

    /// Stop the current move (`ST`).
    pub fn stop_motion(&mut self) -> AppResult<()> {
        self.send(CommandRequest::action(CommandType::StopMotion))
    }

    /// `SR`
    pub fn set_positive_limit(&mut self, limit: f64) -> AppResult<()> {
        self.send(CommandRequest::set(CommandType::PositiveSoftwareLimit, limit))
    }

    /// `SL`
    pub fn set_negative_limit(&mut self, limit: f64) -> AppResult<()> {
        self.send(CommandRequest::set(CommandType::NegativeSoftwareLimit, limit))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current position (`TP`).
    pub async fn get_position(&mut self) -> AppResult<f64> {
        self.query_value(ReplyField::Position).await
    }

    /// Configured velocity (`VA?`).
    pub async fn get_velocity(&mut self) -> AppResult<f64> {
        self.query_value(ReplyField::Velocity).await
    }

    /// Configured acceleration (`AC?`).
    pub async fn get_acceleration(&mut self) -> AppResult<f64> {
        self.query_value(ReplyField::Acceleration).await
    }

    /// Positive software limit (`SR?`).
    pub async fn get_positive_limit(&mut self) -> AppResult<f64> {
        self.query_value(ReplyField::PositiveLimit).await
    }

    /// Negative software limit (`SL?`).
    pub async fn get_negative_limit(&mut self) -> AppResult<f64> {
        self.query_value(ReplyField::NegativeLimit).await
    }

    /// Raw status token plus its table lookup.
    pub async fn get_status_code(&mut self) -> AppResult<StatusCode> {
        let reply = self.query(CommandType::ErrorStatus).await?;
        decode_status(&reply)
    }

    /// Controller state, with unmapped tokens reported as
    /// `StatusReading::UnknownCode`.
    pub async fn get_current_status(&mut self) -> AppResult<StatusReading> {
        let status = self.get_status_code().await?;
        if !status.is_recognized() {
            warn!(token = %status.token, "unrecognized controller status code");
        }
        Ok(status.reading())
    }

    /// Error from the most recent command (`TE`).
    pub async fn get_last_error(&mut self) -> AppResult<DeviceErrorCode> {
        let reply = self.query(CommandType::LastCommandError).await?;
        decode_error(&reply)
    }

    /// Send a pre-formatted line and return the reply line.
    ///
    /// The line terminator is appended when missing.
    pub async fn query_raw(&mut self, line: &str) -> AppResult<String> {
        if line.ends_with(LINE_TERMINATOR) {
            self.exchange(line).await
        } else {
            self.exchange(&format!("{line}{LINE_TERMINATOR}")).await
        }
    }

    /// Bytes waiting in the receive buffer.
    pub fn available(&mut self) -> AppResult<usize> {
        self.link.available()
    }

    /// Close the serial connection. Safe to call more than once.
    pub fn close(&mut self) {
        self.link.close();
    }
}

/// Snapshot of the stage's motion parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageStatus {
    /// Current position.
    pub position: f64,
    /// Configured velocity.
    pub velocity: f64,
    /// Configured acceleration.
    pub acceleration: f64,
    /// Positive software limit.
    pub positive_limit: f64,
    /// Negative software limit.
    pub negative_limit: f64,
}

impl StageStatus {
    /// Query every field in turn.
    pub async fn query(controller: &mut Smc100Controller) -> AppResult<Self> {
        Ok(Self {
            position: controller.get_position().await?,
            velocity: controller.get_velocity().await?,
            acceleration: controller.get_acceleration().await?,
            positive_limit: controller.get_positive_limit().await?,
            negative_limit: controller.get_negative_limit().await?,
        })
    }
}
