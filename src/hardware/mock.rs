//! Mock Hardware Implementations
//!
//! Simulated devices for tests and `--simulate` dry runs.
//!
//! # Available Mocks
//!
//! - `MockSmc100` - protocol-level SMC100: parses the lines it receives with the
//!   same codec the driver uses and answers queries like the real controller
//! - `SimulatedLightEngine` - light engine that becomes ready after a number of
//!   status polls and records what it was told
//!
//! # Timing
//!
//! `MockSmc100` has no clock. A move completes after a configurable number of
//! status or position queries, so tests driven by virtual time stay
//! deterministic.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::StageConfig;
use crate::error::AppResult;
use crate::hardware::light_engine::{LightEngine, LIGHT_ENGINE_READY};
use crate::hardware::smc100::Smc100Controller;
use crate::hardware::stage_link::{PortIo, StageLink};
use crate::protocol::command::{parse_command_line, CommandType, Intent};

const STATE_READY: &str = "33";
const STATE_MOVING: &str = "28";
const STATE_HOMING: &str = "1E";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// MockSmc100 - Simulated stage controller
// =============================================================================

#[derive(Debug)]
struct Motion {
    target: f64,
    queries_left: u32,
    homing: bool,
}

#[derive(Debug)]
struct ControllerState {
    address: String,
    position: f64,
    velocity: f64,
    registers: HashMap<CommandType, f64>,
    motion: Option<Motion>,
    move_latency: u32,
    frozen: bool,
    drop_replies: bool,
    forced_status: Option<String>,
    last_error: char,
    pending: Vec<u8>,
    output: VecDeque<u8>,
    commands: Vec<String>,
    closed: bool,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            address: "1".to_string(),
            position: 0.0,
            velocity: 0.0,
            registers: HashMap::new(),
            motion: None,
            move_latency: 0,
            frozen: false,
            drop_replies: false,
            forced_status: None,
            last_error: '@',
            pending: Vec::new(),
            output: VecDeque::new(),
            commands: Vec::new(),
            closed: false,
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.pending)
                    .trim_end_matches('\r')
                    .to_string();
                self.pending.clear();
                self.handle_line(line);
            } else {
                self.pending.push(byte);
            }
        }
    }

    fn handle_line(&mut self, line: String) {
        self.commands.push(line.clone());
        let decoded = match parse_command_line(&line) {
            Ok(decoded) => decoded,
            Err(_) => {
                self.last_error = 'A';
                return;
            }
        };
        if decoded.address != self.address {
            return;
        }

        match (decoded.command, decoded.intent, decoded.parameter) {
            (CommandType::HomeSearch, Intent::None, _) => self.start_motion(0.0, true),
            (CommandType::MoveRelative, Intent::Set, Some(distance)) => {
                let from = self.motion.as_ref().map_or(self.position, |m| m.target);
                self.start_motion(from + distance, false);
            }
            (CommandType::MoveAbsolute, Intent::Set, Some(target)) => {
                self.start_motion(target, false)
            }
            (CommandType::StopMotion, Intent::None, _) => self.motion = None,
            (CommandType::Velocity, Intent::Set, Some(velocity)) => {
                if !self.frozen {
                    self.velocity = velocity;
                }
            }
            (command, Intent::Set, Some(value)) => {
                self.registers.insert(command, value);
            }
            (CommandType::PositionReal, Intent::Get, _) => {
                self.advance_motion();
                let reply = format!("TP{:.6}", self.position);
                self.reply(&reply);
            }
            (CommandType::ErrorStatus, Intent::Get, _) => {
                self.advance_motion();
                let state = match (&self.forced_status, &self.motion) {
                    (Some(code), _) => code.clone(),
                    (None, Some(motion)) if motion.homing => STATE_HOMING.to_string(),
                    (None, Some(_)) => STATE_MOVING.to_string(),
                    (None, None) => STATE_READY.to_string(),
                };
                self.reply(&format!("TS0000{state}"));
            }
            (CommandType::LastCommandError, Intent::Get, _) => {
                let code = std::mem::replace(&mut self.last_error, '@');
                self.reply(&format!("TE{code}"));
            }
            (CommandType::Velocity, Intent::Get, _) => {
                let reply = format!("VA{:.6}", self.velocity);
                self.reply(&reply);
            }
            (command, Intent::Get, _) => {
                let value = self.registers.get(&command).copied().unwrap_or(0.0);
                let reply = format!("{}{:.6}", command.wire_code(), value);
                self.reply(&reply);
            }
            _ => self.last_error = 'C',
        }
    }

    fn start_motion(&mut self, target: f64, homing: bool) {
        if let Some(motion) = &self.motion {
            // re-issuing the move in flight does not restart it
            if motion.target == target && motion.homing == homing {
                return;
            }
        }
        if self.move_latency == 0 && !self.frozen {
            self.position = target;
            self.motion = None;
        } else {
            self.motion = Some(Motion {
                target,
                queries_left: self.move_latency,
                homing,
            });
        }
    }

    fn advance_motion(&mut self) {
        if self.frozen {
            return;
        }
        if let Some(motion) = &mut self.motion {
            motion.queries_left = motion.queries_left.saturating_sub(1);
            if motion.queries_left == 0 {
                self.position = motion.target;
                self.motion = None;
            }
        }
    }

    fn reply(&mut self, body: &str) {
        if self.drop_replies {
            return;
        }
        let line = format!("{}{}\r\n", self.address, body);
        self.output.extend(line.bytes());
    }
}

/// Simulated SMC100 controller.
///
/// Clones share one device. [`MockSmc100::port`] hands out the serial end the
/// driver talks to; the clone kept by a test inspects and steers the device.
///
/// ```rust,ignore
/// let mock = MockSmc100::new();
/// let mut controller = mock.controller();
/// controller.relative_move(0.05)?;
/// assert_eq!(mock.commands(), vec!["1PR0.050000"]);
/// ```
#[derive(Clone)]
pub struct MockSmc100 {
    state: Arc<Mutex<ControllerState>>,
}

impl MockSmc100 {
    /// Controller at position 0.0, READY, moves completing immediately.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ControllerState::new())),
        }
    }

    /// Moves report MOVING for `queries` status or position queries.
    pub fn with_move_latency(queries: u32) -> Self {
        let mock = Self::new();
        lock(&mock.state).move_latency = queries;
        mock
    }

    /// Serial end of the simulated controller.
    pub fn port(&self) -> MockPort {
        lock(&self.state).closed = false;
        MockPort {
            state: Arc::clone(&self.state),
        }
    }

    /// Controller driver wired to this mock with default stage settings.
    pub fn controller(&self) -> Smc100Controller {
        let config = StageConfig {
            port: "mock-smc100".to_string(),
            ..StageConfig::default()
        };
        let link = StageLink::from_port(config.port.clone(), Box::new(self.port()));
        Smc100Controller::with_link(link, &config)
    }

    /// Place the stage at `position` and cancel any motion.
    pub fn set_position(&self, position: f64) {
        let mut state = lock(&self.state);
        state.position = position;
        state.motion = None;
    }

    /// Simulated stage position.
    pub fn position(&self) -> f64 {
        lock(&self.state).position
    }

    /// Configured velocity.
    pub fn velocity(&self) -> f64 {
        lock(&self.state).velocity
    }

    /// True while a move is in progress.
    pub fn is_moving(&self) -> bool {
        lock(&self.state).motion.is_some()
    }

    /// A frozen controller accepts moves and velocity changes but never
    /// carries them out.
    pub fn freeze(&self, frozen: bool) {
        lock(&self.state).frozen = frozen;
    }

    /// Swallow every reply while set.
    pub fn drop_replies(&self, drop: bool) {
        lock(&self.state).drop_replies = drop;
    }

    /// Report `code` as the controller state regardless of motion.
    pub fn force_status_code(&self, code: Option<&str>) {
        lock(&self.state).forced_status = code.map(str::to_string);
    }

    /// Error code returned by the next `TE` query.
    pub fn set_last_error(&self, code: char) {
        lock(&self.state).last_error = code;
    }

    /// Every line received, without terminator, oldest first.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Received lines whose wire code is `code`, in order.
    pub fn commands_with_code(&self, code: &str) -> Vec<String> {
        lock(&self.state)
            .commands
            .iter()
            .filter(|line| line.get(1..3) == Some(code))
            .cloned()
            .collect()
    }

    /// True once the driver has dropped its port.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl Default for MockSmc100 {
    fn default() -> Self {
        Self::new()
    }
}

/// Serial end of a [`MockSmc100`].
pub struct MockPort {
    state: Arc<Mutex<ControllerState>>,
}

impl PortIo for MockPort {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<usize> {
        lock(&self.state).receive(bytes);
        Ok(bytes.len())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(lock(&self.state).output.len())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        let n = buf.len().min(state.output.len());
        for (slot, byte) in buf.iter_mut().zip(state.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        lock(&self.state).output.clear();
        Ok(())
    }
}

impl Drop for MockPort {
    fn drop(&mut self) {
        lock(&self.state).closed = true;
    }
}

// =============================================================================
// SimulatedLightEngine
// =============================================================================

#[derive(Debug, Default)]
struct LightState {
    powered: bool,
    ready_after: Option<u32>,
    polls: u32,
    intensity_log: Vec<u8>,
    power_log: Vec<bool>,
}

/// Light engine that reports ready after a fixed number of status polls.
///
/// Clones share state, so a test can keep one to inspect what the print
/// process did with the other.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLightEngine {
    state: Arc<Mutex<LightState>>,
}

impl SimulatedLightEngine {
    /// Ready on the status poll after `polls` not-ready answers.
    pub fn ready_after(polls: u32) -> Self {
        let light = Self::default();
        lock(&light.state).ready_after = Some(polls);
        light
    }

    /// Engine whose status never reaches ready.
    pub fn never_ready() -> Self {
        Self::default()
    }

    /// Every intensity set, oldest first.
    pub fn intensity_log(&self) -> Vec<u8> {
        lock(&self.state).intensity_log.clone()
    }

    /// Every power switch, oldest first.
    pub fn power_log(&self) -> Vec<bool> {
        lock(&self.state).power_log.clone()
    }

    /// Power state after the last switch.
    pub fn is_powered(&self) -> bool {
        lock(&self.state).powered
    }
}

impl LightEngine for SimulatedLightEngine {
    fn set_intensity(&mut self, value: u8) -> AppResult<()> {
        lock(&self.state).intensity_log.push(value);
        Ok(())
    }

    fn power(&mut self, on: bool) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.powered = on;
        state.polls = 0;
        state.power_log.push(on);
        Ok(())
    }

    fn system_status(&mut self) -> AppResult<u8> {
        let mut state = lock(&self.state);
        if !state.powered {
            return Ok(0);
        }
        state.polls += 1;
        match state.ready_after {
            Some(n) if state.polls > n => Ok(LIGHT_ENGINE_READY),
            _ => Ok(0),
        }
    }

    fn temperature(&mut self) -> AppResult<i16> {
        Ok(if lock(&self.state).powered { 352 } else { 250 })
    }

    fn led_default_status(&mut self) -> AppResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_move_completes_after_latency() {
        let mock = MockSmc100::with_move_latency(3);
        let mut controller = mock.controller();

        controller.relative_move(2.0).unwrap();
        assert!(mock.is_moving());
        assert!(!controller.get_current_status().await.unwrap().is_ready());
        assert!(!controller.get_current_status().await.unwrap().is_ready());
        assert!(controller.get_current_status().await.unwrap().is_ready());
        assert_eq!(mock.position(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frozen_controller_never_arrives() {
        let mock = MockSmc100::with_move_latency(1);
        mock.freeze(true);
        let mut controller = mock.controller();

        controller.absolute_move(5.0).unwrap();
        for _ in 0..10 {
            assert_eq!(controller.get_position().await.unwrap(), 0.0);
        }
    }

    #[test]
    fn test_dropping_controller_closes_port() {
        let mock = MockSmc100::new();
        let controller = mock.controller();
        assert!(!mock.is_closed());
        drop(controller);
        assert!(mock.is_closed());
    }
}
