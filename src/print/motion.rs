//! Stage motion sequences used by the print process.
//!
//! [`move_stage`] is the per-layer move run as a background task during the
//! dark phase. The convergence helpers and the park/return sequences run
//! before and after a print, when blocking on the controller is acceptable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::{BringUpConfig, MotionConfig};
use crate::error::{AppResult, SlaError};
use crate::hardware::smc100::Smc100Controller;

/// Distances making up one layer move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovePlan {
    /// Layer thickness.
    pub step: f64,
    /// Clip mode skips the pumping moves.
    pub clip_mode: bool,
    /// Lift before the step and return after it.
    pub pump_distance: f64,
}

impl MovePlan {
    /// Relative moves in the order they are issued: pump up, step, pump down.
    pub fn sub_moves(&self) -> Vec<f64> {
        if self.clip_mode {
            vec![self.step]
        } else {
            vec![-self.pump_distance, self.step, self.pump_distance]
        }
    }
}

/// Bounds on waiting for the controller to report READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveSettings {
    /// Pause between status queries.
    pub poll_interval: Duration,
    /// Longest wait for READY after one sub-move.
    pub timeout: Duration,
}

impl From<&MotionConfig> for MoveSettings {
    fn from(config: &MotionConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.ready_poll_interval_ms),
            timeout: Duration::from_millis(config.move_timeout_ms),
        }
    }
}

/// Run the sub-moves of `plan` in sequence, waiting for READY after each.
///
/// The controller stays locked for the whole move. A failed status query is
/// logged and polled again; the move itself is never re-issued. Each wait is
/// bounded by `settings.timeout`.
pub async fn move_stage(
    controller: Arc<Mutex<Smc100Controller>>,
    plan: MovePlan,
    settings: MoveSettings,
) -> AppResult<()> {
    let mut controller = controller.lock().await;
    for distance in plan.sub_moves() {
        controller.relative_move(distance)?;
        wait_until_ready(&mut controller, settings).await?;
    }
    Ok(())
}

async fn wait_until_ready(
    controller: &mut Smc100Controller,
    settings: MoveSettings,
) -> AppResult<()> {
    let started = Instant::now();
    loop {
        match controller.get_current_status().await {
            Ok(reading) if reading.is_ready() => return Ok(()),
            Ok(reading) => debug!(status = %reading, "waiting for stage"),
            Err(e) => warn!(error = %e, "stage status query failed, retrying"),
        }

        if started.elapsed() >= settings.timeout {
            return Err(SlaError::Timeout {
                waiting_for: "stage to report Ready".to_string(),
                elapsed: started.elapsed(),
            });
        }
        sleep(settings.poll_interval).await;
    }
}

/// Tolerance and timing for a convergence wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceSettings {
    /// Largest accepted difference from the target.
    pub tolerance: f64,
    /// Longest wait before giving up.
    pub timeout: Duration,
    /// Pause between readings.
    pub poll_interval: Duration,
}

/// Result of a convergence wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Convergence {
    /// Reading within tolerance after `iterations` attempts.
    Matched { iterations: u32 },
    /// Gave up; `last_reading` is the last successful read.
    TimedOut { last_reading: Option<f64> },
}

impl Convergence {
    /// True when the target was reached.
    pub fn is_matched(&self) -> bool {
        matches!(self, Convergence::Matched { .. })
    }
}

#[derive(Debug, Clone, Copy)]
enum Quantity {
    Position,
    Velocity,
}

impl Quantity {
    async fn read(self, controller: &mut Smc100Controller) -> AppResult<f64> {
        match self {
            Quantity::Position => controller.get_position().await,
            Quantity::Velocity => controller.get_velocity().await,
        }
    }

    fn command(self, controller: &mut Smc100Controller, target: f64) -> AppResult<()> {
        match self {
            Quantity::Position => controller.absolute_move(target),
            Quantity::Velocity => controller.set_velocity(target),
        }
    }
}

async fn converge(
    controller: &mut Smc100Controller,
    quantity: Quantity,
    target: f64,
    settings: ConvergenceSettings,
) -> Convergence {
    let deadline = Instant::now() + settings.timeout;
    let mut last_reading = None;
    let mut iterations = 0u32;

    // The deadline is only checked between attempts; a query that has started
    // always completes.
    loop {
        sleep_until((Instant::now() + settings.poll_interval).min(deadline)).await;
        if Instant::now() >= deadline {
            warn!(?quantity, target, ?last_reading, "stage did not converge in time");
            return Convergence::TimedOut { last_reading };
        }

        iterations += 1;
        match quantity.read(controller).await {
            Ok(value) if (value - target).abs() <= settings.tolerance => {
                return Convergence::Matched { iterations };
            }
            Ok(value) => last_reading = Some(value),
            Err(e) => debug!(error = %e, ?quantity, "convergence query failed"),
        }
        if let Err(e) = quantity.command(controller, target) {
            warn!(error = %e, ?quantity, "failed to re-issue set command");
        }
    }
}

/// Poll the position until it is within tolerance of `target`, re-issuing the
/// absolute move each iteration. Returns `TimedOut` once `settings.timeout`
/// has elapsed; a query in progress at the deadline is allowed to finish.
pub async fn wait_for_position(
    controller: &mut Smc100Controller,
    target: f64,
    settings: ConvergenceSettings,
) -> Convergence {
    converge(controller, Quantity::Position, target, settings).await
}

/// Velocity counterpart of [`wait_for_position`].
pub async fn wait_for_velocity(
    controller: &mut Smc100Controller,
    target: f64,
    settings: ConvergenceSettings,
) -> Convergence {
    converge(controller, Quantity::Velocity, target, settings).await
}

impl BringUpConfig {
    /// Position wait used while parking and returning.
    pub fn position_convergence(&self) -> ConvergenceSettings {
        ConvergenceSettings {
            tolerance: self.position_tolerance,
            timeout: Duration::from_secs(self.convergence_timeout_secs),
            poll_interval: Duration::from_millis(self.convergence_poll_ms),
        }
    }

    /// Velocity wait, same timing as position.
    pub fn velocity_convergence(&self) -> ConvergenceSettings {
        ConvergenceSettings {
            tolerance: self.velocity_tolerance,
            ..self.position_convergence()
        }
    }

    /// Looser position wait used after a print.
    pub fn teardown_convergence(&self) -> ConvergenceSettings {
        ConvergenceSettings {
            tolerance: self.teardown_position_tolerance,
            timeout: Duration::from_secs(self.teardown_timeout_secs),
            poll_interval: Duration::from_millis(self.convergence_poll_ms),
        }
    }
}

fn report(step: &str, outcome: Convergence) -> bool {
    match outcome {
        Convergence::Matched { iterations } => {
            debug!(step, iterations, "converged");
            true
        }
        Convergence::TimedOut { last_reading } => {
            warn!(step, ?last_reading, "continuing without convergence");
            false
        }
    }
}

/// Home the stage and park it at the first layer position.
///
/// Travels fast to `approach_offset` short of `initial_position`, then covers
/// the rest at print velocity. Convergence timeouts are logged and the
/// sequence carries on; the returned flag is true when every step converged.
pub async fn park_for_print(
    controller: &mut Smc100Controller,
    config: &BringUpConfig,
) -> AppResult<bool> {
    let position = config.position_convergence();
    let velocity = config.velocity_convergence();
    let approach = config.initial_position - config.approach_offset;

    info!(target = config.initial_position, "parking stage for print");
    controller.home()?;

    controller.set_velocity(config.travel_velocity)?;
    let mut converged = report(
        "travel velocity",
        wait_for_velocity(controller, config.travel_velocity, velocity).await,
    );

    controller.absolute_move(approach)?;
    converged &= report(
        "approach position",
        wait_for_position(controller, approach, position).await,
    );

    controller.set_velocity(config.print_velocity)?;
    converged &= report(
        "print velocity",
        wait_for_velocity(controller, config.print_velocity, velocity).await,
    );

    controller.absolute_move(config.initial_position)?;
    converged &= report(
        "initial position",
        wait_for_position(controller, config.initial_position, position).await,
    );

    Ok(converged)
}

/// Retract from the resin and return to zero at travel velocity.
///
/// Uses the looser tear-down tolerance and timeout.
pub async fn return_to_base(
    controller: &mut Smc100Controller,
    config: &BringUpConfig,
) -> AppResult<bool> {
    let settings = config.teardown_convergence();
    let current = match controller.get_position().await {
        Ok(position) => position,
        Err(e) => {
            warn!(error = %e, "position unknown, retracting from initial position");
            config.initial_position
        }
    };
    let retract = current - config.approach_offset;

    info!(from = current, "returning stage to base");
    controller.absolute_move(retract)?;
    let mut converged = report(
        "retract",
        wait_for_position(controller, retract, settings).await,
    );

    controller.set_velocity(config.travel_velocity)?;
    converged &= report(
        "travel velocity",
        wait_for_velocity(
            controller,
            config.travel_velocity,
            ConvergenceSettings {
                tolerance: config.velocity_tolerance,
                ..settings
            },
        )
        .await,
    );

    controller.absolute_move(0.0)?;
    converged &= report("base", wait_for_position(controller, 0.0, settings).await);

    Ok(converged)
}
