//! Projector light engine capability.
//!
//! The USB driver itself lives outside this crate; printing only needs the
//! calls in [`LightEngine`]. [`power_on_and_wait`] is the bounded warm-up used
//! before a print.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{AppResult, SlaError};

/// System status byte reported once the engine is ready to project.
pub const LIGHT_ENGINE_READY: u8 = 1;

/// Calls the print process makes on the light engine.
pub trait LightEngine: Send {
    /// LED drive current.
    fn set_intensity(&mut self, value: u8) -> AppResult<()>;
    /// Switch the LED on or off.
    fn power(&mut self, on: bool) -> AppResult<()>;
    /// Raw system status byte.
    fn system_status(&mut self) -> AppResult<u8>;
    /// Board temperature in tenths of a degree.
    fn temperature(&mut self) -> AppResult<i16>;
    /// Whether the LED is in its power-on default state.
    fn led_default_status(&mut self) -> AppResult<bool>;
}

/// Readings taken for the status command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightEngineStatus {
    /// Raw status byte; 1 means ready.
    pub system_status: u8,
    /// Tenths of a degree.
    pub temperature: i16,
    /// LED default-state flag.
    pub led_default: bool,
}

impl LightEngineStatus {
    /// Read every status field from `light`.
    pub fn query(light: &mut dyn LightEngine) -> AppResult<Self> {
        Ok(Self {
            system_status: light.system_status()?,
            temperature: light.temperature()?,
            led_default: light.led_default_status()?,
        })
    }

    /// True when the status byte reports ready.
    pub fn is_ready(&self) -> bool {
        self.system_status == LIGHT_ENGINE_READY
    }
}

/// Power the engine on and poll its status until it reports ready.
///
/// When `max_wait` passes first the engine is powered off again and
/// `SlaError::Timeout` is returned; the caller treats that as fatal.
pub async fn power_on_and_wait(
    light: &mut dyn LightEngine,
    max_wait: Duration,
    poll_interval: Duration,
) -> AppResult<()> {
    light.power(true)?;
    info!("light engine powering on");

    let started = Instant::now();
    loop {
        match light.system_status() {
            Ok(LIGHT_ENGINE_READY) => {
                info!(elapsed = ?started.elapsed(), "light engine ready");
                return Ok(());
            }
            Ok(status) => debug!(status, "light engine warming up"),
            Err(e) => warn!(error = %e, "light engine status read failed"),
        }

        if started.elapsed() >= max_wait {
            if let Err(e) = light.power(false) {
                warn!(error = %e, "failed to power off light engine after warm-up timeout");
            }
            return Err(SlaError::Timeout {
                waiting_for: "light engine to report ready".to_string(),
                elapsed: started.elapsed(),
            });
        }
        sleep(poll_interval).await;
    }
}

/// Drop the drive current to zero and power the engine off.
pub fn power_off(light: &mut dyn LightEngine) -> AppResult<()> {
    light.set_intensity(0)?;
    light.power(false)?;
    info!("light engine powered off");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedLightEngine;
    use tracing_test::traced_test;

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_power_on_waits_for_ready() {
        let light = SimulatedLightEngine::ready_after(5);
        let mut handle = light.clone();

        let start = Instant::now();
        power_on_and_wait(
            &mut handle,
            Duration::from_secs(600),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(light.power_log(), vec![true]);
        assert!(light.is_powered());
        assert!(logs_contain("light engine ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_timeout_forces_power_off() {
        let light = SimulatedLightEngine::never_ready();
        let mut handle = light.clone();

        let err = power_on_and_wait(
            &mut handle,
            Duration::from_secs(2),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SlaError::Timeout { .. }));
        assert_eq!(light.power_log(), vec![true, false]);
        assert!(!light.is_powered());
    }

    #[test]
    fn test_status_snapshot_and_power_off() {
        let light = SimulatedLightEngine::ready_after(0);
        let mut handle = light.clone();
        handle.power(true).unwrap();

        let status = LightEngineStatus::query(&mut handle).unwrap();
        assert!(status.is_ready());

        power_off(&mut handle).unwrap();
        assert_eq!(light.intensity_log(), vec![0]);
        assert_eq!(light.power_log(), vec![true, false]);
    }
}
