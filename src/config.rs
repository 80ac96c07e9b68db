//! Printer configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/printer.toml`)
//! 2. environment variables prefixed with `SLA_`, nested keys split on `__`
//!
//! ```text
//! SLA_APPLICATION__LOG_LEVEL=debug
//! SLA_STAGE__PORT=/dev/ttyUSB0
//! SLA_PRINT__DARK_TIME_MS=250
//! ```
//!
//! Every field has a default, so an empty file yields a usable simulated setup.
//!
//! # Example
//!
//! ```no_run
//! use rust_sla::config::PrinterConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PrinterConfig::load_from("config/printer.toml")?;
//!     println!("Stage port: {}", config.stage.port);
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, SlaError};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/printer.toml";

/// Top-level printer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrinterConfig {
    /// Logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link to the stage controller
    #[serde(default)]
    pub stage: StageConfig,
    /// Per-layer move supervision
    #[serde(default)]
    pub motion: MotionConfig,
    /// Parking moves before and after a print
    #[serde(default)]
    pub bring_up: BringUpConfig,
    /// Light engine warm-up and intensity
    #[serde(default)]
    pub light_engine: LightEngineConfig,
    /// Exposure cycle
    #[serde(default)]
    pub print: PrintConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format (pretty, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Serial link to the stage controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM3")
    #[serde(default)]
    pub port: String,
    /// Serial baud rate
    #[serde(default = "default_stage_baud_rate")]
    pub baud_rate: u32,
    /// Controller address, a single character in front of every command
    #[serde(default = "default_stage_address")]
    pub address: String,
    /// Bound on waiting for one reply line
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Pause between sending a query and reading its reply
    #[serde(default = "default_query_settle_ms")]
    pub query_settle_ms: u64,
    /// Pause between configuring the port and checking it opened
    #[serde(default = "default_open_settle_ms")]
    pub open_settle_ms: u64,
    /// Longest reply line accepted, terminator included
    #[serde(default = "default_max_reply_bytes")]
    pub max_reply_bytes: usize,
}

/// Stage move supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Delay between status polls while waiting for READY
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,
    /// Upper bound on one sub-move's wait for READY
    #[serde(default = "default_move_timeout_ms")]
    pub move_timeout_ms: u64,
}

/// Parking moves before and after a print
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BringUpConfig {
    /// Stage position at which the first layer is cured
    #[serde(default)]
    pub initial_position: f64,
    /// Distance short of `initial_position` reached at travel velocity
    #[serde(default = "default_approach_offset")]
    pub approach_offset: f64,
    /// Fast velocity used for long moves
    #[serde(default = "default_travel_velocity")]
    pub travel_velocity: f64,
    /// Slow velocity used during printing
    #[serde(default = "default_print_velocity")]
    pub print_velocity: f64,
    /// Absolute tolerance when parking
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,
    /// Absolute tolerance on velocity readback
    #[serde(default = "default_velocity_tolerance")]
    pub velocity_tolerance: f64,
    /// Bound on each parking wait
    #[serde(default = "default_convergence_timeout_secs")]
    pub convergence_timeout_secs: u64,
    /// Delay between convergence queries
    #[serde(default = "default_convergence_poll_ms")]
    pub convergence_poll_ms: u64,
    /// Looser tolerance used when returning to base
    #[serde(default = "default_teardown_position_tolerance")]
    pub teardown_position_tolerance: f64,
    /// Bound on each tear-down wait
    #[serde(default = "default_teardown_timeout_secs")]
    pub teardown_timeout_secs: u64,
}

/// Light engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightEngineConfig {
    /// LED drive current applied for static prints
    #[serde(default = "default_intensity")]
    pub intensity: u8,
    /// Bound on waiting for the ready status after power-on
    #[serde(default = "default_warmup_timeout_secs")]
    pub warmup_timeout_secs: u64,
    /// Delay between status polls during warm-up
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
    /// Pause after changing intensity between dynamic groups
    #[serde(default = "default_intensity_settle_ms")]
    pub intensity_settle_ms: u64,
}

/// Exposure cycle parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintConfig {
    /// Directory of layer images
    #[serde(default)]
    pub image_dir: Option<PathBuf>,
    /// Stage travel per layer
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    /// Clip mode skips the pumping moves around each step
    #[serde(default)]
    pub clip_mode: bool,
    /// Peel distance of the pumping moves
    #[serde(default = "default_pump_distance")]
    pub pump_distance: f64,
    /// Frames each nominal layer is exposed for
    #[serde(default = "default_exposure_frames")]
    pub exposure_frames: u32,
    /// Minimum blank time between layers
    #[serde(default = "default_dark_time_ms")]
    pub dark_time_ms: u64,
    /// Frames each of the first `initial_layers` layers is exposed for
    #[serde(default = "default_initial_exposure_frames")]
    pub initial_exposure_frames: u32,
    /// Number of layers given the initial exposure
    #[serde(default)]
    pub initial_layers: u32,
    /// Display refresh rate the exposure is counted in
    #[serde(default = "default_frame_rate_hz")]
    pub frame_rate_hz: f64,
    /// Pause between the last stage move and the final position query
    #[serde(default = "default_final_settle_ms")]
    pub final_settle_ms: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_stage_baud_rate() -> u32 {
    57600
}

fn default_stage_address() -> String {
    "1".to_string()
}

fn default_read_timeout_ms() -> u64 {
    20
}

fn default_query_settle_ms() -> u64 {
    10
}

fn default_open_settle_ms() -> u64 {
    10
}

fn default_max_reply_bytes() -> usize {
    63
}

fn default_ready_poll_interval_ms() -> u64 {
    3
}

fn default_move_timeout_ms() -> u64 {
    30_000
}

fn default_approach_offset() -> f64 {
    10.0
}

fn default_travel_velocity() -> f64 {
    20.0
}

fn default_print_velocity() -> f64 {
    1.0
}

fn default_position_tolerance() -> f64 {
    0.01
}

fn default_velocity_tolerance() -> f64 {
    0.5
}

fn default_convergence_timeout_secs() -> u64 {
    60
}

fn default_convergence_poll_ms() -> u64 {
    50
}

fn default_teardown_position_tolerance() -> f64 {
    1.0
}

fn default_teardown_timeout_secs() -> u64 {
    15
}

fn default_intensity() -> u8 {
    100
}

fn default_warmup_timeout_secs() -> u64 {
    600
}

fn default_status_poll_ms() -> u64 {
    100
}

fn default_intensity_settle_ms() -> u64 {
    2000
}

fn default_step_size() -> f64 {
    0.05
}

fn default_pump_distance() -> f64 {
    1.0
}

fn default_exposure_frames() -> u32 {
    30
}

fn default_dark_time_ms() -> u64 {
    100
}

fn default_initial_exposure_frames() -> u32 {
    90
}

fn default_frame_rate_hz() -> f64 {
    30.0
}

fn default_final_settle_ms() -> u64 {
    50
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_stage_baud_rate(),
            address: default_stage_address(),
            read_timeout_ms: default_read_timeout_ms(),
            query_settle_ms: default_query_settle_ms(),
            open_settle_ms: default_open_settle_ms(),
            max_reply_bytes: default_max_reply_bytes(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            move_timeout_ms: default_move_timeout_ms(),
        }
    }
}

impl Default for BringUpConfig {
    fn default() -> Self {
        Self {
            initial_position: 0.0,
            approach_offset: default_approach_offset(),
            travel_velocity: default_travel_velocity(),
            print_velocity: default_print_velocity(),
            position_tolerance: default_position_tolerance(),
            velocity_tolerance: default_velocity_tolerance(),
            convergence_timeout_secs: default_convergence_timeout_secs(),
            convergence_poll_ms: default_convergence_poll_ms(),
            teardown_position_tolerance: default_teardown_position_tolerance(),
            teardown_timeout_secs: default_teardown_timeout_secs(),
        }
    }
}

impl Default for LightEngineConfig {
    fn default() -> Self {
        Self {
            intensity: default_intensity(),
            warmup_timeout_secs: default_warmup_timeout_secs(),
            status_poll_ms: default_status_poll_ms(),
            intensity_settle_ms: default_intensity_settle_ms(),
        }
    }
}

impl Default for PrintConfig {
    fn default() -> Self {
        Self {
            image_dir: None,
            step_size: default_step_size(),
            clip_mode: false,
            pump_distance: default_pump_distance(),
            exposure_frames: default_exposure_frames(),
            dark_time_ms: default_dark_time_ms(),
            initial_exposure_frames: default_initial_exposure_frames(),
            initial_layers: 0,
            frame_rate_hz: default_frame_rate_hz(),
            final_settle_ms: default_final_settle_ms(),
        }
    }
}

impl StageConfig {
    /// `read_timeout_ms` as a duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// `query_settle_ms` as a duration.
    pub fn query_settle(&self) -> Duration {
        Duration::from_millis(self.query_settle_ms)
    }

    /// `open_settle_ms` as a duration.
    pub fn open_settle(&self) -> Duration {
        Duration::from_millis(self.open_settle_ms)
    }
}

impl PrintConfig {
    /// Time between presented frames.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate_hz)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl PrinterConfig {
    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment overrides apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(PrinterConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SLA_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SlaError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(SlaError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        // Reply offsets assume a one-character address
        if self.stage.address.len() != 1
            || !self.stage.address.chars().all(|c| c.is_ascii_digit())
        {
            return Err(SlaError::Configuration(format!(
                "stage.address must be a single digit, got '{}'",
                self.stage.address
            )));
        }

        if self.stage.baud_rate == 0 {
            return Err(SlaError::Configuration("stage.baud_rate must be > 0".into()));
        }

        if self.stage.read_timeout_ms == 0 {
            return Err(SlaError::Configuration(
                "stage.read_timeout_ms must be > 0".into(),
            ));
        }

        if self.stage.max_reply_bytes < 4 {
            return Err(SlaError::Configuration(
                "stage.max_reply_bytes must hold at least a header and terminator".into(),
            ));
        }

        if self.motion.move_timeout_ms == 0 {
            return Err(SlaError::Configuration(
                "motion.move_timeout_ms must be > 0".into(),
            ));
        }

        if self.bring_up.position_tolerance < 0.0
            || self.bring_up.velocity_tolerance < 0.0
            || self.bring_up.teardown_position_tolerance < 0.0
        {
            return Err(SlaError::Configuration(
                "bring_up tolerances must not be negative".into(),
            ));
        }

        if self.print.exposure_frames == 0 || self.print.initial_exposure_frames == 0 {
            return Err(SlaError::Configuration(
                "print exposure frame counts must be > 0".into(),
            ));
        }

        if !(self.print.frame_rate_hz.is_finite() && self.print.frame_rate_hz > 0.0) {
            return Err(SlaError::Configuration(format!(
                "print.frame_rate_hz must be positive, got {}",
                self.print.frame_rate_hz
            )));
        }

        if self.print.pump_distance < 0.0 {
            return Err(SlaError::Configuration(
                "print.pump_distance must not be negative".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_validate() {
        let config = PrinterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stage.baud_rate, 57600);
        assert_eq!(config.stage.address, "1");
        assert_eq!(config.print.frame_period(), Duration::from_secs_f64(1.0 / 30.0));
    }

    #[test]
    fn test_load_from_toml() {
        let file = write_config(
            r#"
[stage]
port = "/dev/ttyUSB0"
read_timeout_ms = 40

[print]
step_size = 0.1
clip_mode = true
exposure_frames = 12
initial_layers = 3
"#,
        );

        let config = PrinterConfig::load_from(file.path()).unwrap();
        assert_eq!(config.stage.port, "/dev/ttyUSB0");
        assert_eq!(config.stage.read_timeout(), Duration::from_millis(40));
        assert!(config.print.clip_mode);
        assert_eq!(config.print.exposure_frames, 12);
        assert_eq!(config.print.initial_layers, 3);
        // untouched sections keep defaults
        assert_eq!(config.motion.ready_poll_interval_ms, 3);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = PrinterConfig::load_from("/nonexistent/printer.toml").unwrap();
        assert_eq!(config.light_engine.warmup_timeout_secs, 600);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = PrinterConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = PrinterConfig::default();
        config.stage.address = "12".into();
        assert!(config.validate().is_err());

        let mut config = PrinterConfig::default();
        config.print.exposure_frames = 0;
        assert!(config.validate().is_err());

        let mut config = PrinterConfig::default();
        config.print.frame_rate_hz = 0.0;
        assert!(config.validate().is_err());
    }
}
