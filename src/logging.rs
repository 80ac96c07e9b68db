//! Tracing setup and the operator log sink.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;
use crate::error::{AppResult, SlaError};

/// Receives human-readable progress messages during a print.
///
/// Called inline from the print loop, so it must return quickly.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. A second call fails
/// instead of replacing the first subscriber.
pub fn init(config: &ApplicationConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.log_format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };

    installed.map_err(|e| SlaError::Configuration(format!("cannot install logger: {e}")))
}

