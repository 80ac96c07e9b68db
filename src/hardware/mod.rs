//! Hardware drivers: the stage controller and the light engine.
//!
//! - [`stage_link`]: serial port ownership and bounded line reads
//! - [`smc100`]: SMC100 motion controller built on the link and the protocol codec
//! - [`light_engine`]: projector light engine capability
//! - [`mock`]: simulated devices for tests and dry runs

pub mod light_engine;
pub mod mock;
pub mod smc100;
pub mod stage_link;

pub use light_engine::{LightEngine, LightEngineStatus, LIGHT_ENGINE_READY};
pub use smc100::{Smc100Controller, StageStatus};
pub use stage_link::{PortIo, StageLink};
