//! The print process: layer images, per-layer settings, stage motion and the
//! exposure cycle that ties them to the projector.

pub mod engine;
pub mod images;
pub mod layer_settings;
pub mod motion;
pub mod surface;

pub use engine::{AbortFlag, ExposureSettings, LayerRecord, RunOutcome, RunReport, SyncEngine};
pub use layer_settings::{LayerGroup, LayerSettings, LayerSettingsTable};
pub use motion::{
    move_stage, park_for_print, return_to_base, wait_for_position, wait_for_velocity,
    Convergence, ConvergenceSettings, MovePlan, MoveSettings,
};
pub use surface::{FrameSlot, HeadlessSurface, PresentationSurface};
