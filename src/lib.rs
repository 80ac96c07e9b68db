//! Core library for the rust_sla printer controller.
//!
//! Drives an SMC100 build stage over its serial protocol and synchronizes
//! stage moves with projected layer images. Used by the `rust_sla` binary
//! and by the integration tests.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod print;
pub mod protocol;
