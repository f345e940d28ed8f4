//! Shared plumbing for blockpad crates: configuration, telemetry and timing.

pub mod config;
pub mod error;
pub mod perf;
pub mod telemetry;

pub use crate::config::{Config, FileStore, Loader, Saver};
pub use crate::error::ConfigError;
