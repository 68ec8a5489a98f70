//! Shared infrastructure for Tide services.
//!
//! Provides the unified configuration file, the common error type and
//! logging initialization used by every service in the workspace.

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::Error;
