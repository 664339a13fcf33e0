//! ubirch Common
//!
//! Shared utilities for the sensor trust stack.
//!
//! This crate provides:
//! - Component-based structured logging with device ID context
//! - Log level configuration backed by `env_logger`

pub mod logging;

pub use logging::{Component, LogLevel, Logger, LoggingConfig};
