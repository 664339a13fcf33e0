// Logging utilities for the sensor trust stack
//
// This module provides:
// - Component-based structured logging on top of the `log` facade
// - Device ID tracking through logger inheritance
// - Operation tracing for secure element command sequences
// - Level configuration per component

use log::{log, Level, LevelFilter};
use std::collections::HashMap;
use std::fmt::{self, Arguments, Display, Formatter};

/// Predefined components for logging categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Device,
    Channel,
    Element,
    Protocol,
    Identity,
    Provisioning,
    Custom(&'static str),
}

impl Component {
    /// Get the string representation of the component
    pub fn as_str(&self) -> &str {
        match self {
            Component::Device => "Device",
            Component::Channel => "Channel",
            Component::Element => "SIM",
            Component::Protocol => "UPP",
            Component::Identity => "Identity",
            Component::Provisioning => "Provisioning",
            Component::Custom(name) => name,
        }
    }

    /// Module path used as the `log` target for this component
    fn target(&self) -> String {
        format!("ubirch::{}", self.as_str().to_lowercase())
    }
}

// Display helper to avoid building the prefix String on every call
struct PrefixDisplay<'a> {
    parent: Option<Component>,
    component: Component,
    operation: Option<&'a str>,
}

impl Display for PrefixDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) if parent != Component::Device => {
                write!(f, "{}.{}", parent.as_str(), self.component.as_str())?
            }
            _ => write!(f, "{}", self.component.as_str())?,
        }
        if let Some(op) = self.operation {
            write!(f, "|op={op}")?;
        }
        Ok(())
    }
}

/// A helper for creating component-specific loggers with device ID tracking
#[derive(Clone, Debug)]
pub struct Logger {
    /// Component this logger is for
    component: Component,
    /// Device ID (usually the device UUID) for correlating backend records
    device_id: String,
    /// Parent component for hierarchical logging (if any)
    parent_component: Option<Component>,
    /// Operation currently being traced, e.g. `sign` or `generate_csr`
    operation: Option<String>,
}

impl Logger {
    /// Create a new root logger for a specific component and device ID
    pub fn new_root(component: Component, device_id: &str) -> Self {
        Self {
            component,
            device_id: device_id.to_string(),
            parent_component: None,
            operation: None,
        }
    }

    /// Create a child logger with the same device ID but a different component
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            device_id: self.device_id.clone(),
            parent_component: Some(self.component),
            operation: self.operation.clone(),
        }
    }

    /// Create a logger tagged with an operation name
    pub fn with_operation(&self, operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..self.clone()
        }
    }

    /// Get a reference to the device ID
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Get the component of this logger
    pub fn component(&self) -> Component {
        self.component
    }

    /// Get a reference to the operation if available
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    fn emit(&self, level: Level, args: Arguments) {
        let target = self.component.target();
        if !log::log_enabled!(target: target.as_str(), level) {
            return;
        }
        // The bare root logger skips the component to avoid redundancy
        if self.component == Component::Device
            && self.parent_component.is_none()
            && self.operation.is_none()
        {
            log!(target: target.as_str(), level, "[{}] {}", self.device_id, args);
        } else {
            log!(
                target: target.as_str(),
                level,
                "[{}][{}] {}",
                self.device_id,
                PrefixDisplay {
                    parent: self.parent_component,
                    component: self.component,
                    operation: self.operation(),
                },
                args
            );
        }
    }

    /// Log a debug message
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(Level::Debug, format_args!("{}", message.into()));
    }

    /// Log a debug message using fmt::Arguments (avoids allocating message String)
    pub fn debug_args(&self, args: Arguments) {
        self.emit(Level::Debug, args);
    }

    /// Log an info message
    pub fn info(&self, message: impl Into<String>) {
        self.emit(Level::Info, format_args!("{}", message.into()));
    }

    /// Log an info message using fmt::Arguments
    pub fn info_args(&self, args: Arguments) {
        self.emit(Level::Info, args);
    }

    /// Log a warning message
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(Level::Warn, format_args!("{}", message.into()));
    }

    /// Log a warning using fmt::Arguments
    pub fn warn_args(&self, args: Arguments) {
        self.emit(Level::Warn, args);
    }

    /// Log an error message
    pub fn error(&self, message: impl Into<String>) {
        self.emit(Level::Error, format_args!("{}", message.into()));
    }

    /// Log an error using fmt::Arguments
    pub fn error_args(&self, args: Arguments) {
        self.emit(Level::Error, args);
    }
}

/// Log levels accepted by [`LoggingConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Off,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Logging configuration with a default level and per-component overrides
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub default_level: LogLevel,
    pub component_levels: HashMap<Component, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::default_info()
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default_info()
    }

    /// Info everywhere, no overrides
    pub fn default_info() -> Self {
        Self {
            default_level: LogLevel::Info,
            component_levels: HashMap::new(),
        }
    }

    pub fn with_default_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_component_level(mut self, component: Component, level: LogLevel) -> Self {
        self.component_levels.insert(component, level);
        self
    }

    /// Install the configuration into the global `env_logger`.
    ///
    /// Safe to call more than once; only the first call installs a logger.
    pub fn apply(&self) {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(self.default_level.to_level_filter());
        for (component, level) in &self.component_levels {
            builder.filter_module(&component.target(), level.to_level_filter());
        }
        builder.format_timestamp_millis();
        let _ = builder.try_init();
    }
}
