use std::fmt;
use thiserror::Error;

/// Raw failure code reported by the secure element or the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// ISO 7816 status word, e.g. `0x6982`
    Sw(u16),
    /// Terminal line returned by the modem instead of `OK`, e.g. `+CME ERROR: 13`
    Modem(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Sw(sw) => write!(f, "{sw:04X}"),
            ErrorCode::Modem(line) => write!(f, "{line}"),
        }
    }
}

/// Coarse error category for outer layers (LED, logging) to react on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Framing,
    HardwareStatus,
    Authentication,
    Exclusivity,
    Transport,
    Initialization,
    Backend,
    Key,
    Crypto,
    Config,
    Io,
    Serialization,
    State,
}

/// Error types for the ubirch-sim crate
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Secure element returned {code} for {command}")]
    HardwareStatus { command: &'static str, code: ErrorCode },

    #[error("PIN rejected after {attempts} attempt(s)")]
    AuthenticationRejected { attempts: u32 },

    #[error("PIN blocked by the secure element")]
    AuthenticationBlocked,

    #[error("Channel exclusivity violation: {0}")]
    ExclusivityViolation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SimError::Framing(_) => ErrorKind::Framing,
            SimError::HardwareStatus { .. } => ErrorKind::HardwareStatus,
            SimError::AuthenticationRejected { .. } | SimError::AuthenticationBlocked => {
                ErrorKind::Authentication
            }
            SimError::ExclusivityViolation(_) => ErrorKind::Exclusivity,
            SimError::Transport(_) => ErrorKind::Transport,
            SimError::InitializationFailed(_) => ErrorKind::Initialization,
            SimError::Backend(_) => ErrorKind::Backend,
            SimError::KeyNotFound(_) | SimError::InvalidKey(_) => ErrorKind::Key,
            SimError::Crypto(_) => ErrorKind::Crypto,
            SimError::Config(_) => ErrorKind::Config,
            SimError::Io(_) => ErrorKind::Io,
            SimError::Serialization(_) => ErrorKind::Serialization,
            SimError::InvalidState(_) => ErrorKind::State,
        }
    }

    /// Status word or modem line behind a hardware failure, if any
    pub fn code(&self) -> Option<String> {
        match self {
            SimError::HardwareStatus { code, .. } => Some(code.to_string()),
            SimError::AuthenticationBlocked => Some("6983".to_string()),
            _ => None,
        }
    }

    pub(crate) fn status(command: &'static str, code: ErrorCode) -> Self {
        SimError::HardwareStatus { command, code }
    }
}

impl From<hex::FromHexError> for SimError {
    fn from(err: hex::FromHexError) -> Self {
        SimError::Framing(format!("invalid hex: {err}"))
    }
}

impl From<bincode::Error> for SimError {
    fn from(err: bincode::Error) -> Self {
        SimError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SimError {
    fn from(err: serde_json::Error) -> Self {
        SimError::Serialization(err.to_string())
    }
}

impl From<p256::ecdsa::Error> for SimError {
    fn from(err: p256::ecdsa::Error) -> Self {
        SimError::Crypto(err.to_string())
    }
}

/// Result type for ubirch-sim operations
pub type Result<T> = std::result::Result<T, SimError>;
