//! Status words and the single result every applet command produces.

use crate::error::{ErrorCode, Result, SimError};

/// Command completed
pub const SW_OK: u16 = 0x9000;
/// Referenced entry does not exist
pub const SW_NOT_FOUND: u16 = 0x6A88;
/// Signature verification failed
pub const SW_VERIFY_FAILED: u16 = 0x6988;
/// PIN verification blocked
pub const SW_PIN_BLOCKED: u16 = 0x6983;
/// SW1 announcing pending response bytes (61xx)
pub const SW1_MORE_DATA: u8 = 0x61;
/// High nibble pattern of a wrong PIN with retry counter (63Cx)
pub const SW_PIN_COUNTER_MASK: u16 = 0xFFF0;
pub const SW_PIN_COUNTER: u16 = 0x63C0;

/// Interpreted status of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Number of response bytes still pending on the card
    MoreData(usize),
    NotFound,
    Error(ErrorCode),
}

impl Status {
    pub fn from_sw(sw: u16) -> Self {
        match sw {
            SW_OK => Status::Ok,
            SW_NOT_FOUND => Status::NotFound,
            sw if (sw >> 8) as u8 == SW1_MORE_DATA => {
                // 6100 announces a full 256 byte block
                let pending = (sw & 0xFF) as usize;
                Status::MoreData(if pending == 0 { 256 } else { pending })
            }
            other => Status::Error(ErrorCode::Sw(other)),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Status word carried by an error status, if any
    pub fn sw(&self) -> Option<u16> {
        match self {
            Status::Ok => Some(SW_OK),
            Status::NotFound => Some(SW_NOT_FOUND),
            Status::MoreData(n) => Some(((SW1_MORE_DATA as u16) << 8) | (*n as u16 & 0xFF)),
            Status::Error(ErrorCode::Sw(sw)) => Some(*sw),
            Status::Error(ErrorCode::Modem(_)) => None,
        }
    }

    /// Convert into an error code for reporting
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            Status::Error(code) => code.clone(),
            other => ErrorCode::Sw(other.sw().unwrap_or_default()),
        }
    }
}

/// Data returned by a command plus its final status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub data: Vec<u8>,
    pub status: Status,
}

impl CommandResult {
    pub fn new(data: Vec<u8>, status: Status) -> Self {
        Self { data, status }
    }

    pub fn ok(data: Vec<u8>) -> Self {
        Self::new(data, Status::Ok)
    }

    pub fn error(code: ErrorCode) -> Self {
        Self::new(Vec::new(), Status::Error(code))
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Data of a successful command, otherwise a hardware status error
    pub fn into_data(self, command: &'static str) -> Result<Vec<u8>> {
        match self.status {
            Status::Ok => Ok(self.data),
            other => Err(SimError::status(command, other.to_error_code())),
        }
    }

    /// Fail unless the command succeeded
    pub fn expect_ok(&self, command: &'static str) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(SimError::status(command, self.status.to_error_code()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_words() {
        assert_eq!(Status::from_sw(0x9000), Status::Ok);
        assert_eq!(Status::from_sw(0x6A88), Status::NotFound);
        assert_eq!(Status::from_sw(0x6140), Status::MoreData(0x40));
        assert_eq!(Status::from_sw(0x6100), Status::MoreData(256));
        assert_eq!(
            Status::from_sw(0x6988),
            Status::Error(ErrorCode::Sw(0x6988))
        );
    }

    #[test]
    fn into_data_surfaces_status_code() {
        let failed = CommandResult::new(vec![], Status::from_sw(0x6982));
        let err = failed.into_data("get_key").unwrap_err();
        assert_eq!(err.code().as_deref(), Some("6982"));

        let ok = CommandResult::ok(vec![1, 2]);
        assert_eq!(ok.into_data("get_key").unwrap(), vec![1, 2]);
    }
}
