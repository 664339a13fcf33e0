//! Device configuration
//!
//! Loaded from and saved to `config.json` in the device's configuration
//! directory.

use serde::{Deserialize, Serialize};
use serde_json::{from_str, to_string_pretty};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use ubirch_common::{Component, Logger};
use uuid::Uuid;

use crate::channel::chunk_size_for;
use crate::element::CsrSubject;
use crate::error::{Result, SimError};
use crate::identity::{validate_entry_id, PUBLIC_KEY_LEN};
use crate::protocol::DigestAlgorithm;
use crate::registration::DEFAULT_VALIDITY_DAYS;

const CONFIG_FILE: &str = "config.json";

/// AID of the signing applet
pub const DEFAULT_APPLICATION_ID: &str = "D2760001180002FF34108389C0028B02";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Device name used in log output
    pub device_name: String,

    /// Key entry on the SIM holding the device identity
    pub key_name: String,

    /// Device UUID; read from the SIM entry title when not set
    pub device_uuid: Option<Uuid>,

    /// Application identifier of the signing applet (hex)
    pub application_id: String,

    /// Longest AT command line the modem accepts
    pub max_command_len: usize,

    /// Per-command timeout in milliseconds
    pub command_timeout_ms: u64,

    /// Attempts for SIM presence and application selection
    pub init_attempts: u32,

    /// Pause between those attempts in milliseconds
    pub retry_backoff_ms: u64,

    /// PIN presentations before giving up
    pub pin_attempts: u32,

    /// Validity window of the key registration
    pub validity_days: i64,

    pub digest: DigestAlgorithm,

    /// UUID the backend signs its responses with
    pub backend_uuid: Option<Uuid>,

    /// Backend public key, raw `x || y` in hex
    pub backend_public_key: Option<String>,

    /// Register with a CSR instead of a key registration when set
    pub csr_subject: Option<CsrSubject>,

    /// Directory for the PIN and the identity state
    pub state_dir: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_name: "device".to_string(),
            key_name: "ukey".to_string(),
            device_uuid: None,
            application_id: DEFAULT_APPLICATION_ID.to_string(),
            max_command_len: 512,
            command_timeout_ms: 5000,
            init_attempts: 3,
            retry_backoff_ms: 500,
            pin_attempts: 2,
            validity_days: DEFAULT_VALIDITY_DAYS,
            digest: DigestAlgorithm::Sha512,
            backend_uuid: None,
            backend_public_key: None,
            csr_subject: None,
            state_dir: None,
        }
    }
}

impl SimConfig {
    pub fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_key_name(mut self, key_name: &str) -> Self {
        self.key_name = key_name.to_string();
        self
    }

    pub fn with_device_uuid(mut self, uuid: Uuid) -> Self {
        self.device_uuid = Some(uuid);
        self
    }

    pub fn with_application_id(mut self, aid_hex: &str) -> Self {
        self.application_id = aid_hex.to_string();
        self
    }

    pub fn with_max_command_len(mut self, len: usize) -> Self {
        self.max_command_len = len;
        self
    }

    pub fn with_command_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.command_timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_policy(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.init_attempts = attempts;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_pin_attempts(mut self, attempts: u32) -> Self {
        self.pin_attempts = attempts;
        self
    }

    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_days = days;
        self
    }

    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_backend_key(mut self, uuid: Uuid, public_key: &[u8; PUBLIC_KEY_LEN]) -> Self {
        self.backend_uuid = Some(uuid);
        self.backend_public_key = Some(hex::encode(public_key));
        self
    }

    pub fn with_csr_subject(mut self, subject: CsrSubject) -> Self {
        self.csr_subject = Some(subject);
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Root logger tagged with the device name
    pub fn root_logger(&self) -> Arc<Logger> {
        Arc::new(Logger::new_root(Component::Device, &self.device_name))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Backend UUID and decoded public key, when both are configured
    pub fn backend_key(&self) -> Result<Option<(Uuid, Vec<u8>)>> {
        match (&self.backend_uuid, &self.backend_public_key) {
            (Some(uuid), Some(key_hex)) => {
                let key = hex::decode(key_hex)
                    .map_err(|e| SimError::Config(format!("invalid backend key: {e}")))?;
                Ok(Some((*uuid, key)))
            }
            (None, None) => Ok(None),
            _ => Err(SimError::Config(
                "backend uuid and public key must be configured together".to_string(),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_entry_id(&self.key_name)
            .map_err(|e| SimError::Config(format!("key name: {e}")))?;
        let aid = hex::decode(&self.application_id)
            .map_err(|e| SimError::Config(format!("invalid application id: {e}")))?;
        if !(5..=16).contains(&aid.len()) {
            return Err(SimError::Config(format!(
                "application id must be 5 to 16 bytes, got {}",
                aid.len()
            )));
        }
        if self.device_name.is_empty() {
            return Err(SimError::Config("device name must not be empty".to_string()));
        }
        chunk_size_for(self.max_command_len)?;
        if self.command_timeout_ms == 0 {
            return Err(SimError::Config("command timeout must be positive".to_string()));
        }
        if self.init_attempts == 0 || self.pin_attempts == 0 {
            return Err(SimError::Config("attempt counts must be positive".to_string()));
        }
        if self.validity_days <= 0 {
            return Err(SimError::Config("validity must be positive".to_string()));
        }
        if let Some((_, key)) = self.backend_key()? {
            if key.len() != PUBLIC_KEY_LEN {
                return Err(SimError::Config(format!(
                    "backend key must be {PUBLIC_KEY_LEN} bytes, got {}",
                    key.len()
                )));
            }
        }
        Ok(())
    }

    /// Load configuration from `config_dir/config.json`
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);

        if !config_file.exists() {
            return Err(SimError::Config(format!(
                "Configuration file not found: {config_file:?}"
            )));
        }

        let config_content = std::fs::read_to_string(&config_file)?;
        let config: SimConfig = from_str(&config_content).map_err(|e| {
            SimError::Config(format!("Failed to parse config file {config_file:?}: {e}"))
        })?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to `config_dir/config.json`
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        let config_file = config_dir.join(CONFIG_FILE);
        let config_content = to_string_pretty(self)?;
        std::fs::create_dir_all(config_dir)?;
        std::fs::write(&config_file, config_content)?;
        Ok(())
    }

    pub fn exists(config_dir: &Path) -> bool {
        config_dir.join(CONFIG_FILE).exists()
    }
}
