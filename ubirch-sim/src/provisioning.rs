//! Identity provisioning and the operational send path.
//!
//! A device walks `Unprovisioned → PinKnown → Authenticated → KeyPresent →
//! Certified → Operational`. Each step is skipped when its result is already
//! in place (persisted PIN, existing key entry), so a reboot of a
//! provisioned device re-authenticates, re-reads its key and refreshes its
//! registration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use ubirch_common::{Component, Logger};
use uuid::Uuid;

use crate::config::SimConfig;
use crate::element::SecureElement;
use crate::error::{ErrorKind, Result, SimError};
use crate::identity::IdentityStore;
use crate::persistence::{read_if_exists, remove_if_exists, write_atomically};
use crate::protocol::{ProtocolEngine, SimSigner};
use crate::registration::{KeyRegistration, PubKeyInfo, RegistrationRecord};

const PIN_FILE: &str = "pin";
const IDENTITY_FILE: &str = "identity.bin";

/// Remote services the device talks to
pub trait Backend {
    /// Bootstrap PIN for the SIM with this IMSI
    fn bootstrap(&mut self, imsi: &str) -> Result<String>;

    /// Register the device key or certificate request
    fn register(&mut self, record: &[u8]) -> Result<()>;

    /// Deliver a package and return the backend's response package
    fn send(&mut self, upp: &[u8]) -> Result<Vec<u8>>;

    /// Whether the backend knows a package with this hash
    fn verify(&mut self, hash: &[u8]) -> Result<bool>;
}

/// Where the bootstrap PIN is kept between boots
pub trait PinStore: Send {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, pin: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

pub struct FilePinStore {
    path: PathBuf,
}

impl FilePinStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(PIN_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PinStore for FilePinStore {
    fn load(&self) -> Result<Option<String>> {
        let Some(bytes) = read_if_exists(&self.path)? else {
            return Ok(None);
        };
        let pin = String::from_utf8(bytes)
            .map_err(|e| SimError::Serialization(format!("PIN file is not UTF-8: {e}")))?;
        let pin = pin.trim();
        Ok((!pin.is_empty()).then(|| pin.to_string()))
    }

    fn save(&self, pin: &str) -> Result<()> {
        write_atomically(&self.path, pin.as_bytes())
    }

    fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path)
    }
}

#[derive(Default)]
pub struct MemoryPinStore {
    pin: Mutex<Option<String>>,
}

impl PinStore for MemoryPinStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.pin.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, pin: &str) -> Result<()> {
        *self.pin.lock().unwrap_or_else(PoisonError::into_inner) = Some(pin.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.pin.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProvisioningState {
    Unprovisioned,
    PinKnown,
    Authenticated,
    KeyPresent,
    Certified,
    Operational,
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningState::Unprovisioned => "unprovisioned",
            ProvisioningState::PinKnown => "pin-known",
            ProvisioningState::Authenticated => "authenticated",
            ProvisioningState::KeyPresent => "key-present",
            ProvisioningState::Certified => "certified",
            ProvisioningState::Operational => "operational",
        };
        f.write_str(name)
    }
}

/// What the caller should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Stop; retrying cannot succeed and may block the SIM
    Fatal,
    /// Retry the step later
    RetryWithBackoff,
}

impl Recovery {
    pub fn for_error(err: &SimError) -> Self {
        match err.kind() {
            ErrorKind::Authentication
            | ErrorKind::Framing
            | ErrorKind::Exclusivity
            | ErrorKind::Config
            | ErrorKind::Key
            | ErrorKind::Initialization
            | ErrorKind::State => Recovery::Fatal,
            ErrorKind::HardwareStatus
            | ErrorKind::Transport
            | ErrorKind::Backend
            | ErrorKind::Io
            | ErrorKind::Crypto
            | ErrorKind::Serialization => Recovery::RetryWithBackoff,
        }
    }
}

#[derive(Debug, Error)]
#[error("provisioning failed while {state}: {source}")]
pub struct ProvisioningFailure {
    pub state: ProvisioningState,
    pub recovery: Recovery,
    #[source]
    pub source: SimError,
}

/// A delivered package and what the backend answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub message: Vec<u8>,
    pub response: Vec<u8>,
    pub response_verified: bool,
}

pub struct ProvisioningFlow<B: Backend> {
    config: SimConfig,
    element: SecureElement,
    store: Arc<IdentityStore>,
    engine: ProtocolEngine,
    backend: B,
    pins: Box<dyn PinStore>,
    state: ProvisioningState,
    uuid: Option<Uuid>,
    logger: Arc<Logger>,
}

impl<B: Backend> ProvisioningFlow<B> {
    pub fn new(
        config: SimConfig,
        element: SecureElement,
        store: Arc<IdentityStore>,
        backend: B,
        pins: Box<dyn PinStore>,
        logger: Arc<Logger>,
    ) -> Result<Self> {
        config.validate()?;
        let mut engine = ProtocolEngine::new(store.clone(), logger.clone()).with_digest(config.digest);
        if let Some((uuid, key)) = config.backend_key()? {
            engine = engine.with_backend_key(uuid, &key)?;
        }
        Ok(Self {
            config,
            element,
            store,
            engine,
            backend,
            pins,
            state: ProvisioningState::Unprovisioned,
            uuid: None,
            logger: Arc::new(logger.with_component(Component::Provisioning)),
        })
    }

    /// Flow with file based PIN and identity state under `config.state_dir`
    pub fn with_state_dir(
        config: SimConfig,
        element: SecureElement,
        backend: B,
        logger: Arc<Logger>,
    ) -> Result<Self> {
        let dir = config
            .state_dir
            .clone()
            .ok_or_else(|| SimError::Config("state_dir is not configured".to_string()))?;
        let store = Arc::new(IdentityStore::load(&dir.join(IDENTITY_FILE), logger.clone())?);
        let pins = Box::new(FilePinStore::in_dir(&dir));
        Self::new(config, element, store, backend, pins, logger)
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Device UUID once the key is present
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn element_mut(&mut self) -> &mut SecureElement {
        &mut self.element
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn fail(&self, source: SimError) -> ProvisioningFailure {
        let recovery = Recovery::for_error(&source);
        self.logger.error(format!(
            "Provisioning failed while {} ({:?}): {source}",
            self.state, recovery
        ));
        ProvisioningFailure {
            state: self.state,
            recovery,
            source,
        }
    }

    fn advance(&mut self, next: ProvisioningState) {
        self.logger
            .info(format!("Provisioning {} -> {next}", self.state));
        self.state = next;
    }

    /// Drive the device to `Operational` and return its UUID
    pub fn run(&mut self) -> std::result::Result<Uuid, ProvisioningFailure> {
        self.run_steps().map_err(|e| self.fail(e))
    }

    fn run_steps(&mut self) -> Result<Uuid> {
        if self.state == ProvisioningState::Operational {
            return self.device_uuid();
        }
        let imsi = self.element.get_imsi()?;
        self.element.select_application()?;

        let pin = self.known_pin(&imsi)?;
        self.advance(ProvisioningState::PinKnown);

        self.authenticate(&imsi, pin)?;
        self.advance(ProvisioningState::Authenticated);

        let uuid = self.ensure_key()?;
        self.advance(ProvisioningState::KeyPresent);

        self.register(&uuid)?;
        self.advance(ProvisioningState::Certified);

        self.persist_identity()?;
        self.advance(ProvisioningState::Operational);
        Ok(uuid)
    }

    fn device_uuid(&self) -> Result<Uuid> {
        self.uuid
            .ok_or_else(|| SimError::InvalidState("device UUID not known yet".to_string()))
    }

    /// Persisted PIN, or a fresh bootstrap PIN from the backend
    fn known_pin(&mut self, imsi: &str) -> Result<String> {
        if let Some(pin) = self.pins.load()? {
            self.logger.debug("Using persisted PIN");
            return Ok(pin);
        }
        self.logger
            .info(format!("Requesting bootstrap PIN for IMSI {imsi}"));
        let pin = self.backend.bootstrap(imsi)?;
        self.pins.save(&pin)?;
        Ok(pin)
    }

    /// A rejected PIN is refreshed from the backend before the next attempt;
    /// the same PIN is never presented twice.
    fn authenticate(&mut self, imsi: &str, mut pin: String) -> Result<()> {
        let attempts = self.config.pin_attempts;
        for attempt in 1..=attempts {
            if self.element.authenticate(&pin)? {
                return Ok(());
            }
            self.logger
                .warn(format!("PIN rejected (attempt {attempt} of {attempts})"));
            if attempt == attempts {
                break;
            }
            let fresh = self.backend.bootstrap(imsi)?;
            if fresh == pin {
                break;
            }
            self.pins.save(&fresh)?;
            pin = fresh;
        }
        Err(SimError::AuthenticationRejected { attempts })
    }

    /// Make sure the key entry exists and is known to the identity store
    fn ensure_key(&mut self) -> Result<Uuid> {
        let name = self.config.key_name.clone();
        if !self.element.entry_exists(&name)? {
            let uuid = self.config.device_uuid.ok_or_else(|| {
                SimError::Config(format!(
                    "no key entry {name} on the SIM and no device UUID configured"
                ))
            })?;
            self.logger
                .info(format!("Generating device key {name} for {uuid}"));
            self.element.generate_key_pair(&name, &uuid)?;
        }

        let title = self.element.get_entry_title(&name)?;
        let uuid = Uuid::from_slice(&title)
            .map_err(|_| SimError::Framing(format!("entry title of {name} is not a UUID")))?;
        if let Some(configured) = self.config.device_uuid {
            if configured != uuid {
                return Err(SimError::Config(format!(
                    "key entry {name} belongs to {uuid}, configured device is {configured}"
                )));
            }
        }

        let public_key = self.element.get_public_key(&name)?;
        self.store.register(&name, uuid)?;
        self.store.register_verifying_key(&uuid, &public_key)?;
        self.uuid = Some(uuid);
        Ok(uuid)
    }

    fn register(&mut self, uuid: &Uuid) -> Result<()> {
        let name = self.config.key_name.clone();
        let record = match self.config.csr_subject.clone() {
            Some(subject) => RegistrationRecord::Csr {
                uuid: *uuid,
                der: self.element.generate_csr(&name, &subject)?,
                subject,
            },
            None => {
                let public_key = self.element.get_public_key(&name)?;
                let info =
                    PubKeyInfo::new(uuid, &public_key, Utc::now(), self.config.validity_days)?;
                let mut signer = SimSigner::new(&mut self.element, &name);
                RegistrationRecord::Key(KeyRegistration::sign(info, &mut signer)?)
            }
        };
        self.backend.register(&record.to_bytes()?)?;
        self.logger.info(format!("Registered {uuid} with the backend"));
        Ok(())
    }

    fn persist_identity(&self) -> Result<()> {
        if let Some(dir) = &self.config.state_dir {
            self.store.save(&dir.join(IDENTITY_FILE))?;
        }
        Ok(())
    }

    /// Seal `payload` into a chained package and deliver it.
    ///
    /// The chain advances when the package is built, so a failed delivery
    /// leaves a package that later ones already chain from.
    pub fn send(&mut self, payload: &[u8], payload_type: u8) -> Result<SendOutcome> {
        if self.state != ProvisioningState::Operational {
            return Err(SimError::InvalidState(format!(
                "cannot send while {}",
                self.state
            )));
        }
        let uuid = self.device_uuid()?;
        let message = {
            let mut signer = SimSigner::new(&mut self.element, &self.config.key_name);
            self.engine
                .build_chained(&mut signer, &uuid, payload, payload_type)?
        };
        self.persist_identity()?;

        let response = self.backend.send(&message)?;
        // delivery already succeeded, so a bad response only loses the check
        let response_verified = match self.config.backend_uuid {
            Some(backend) if !response.is_empty() => {
                match self.engine.verify(&backend, &response) {
                    Ok(valid) => valid,
                    Err(e) => {
                        self.logger
                            .warn(format!("Backend response is not a protocol package: {e}"));
                        false
                    }
                }
            }
            _ => false,
        };
        if !response_verified {
            self.logger.warn("Backend response could not be verified");
        }
        Ok(SendOutcome {
            message,
            response,
            response_verified,
        })
    }

    /// Ask the backend whether it anchored `message`
    pub fn confirm_delivery(&mut self, message: &[u8]) -> Result<bool> {
        let hash = self.engine.digest_algorithm().digest(message);
        self.backend.verify(&hash)
    }
}
