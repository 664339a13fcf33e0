//! Typed operations of the SIM signing applet.
//!
//! Every operation takes the command channel for its whole duration, so the
//! data session stays suspended across multi-command sequences such as
//! sign-init followed by the chunked sign-update.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ubirch_common::{Component, Logger};
use uuid::Uuid;

use crate::channel::status::{SW_PIN_BLOCKED, SW_PIN_COUNTER, SW_PIN_COUNTER_MASK, SW_VERIFY_FAILED};
use crate::channel::{
    ChannelGuard, ChunkedTemplate, CommandChannel, CommandResult, CommandTemplate, Status,
    GET_RESPONSE,
};
use crate::config::SimConfig;
use crate::error::{ErrorCode, Result, SimError};
use crate::identity::{private_entry_id, validate_entry_id, PUBLIC_KEY_LEN};
use crate::tlv::{self, TlvBuilder};

const SELECT: CommandTemplate = CommandTemplate::new(0x00, 0xA4, 0x04, 0x00);
const VERIFY_PIN: CommandTemplate = CommandTemplate::new(0x00, 0x20, 0x00, 0x00);
const ENTRY_SELECT: CommandTemplate = CommandTemplate::new(0x80, 0xA5, 0x00, 0x00);
const ENTRY_DELETE: CommandTemplate = CommandTemplate::new(0x80, 0xE5, 0x00, 0x00);
const KEY_GENERATE: CommandTemplate = CommandTemplate::new(0x80, 0xB9, 0x80, 0x00);
const KEY_GET: CommandTemplate = CommandTemplate::new(0x80, 0xCB, 0x00, 0x00);
const KEY_STORE: ChunkedTemplate =
    ChunkedTemplate::new(CommandTemplate::new(0x80, 0xD5, 0x00, 0x00), 0x00, 0x80);
const SIGN_INIT: CommandTemplate = CommandTemplate::new(0x80, 0xB5, 0x00, 0x00);
const SIGN_UPDATE: ChunkedTemplate =
    ChunkedTemplate::new(CommandTemplate::new(0x80, 0xB6, 0x00, 0x00), 0x00, 0x80);
const VERIFY_INIT: CommandTemplate = CommandTemplate::new(0x80, 0xB7, 0x00, 0x00);
const VERIFY_UPDATE: ChunkedTemplate =
    ChunkedTemplate::new(CommandTemplate::new(0x80, 0xB8, 0x00, 0x00), 0x00, 0x80);
const CSR_GENERATE: CommandTemplate = CommandTemplate::new(0x80, 0xBA, 0x80, 0x00);
const CSR_GET_NEXT: CommandTemplate = CommandTemplate::new(0x80, 0xBA, 0x01, 0x00);
const CERT_GET: CommandTemplate = CommandTemplate::new(0x80, 0xCC, 0x00, 0x00);

/// Key type byte for ECC keys
pub const KEY_TYPE_ECC: u8 = 0x03;
/// P-256 key length in bits, big endian
pub const KEY_LENGTH_P256: [u8; 2] = [0x01, 0x00];
/// ECDSA with SHA-256
pub const ALGORITHM_ECDSA_SHA256: u8 = 0x21;
/// Flag bit asking the applet to hash the data before signing
pub const HASH_FIRST_FLAG: u8 = 0x40;
/// CSR structure version
pub const CSR_VERSION: u8 = 0x00;

/// Uncompressed SEC1 point marker
const SEC1_UNCOMPRESSED: u8 = 0x04;

/// Framing applied by the applet to signed data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignMode {
    /// Raw ECDSA signature over the data
    Plain = 0x00,
    /// Signed protocol package
    Signed = 0x22,
    /// Chained protocol package
    Chained = 0x23,
}

impl SignMode {
    fn p1(self, hash_first: bool) -> u8 {
        let flag = if hash_first { HASH_FIRST_FLAG } else { 0 };
        self as u8 | flag
    }
}

/// Subject attributes placed in a certificate signing request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrSubject {
    pub country: String,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub organization: String,
    pub organizational_unit: Option<String>,
    pub common_name: String,
}

impl CsrSubject {
    pub fn new(country: &str, organization: &str, common_name: &str) -> Self {
        Self {
            country: country.to_string(),
            organization: organization.to_string(),
            common_name: common_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }

    pub fn with_locality(mut self, locality: &str) -> Self {
        self.locality = Some(locality.to_string());
        self
    }

    pub fn with_organizational_unit(mut self, unit: &str) -> Self {
        self.organizational_unit = Some(unit.to_string());
        self
    }

    fn encode(&self) -> Result<Vec<u8>> {
        TlvBuilder::new()
            .add(tlv::TAG_SUBJECT_COUNTRY, &self.country)
            .add_opt(tlv::TAG_SUBJECT_STATE, self.state.as_ref())
            .add_opt(tlv::TAG_SUBJECT_LOCALITY, self.locality.as_ref())
            .add(tlv::TAG_SUBJECT_ORGANIZATION, &self.organization)
            .add_opt(
                tlv::TAG_SUBJECT_ORGANIZATIONAL_UNIT,
                self.organizational_unit.as_ref(),
            )
            .add(tlv::TAG_SUBJECT_COMMON_NAME, &self.common_name)
            .build()
    }
}

/// The SIM signing applet
pub struct SecureElement {
    channel: CommandChannel,
    aid: Vec<u8>,
    init_attempts: u32,
    retry_backoff: Duration,
    logger: Arc<Logger>,
}

impl SecureElement {
    pub fn new(channel: CommandChannel, config: &SimConfig, logger: Arc<Logger>) -> Result<Self> {
        let aid = hex::decode(&config.application_id)
            .map_err(|e| SimError::Config(format!("invalid application id: {e}")))?;
        Ok(Self {
            channel,
            aid,
            init_attempts: config.init_attempts.max(1),
            retry_backoff: config.retry_backoff(),
            logger: Arc::new(logger.with_component(Component::Element)),
        })
    }

    fn acquire(&mut self) -> Result<ChannelGuard<'_>> {
        self.channel.acquire()
    }

    /// IMSI of the inserted SIM, retried while the modem reports none
    pub fn get_imsi(&mut self) -> Result<String> {
        for attempt in 1..=self.init_attempts {
            let lines = self.acquire().and_then(|mut ch| ch.send_at("AT+CIMI"));
            match lines {
                Ok(lines) => {
                    if let Some(imsi) = lines
                        .iter()
                        .find(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()))
                    {
                        self.logger.debug(format!("IMSI {imsi}"));
                        return Ok(imsi.clone());
                    }
                    self.logger
                        .warn(format!("No IMSI reported (attempt {attempt})"));
                }
                Err(e) => self
                    .logger
                    .warn(format!("IMSI query failed (attempt {attempt}): {e}")),
            }
            self.backoff(attempt);
        }
        Err(SimError::InitializationFailed(format!(
            "SIM not present after {} attempts",
            self.init_attempts
        )))
    }

    /// Select the signing applet, retrying within the configured budget
    pub fn select_application(&mut self) -> Result<bool> {
        for attempt in 1..=self.init_attempts {
            match self.try_select_application() {
                Ok(true) => {
                    self.logger.info("Signing application selected");
                    return Ok(true);
                }
                Ok(false) => self
                    .logger
                    .warn(format!("Application select refused (attempt {attempt})")),
                Err(e) => self
                    .logger
                    .warn(format!("Application select failed (attempt {attempt}): {e}")),
            }
            self.backoff(attempt);
        }
        Err(SimError::InitializationFailed(format!(
            "application {} not selectable after {} attempts",
            hex::encode_upper(&self.aid),
            self.init_attempts
        )))
    }

    /// One select attempt
    pub fn try_select_application(&mut self) -> Result<bool> {
        let aid_hex = hex::encode_upper(&self.aid);
        let mut ch = self.acquire()?;
        let result = ch.execute(&SELECT.render(&aid_hex))?;
        // the FCI is not used, only the final status
        let result = ch.drain_more_data(result, GET_RESPONSE)?;
        Ok(result.is_ok())
    }

    fn backoff(&self, attempt: u32) {
        if attempt < self.init_attempts {
            thread::sleep(self.retry_backoff);
        }
    }

    /// Present the PIN. `Ok(false)` means wrong PIN with retries left.
    pub fn authenticate(&mut self, pin: &str) -> Result<bool> {
        if pin.is_empty() || !pin.is_ascii() {
            return Err(SimError::InvalidState("PIN must be non-empty ASCII".to_string()));
        }
        let result = {
            let mut ch = self.acquire()?;
            ch.execute(&VERIFY_PIN.render(&hex::encode_upper(pin)))?
        };
        match result.status {
            Status::Ok => {
                self.logger.info("PIN accepted");
                Ok(true)
            }
            Status::Error(ErrorCode::Sw(sw)) if sw == SW_PIN_BLOCKED => {
                self.logger.error("PIN blocked");
                Err(SimError::AuthenticationBlocked)
            }
            Status::Error(ErrorCode::Sw(sw)) if sw & SW_PIN_COUNTER_MASK == SW_PIN_COUNTER => {
                self.logger
                    .warn(format!("Wrong PIN, {} attempt(s) left", sw & 0x000F));
                Ok(false)
            }
            other => Err(SimError::status("authenticate", other.to_error_code())),
        }
    }

    /// Create a key pair: public entry `entry_id` and its private twin
    pub fn generate_key_pair(&mut self, entry_id: &str, uuid: &Uuid) -> Result<()> {
        validate_entry_id(entry_id)?;
        let args = TlvBuilder::new()
            .add(tlv::TAG_ENTRY_ID, entry_id)
            .add(tlv::TAG_ENTRY_TITLE, uuid.as_bytes())
            .add(tlv::TAG_KEY_TYPE, [KEY_TYPE_ECC])
            .add(tlv::TAG_KEY_LENGTH, KEY_LENGTH_P256)
            .add(tlv::TAG_ENTRY_ID, private_entry_id(entry_id))
            .add(tlv::TAG_ENTRY_TITLE, uuid.as_bytes())
            .build_hex()?;
        {
            let mut ch = self.acquire()?;
            ch.execute(&KEY_GENERATE.render(&args))?
                .expect_ok("generate_key_pair")?;
        }
        self.logger
            .info(format!("Generated key pair {entry_id} for {uuid}"));
        Ok(())
    }

    /// Store a foreign public key (raw `x || y`) for later verification
    pub fn store_public_key(
        &mut self,
        entry_id: &str,
        uuid: &Uuid,
        public_key: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<()> {
        validate_entry_id(entry_id)?;
        let mut point = Vec::with_capacity(PUBLIC_KEY_LEN + 1);
        point.push(SEC1_UNCOMPRESSED);
        point.extend_from_slice(public_key);
        let args = TlvBuilder::new()
            .add(tlv::TAG_ENTRY_ID, entry_id)
            .add(tlv::TAG_ENTRY_TITLE, uuid.as_bytes())
            .add(tlv::TAG_KEY_TYPE, [KEY_TYPE_ECC])
            .add(tlv::TAG_KEY_LENGTH, KEY_LENGTH_P256)
            .add(tlv::TAG_PUBLIC_KEY, point)
            .build_hex()?;
        let log = self.logger.with_operation("store_public_key");
        {
            let mut ch = self.acquire()?;
            ch.execute_chunked(KEY_STORE, &args)?
                .expect_ok("store_public_key")?;
        }
        log.info(format!("Stored public key {entry_id} for {uuid}"));
        Ok(())
    }

    /// Raw `x || y` public key of an entry
    pub fn get_public_key(&mut self, entry_id: &str) -> Result<[u8; PUBLIC_KEY_LEN]> {
        let args = entry_args(entry_id)?;
        let result = {
            let mut ch = self.acquire()?;
            let first = ch.execute(&KEY_GET.render(&args))?;
            ch.drain_more_data(first, GET_RESPONSE)?
        };
        let data = not_found_as_key_error(result, entry_id)?.into_data("get_public_key")?;
        let fields = tlv::decode_all(&data)?;
        let point = tlv::find(&fields, tlv::TAG_PUBLIC_KEY)
            .ok_or_else(|| SimError::Framing("public key tag missing".to_string()))?;
        match point {
            [SEC1_UNCOMPRESSED, raw @ ..] if raw.len() == PUBLIC_KEY_LEN => {
                let mut key = [0u8; PUBLIC_KEY_LEN];
                key.copy_from_slice(raw);
                Ok(key)
            }
            _ => Err(SimError::Framing(format!(
                "unexpected public key encoding of {} bytes",
                point.len()
            ))),
        }
    }

    pub fn entry_exists(&mut self, entry_id: &str) -> Result<bool> {
        let result = self.select_entry(entry_id)?;
        match result.status {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            other => Err(SimError::status("entry_exists", other.to_error_code())),
        }
    }

    /// Title (owner UUID bytes) of an entry
    pub fn get_entry_title(&mut self, entry_id: &str) -> Result<Vec<u8>> {
        let result = self.select_entry(entry_id)?;
        let data = not_found_as_key_error(result, entry_id)?.into_data("get_entry_title")?;
        let fields = tlv::decode_all(&data)?;
        tlv::find(&fields, tlv::TAG_ENTRY_TITLE)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| SimError::Framing("entry title tag missing".to_string()))
    }

    fn select_entry(&mut self, entry_id: &str) -> Result<CommandResult> {
        let args = entry_args(entry_id)?;
        let mut ch = self.acquire()?;
        let first = ch.execute(&ENTRY_SELECT.render(&args))?;
        ch.drain_more_data(first, GET_RESPONSE)
    }

    /// Erase one entry. Erasing an absent entry is not an error.
    pub fn delete_entry(&mut self, entry_id: &str) -> Result<()> {
        let args = entry_args(entry_id)?;
        let result = {
            let mut ch = self.acquire()?;
            ch.execute(&ENTRY_DELETE.render(&args))?
        };
        match result.status {
            Status::Ok => {
                self.logger.info(format!("Deleted entry {entry_id}"));
                Ok(())
            }
            Status::NotFound => {
                self.logger
                    .debug(format!("Entry {entry_id} already absent"));
                Ok(())
            }
            other => Err(SimError::status("delete_entry", other.to_error_code())),
        }
    }

    /// Sign `data` with the private twin of `entry_id`.
    ///
    /// In [`SignMode::Plain`] the result is the raw 64 byte signature; the
    /// package modes return the complete package built by the applet.
    pub fn sign(
        &mut self,
        entry_id: &str,
        data: &[u8],
        mode: SignMode,
        hash_first: bool,
    ) -> Result<Vec<u8>> {
        validate_entry_id(entry_id)?;
        let init_args = TlvBuilder::new()
            .add(tlv::TAG_ENTRY_ID, private_entry_id(entry_id))
            .add(tlv::TAG_ALGORITHM, [ALGORITHM_ECDSA_SHA256])
            .build_hex()?;
        let log = self.logger.with_operation("sign");
        log.debug(format!("{} bytes with {entry_id} in {mode:?} mode", data.len()));
        let response = {
            let mut ch = self.acquire()?;
            ch.execute(&SIGN_INIT.with_p1(mode.p1(hash_first)).render(&init_args))?
                .expect_ok("sign_init")?;
            let last = ch.execute_chunked(SIGN_UPDATE, &hex::encode_upper(data))?;
            match last.status {
                Status::MoreData(_) => ch.drain_more_data(last, GET_RESPONSE)?,
                _ => last,
            }
        };
        if !response.is_ok() {
            log.warn(format!("Signing with {entry_id} failed: {:?}", response.status));
        }
        response.into_data("sign")
    }

    /// Check a signature with the public entry `entry_id`.
    ///
    /// For [`SignMode::Plain`] `data` is the signed data followed by the
    /// 64 byte signature; the package modes take the complete package.
    pub fn verify(&mut self, entry_id: &str, data: &[u8], mode: SignMode) -> Result<bool> {
        validate_entry_id(entry_id)?;
        let init_args = TlvBuilder::new()
            .add(tlv::TAG_ENTRY_ID, entry_id)
            .add(tlv::TAG_ALGORITHM, [ALGORITHM_ECDSA_SHA256])
            .build_hex()?;
        let result = {
            let mut ch = self.acquire()?;
            ch.execute(&VERIFY_INIT.with_p1(mode.p1(false)).render(&init_args))?
                .expect_ok("verify_init")?;
            ch.execute_chunked(VERIFY_UPDATE, &hex::encode_upper(data))?
        };
        match result.status {
            Status::Ok => Ok(true),
            Status::Error(ErrorCode::Sw(SW_VERIFY_FAILED)) => {
                self.logger
                    .warn(format!("Signature rejected by entry {entry_id}"));
                Ok(false)
            }
            other => Err(SimError::status("verify", other.to_error_code())),
        }
    }

    /// DER certificate signing request for the key pair `entry_id`
    pub fn generate_csr(&mut self, entry_id: &str, subject: &CsrSubject) -> Result<Vec<u8>> {
        validate_entry_id(entry_id)?;
        let keys = TlvBuilder::new()
            .add(tlv::TAG_ENTRY_ID, entry_id)
            .add(tlv::TAG_ENTRY_ID, private_entry_id(entry_id))
            .build()?;
        let args = TlvBuilder::new()
            .add(tlv::TAG_CSR_VERSION, [CSR_VERSION])
            .add(tlv::TAG_CSR_KEYS, keys)
            .add(tlv::TAG_CSR_SUBJECT, subject.encode()?)
            .add(tlv::TAG_ALGORITHM, [ALGORITHM_ECDSA_SHA256])
            .build_hex()?;
        let log = self.logger.with_operation("generate_csr");
        let csr = {
            let mut ch = self.acquire()?;
            let first = ch.execute(&CSR_GENERATE.render(&args))?;
            ch.drain_more_data(first, CSR_GET_NEXT)?
        }
        .into_data("generate_csr")?;
        log.info(format!("Generated CSR of {} bytes for {entry_id}", csr.len()));
        Ok(csr)
    }

    /// Certificate stored with an entry
    pub fn get_certificate(&mut self, entry_id: &str) -> Result<Vec<u8>> {
        let args = entry_args(entry_id)?;
        let result = {
            let mut ch = self.acquire()?;
            let first = ch.execute(&CERT_GET.render(&args))?;
            ch.drain_more_data(first, GET_RESPONSE)?
        };
        let data = not_found_as_key_error(result, entry_id)?.into_data("get_certificate")?;
        let fields = tlv::decode_all(&data)?;
        tlv::find(&fields, tlv::TAG_CERTIFICATE)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| SimError::Framing("certificate tag missing".to_string()))
    }
}

fn entry_args(entry_id: &str) -> Result<String> {
    if entry_id.is_empty() {
        return Err(SimError::InvalidKey("empty entry id".to_string()));
    }
    TlvBuilder::new().add(tlv::TAG_ENTRY_ID, entry_id).build_hex()
}

fn not_found_as_key_error(result: CommandResult, entry_id: &str) -> Result<CommandResult> {
    match result.status {
        Status::NotFound => Err(SimError::KeyNotFound(entry_id.to_string())),
        _ => Ok(result),
    }
}
