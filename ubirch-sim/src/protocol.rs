//! Ubirch protocol packages (UPP).
//!
//! A package is a MessagePack array. The signed variant is
//! `[0x22, uuid, type, payload, signature]`, the chained variant adds the
//! previous signature of the same device after the uuid:
//! `[0x23, uuid, prev_signature, type, payload, signature]`.
//!
//! The signature covers the serialized array up to (not including) the
//! signature element. It is produced by serializing the array with a
//! placeholder `0` in the signature slot, dropping that last byte, hashing
//! the remainder and signing the digest.

use std::sync::Arc;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use ubirch_common::{Component, Logger};
use uuid::Uuid;

use crate::element::{SecureElement, SignMode};
use crate::error::{Result, SimError};
use crate::identity::{verifying_key_from_raw, IdentityStore, PUBLIC_KEY_LEN, SIGNATURE_LEN};

/// Version byte of a signed package
pub const VERSION_SIGNED: u8 = 0x22;
/// Version byte of a chained package
pub const VERSION_CHAINED: u8 = 0x23;

/// Shortest byte string that can hold a package with its signature
pub const MIN_MESSAGE_LEN: usize = 88;

/// Payload type of plain binary payloads
pub const PAYLOAD_TYPE_BINARY: u8 = 0x00;

const FIXARRAY: u8 = 0x90;
const UINT8: u8 = 0xCC;
const BIN8: u8 = 0xC4;
const BIN16: u8 = 0xC5;
const BIN32: u8 = 0xC6;
const STR8: u8 = 0xD9;
const FIXSTR: u8 = 0xA0;
const POSITIVE_FIXINT_MAX: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Sha256,
    #[default]
    Sha512,
}

impl DigestAlgorithm {
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// A decoded package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upp {
    Signed {
        uuid: Uuid,
        payload_type: u8,
        payload: Vec<u8>,
        signature: [u8; SIGNATURE_LEN],
    },
    Chained {
        uuid: Uuid,
        prev_signature: [u8; SIGNATURE_LEN],
        payload_type: u8,
        payload: Vec<u8>,
        signature: [u8; SIGNATURE_LEN],
    },
}

impl Upp {
    pub fn version(&self) -> u8 {
        match self {
            Upp::Signed { .. } => VERSION_SIGNED,
            Upp::Chained { .. } => VERSION_CHAINED,
        }
    }

    pub fn uuid(&self) -> &Uuid {
        match self {
            Upp::Signed { uuid, .. } | Upp::Chained { uuid, .. } => uuid,
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Upp::Signed { payload_type, .. } | Upp::Chained { payload_type, .. } => *payload_type,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Upp::Signed { payload, .. } | Upp::Chained { payload, .. } => payload,
        }
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        match self {
            Upp::Signed { signature, .. } | Upp::Chained { signature, .. } => signature,
        }
    }

    pub fn prev_signature(&self) -> Option<&[u8; SIGNATURE_LEN]> {
        match self {
            Upp::Signed { .. } => None,
            Upp::Chained { prev_signature, .. } => Some(prev_signature),
        }
    }
}

/// Produces raw `r || s` ECDSA P-256 signatures over a message
pub trait UppSigner {
    fn sign(&mut self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]>;
}

/// Signs with a key pair held by the secure element
pub struct SimSigner<'a> {
    element: &'a mut SecureElement,
    entry_id: String,
}

impl<'a> SimSigner<'a> {
    pub fn new(element: &'a mut SecureElement, entry_id: &str) -> Self {
        Self {
            element,
            entry_id: entry_id.to_string(),
        }
    }
}

impl UppSigner for SimSigner<'_> {
    fn sign(&mut self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        let raw = self
            .element
            .sign(&self.entry_id, message, SignMode::Plain, false)?;
        raw_signature(&raw)
    }
}

/// Signs with a P-256 key held in process memory
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// From a 32 byte secret scalar
    pub fn from_bytes(secret: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(secret).map_err(|e| SimError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.key.verifying_key()
    }

    /// Raw `x || y` public key
    pub fn public_key_raw(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.key.verifying_key().to_encoded_point(false);
        let mut raw = [0u8; PUBLIC_KEY_LEN];
        raw.copy_from_slice(&point.as_bytes()[1..]);
        raw
    }
}

impl UppSigner for LocalSigner {
    fn sign(&mut self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        let signature: Signature = self.key.sign(message);
        raw_signature(&signature.to_bytes())
    }
}

fn raw_signature(bytes: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    if bytes.len() != SIGNATURE_LEN {
        return Err(SimError::Crypto(format!(
            "expected {SIGNATURE_LEN} byte signature, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Builds, chains and verifies packages
pub struct ProtocolEngine {
    store: Arc<IdentityStore>,
    digest: DigestAlgorithm,
    backend: Option<(Uuid, VerifyingKey)>,
    logger: Arc<Logger>,
}

impl ProtocolEngine {
    pub fn new(store: Arc<IdentityStore>, logger: Arc<Logger>) -> Self {
        Self {
            store,
            digest: DigestAlgorithm::default(),
            backend: None,
            logger: Arc::new(logger.with_component(Component::Protocol)),
        }
    }

    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    /// Key used for packages signed by the backend itself
    pub fn with_backend_key(mut self, uuid: Uuid, raw_public_key: &[u8]) -> Result<Self> {
        self.backend = Some((uuid, verifying_key_from_raw(raw_public_key)?));
        Ok(self)
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn build_signed(
        &self,
        signer: &mut dyn UppSigner,
        uuid: &Uuid,
        payload: &[u8],
        payload_type: u8,
    ) -> Result<Vec<u8>> {
        let fields = vec![
            Field::Int(VERSION_SIGNED),
            Field::Bin(uuid.as_bytes().to_vec()),
            Field::Int(payload_type),
            Field::Bin(payload.to_vec()),
        ];
        let (message, _) = self.seal(signer, fields)?;
        self.logger
            .debug(format!("Signed package of {} bytes for {uuid}", message.len()));
        Ok(message)
    }

    /// Build a chained package and advance the chain of `uuid` to its signature
    pub fn build_chained(
        &self,
        signer: &mut dyn UppSigner,
        uuid: &Uuid,
        payload: &[u8],
        payload_type: u8,
    ) -> Result<Vec<u8>> {
        let prev = self.store.chain_state_for(uuid);
        let fields = vec![
            Field::Int(VERSION_CHAINED),
            Field::Bin(uuid.as_bytes().to_vec()),
            Field::Bin(prev.to_vec()),
            Field::Int(payload_type),
            Field::Bin(payload.to_vec()),
        ];
        let (message, signature) = self.seal(signer, fields)?;
        // advanced before the caller can attempt delivery
        self.store.advance_chain(uuid, &signature);
        self.logger
            .debug(format!("Chained package of {} bytes for {uuid}", message.len()));
        Ok(message)
    }

    fn seal(
        &self,
        signer: &mut dyn UppSigner,
        mut fields: Vec<Field>,
    ) -> Result<(Vec<u8>, [u8; SIGNATURE_LEN])> {
        fields.push(Field::Int(0));
        let mut unsigned = pack(&fields)?;
        unsigned.pop();
        let signature = signer.sign(&self.digest.digest(&unsigned))?;

        if let Some(last) = fields.last_mut() {
            *last = Field::Bin(signature.to_vec());
        }
        Ok((pack(&fields)?, signature))
    }

    /// Verify `message` as signed by `expected`.
    ///
    /// Bad signatures, unknown keys and foreign UUIDs are `Ok(false)`;
    /// structurally broken packages are errors.
    pub fn verify(&self, expected: &Uuid, message: &[u8]) -> Result<bool> {
        let parsed = parse(message)?;
        let signature_start = parsed.signature_offset;
        let Some(signature) = parsed.signature else {
            self.logger.warn("Package signature has the wrong length");
            return Ok(false);
        };
        if parsed.uuid != *expected {
            self.logger.warn(format!(
                "Package signed as {} while {expected} was expected",
                parsed.uuid
            ));
            return Ok(false);
        }
        let Some(key) = self.key_for(expected) else {
            self.logger
                .warn(format!("No verifying key known for {expected}"));
            return Ok(false);
        };
        let Ok(signature) = Signature::from_slice(&signature) else {
            return Ok(false);
        };
        let digest = self.digest.digest(&message[..signature_start]);
        Ok(key.verify(&digest, &signature).is_ok())
    }

    fn key_for(&self, uuid: &Uuid) -> Option<VerifyingKey> {
        self.store.verifying_key(uuid).or_else(|| {
            self.backend
                .as_ref()
                .filter(|(backend, _)| backend == uuid)
                .map(|(_, key)| key.clone())
        })
    }
}

/// Decode a package without checking its signature
pub fn decode(message: &[u8]) -> Result<Upp> {
    let parsed = parse(message)?;
    let signature = parsed
        .signature
        .ok_or_else(|| SimError::Framing("signature has the wrong length".to_string()))?;
    Ok(match parsed.prev_signature {
        None => Upp::Signed {
            uuid: parsed.uuid,
            payload_type: parsed.payload_type,
            payload: parsed.payload,
            signature,
        },
        Some(prev_signature) => Upp::Chained {
            uuid: parsed.uuid,
            prev_signature,
            payload_type: parsed.payload_type,
            payload: parsed.payload,
            signature,
        },
    })
}

enum Field {
    Int(u8),
    Bin(Vec<u8>),
}

fn pack(fields: &[Field]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.push(FIXARRAY | fields.len() as u8);
    for field in fields {
        match field {
            Field::Int(v) if *v <= POSITIVE_FIXINT_MAX => out.push(*v),
            Field::Int(v) => out.extend_from_slice(&[UINT8, *v]),
            Field::Bin(bytes) => pack_bin(&mut out, bytes)?,
        }
    }
    Ok(out)
}

fn pack_bin(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = bytes.len();
    if let Ok(n) = u8::try_from(len) {
        out.extend_from_slice(&[BIN8, n]);
    } else if let Ok(n) = u16::try_from(len) {
        out.push(BIN16);
        out.extend_from_slice(&n.to_be_bytes());
    } else if let Ok(n) = u32::try_from(len) {
        out.push(BIN32);
        out.extend_from_slice(&n.to_be_bytes());
    } else {
        return Err(SimError::Framing(format!("binary field of {len} bytes")));
    }
    out.extend_from_slice(bytes);
    Ok(())
}

struct Parsed {
    uuid: Uuid,
    prev_signature: Option<[u8; SIGNATURE_LEN]>,
    payload_type: u8,
    payload: Vec<u8>,
    signature: Option<[u8; SIGNATURE_LEN]>,
    signature_offset: usize,
}

fn parse(message: &[u8]) -> Result<Parsed> {
    if message.len() < MIN_MESSAGE_LEN {
        return Err(SimError::Framing(format!(
            "package of {} bytes is shorter than {MIN_MESSAGE_LEN}",
            message.len()
        )));
    }
    let chained = match message[1] {
        VERSION_SIGNED => false,
        VERSION_CHAINED => true,
        other => {
            return Err(SimError::Framing(format!(
                "unknown package version {other:#04X}"
            )))
        }
    };
    let expected_len = if chained { 6 } else { 5 };
    if message[0] != FIXARRAY | expected_len as u8 {
        return Err(SimError::Framing(format!(
            "array header {:#04X} does not match version {:#04X}",
            message[0], message[1]
        )));
    }

    let mut reader = Reader { bytes: message, pos: 2 };
    let uuid = Uuid::from_slice(reader.bin()?)
        .map_err(|_| SimError::Framing("uuid must be 16 bytes".to_string()))?;
    let prev_signature = if chained {
        Some(
            fixed_signature(reader.bin()?)
                .ok_or_else(|| SimError::Framing("previous signature must be 64 bytes".to_string()))?,
        )
    } else {
        None
    };
    let payload_type = reader.int()?;
    let payload = reader.bytes()?.to_vec();
    let signature_offset = reader.pos;
    let signature = fixed_signature(reader.bin()?);
    if reader.pos != message.len() {
        return Err(SimError::Framing(format!(
            "{} trailing bytes after package",
            message.len() - reader.pos
        )));
    }
    Ok(Parsed {
        uuid,
        prev_signature,
        payload_type,
        payload,
        signature,
        signature_offset,
    })
}

fn fixed_signature(bytes: &[u8]) -> Option<[u8; SIGNATURE_LEN]> {
    <[u8; SIGNATURE_LEN]>::try_from(bytes).ok()
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| SimError::Framing(format!("truncated package at offset {}", self.pos)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn length(&mut self, width: usize) -> Result<usize> {
        Ok(self
            .take(width)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }

    fn int(&mut self) -> Result<u8> {
        match self.byte()? {
            v @ 0..=POSITIVE_FIXINT_MAX => Ok(v),
            UINT8 => self.byte(),
            other => Err(SimError::Framing(format!(
                "expected small integer, found marker {other:#04X}"
            ))),
        }
    }

    fn bin(&mut self) -> Result<&'a [u8]> {
        let len = match self.byte()? {
            BIN8 => self.length(1)?,
            BIN16 => self.length(2)?,
            BIN32 => self.length(4)?,
            other => {
                return Err(SimError::Framing(format!(
                    "expected binary field, found marker {other:#04X}"
                )))
            }
        };
        self.take(len)
    }

    /// Binary or string field, for payloads written by older encoders
    fn bytes(&mut self) -> Result<&'a [u8]> {
        match self.bytes.get(self.pos).copied() {
            Some(m) if m & 0xE0 == FIXSTR => {
                self.pos += 1;
                self.take((m & 0x1F) as usize)
            }
            Some(STR8) => {
                self.pos += 1;
                let len = self.length(1)?;
                self.take(len)
            }
            _ => self.bin(),
        }
    }
}
