//! Registration records handed to the backend once a device key exists.
//!
//! Without a certificate subject the record is a JSON key registration
//! signed by the device key itself. With a subject the SIM produces a CSR.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::Signature;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::element::CsrSubject;
use crate::error::{Result, SimError};
use crate::identity::{verifying_key_from_raw, PUBLIC_KEY_LEN};
use crate::protocol::UppSigner;

pub const ALGORITHM_ECDSA_P256: &str = "ecdsa-p256v1";

pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

/// Public key description signed by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubKeyInfo {
    pub algorithm: String,
    pub created: String,
    pub hw_device_id: String,
    pub pub_key: String,
    pub pub_key_id: String,
    pub valid_not_after: String,
    pub valid_not_before: String,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl PubKeyInfo {
    pub fn new(
        uuid: &Uuid,
        public_key: &[u8; PUBLIC_KEY_LEN],
        created: DateTime<Utc>,
        validity_days: i64,
    ) -> Result<Self> {
        if validity_days <= 0 {
            return Err(SimError::Config(format!(
                "validity of {validity_days} days"
            )));
        }
        let encoded = BASE64.encode(public_key);
        Ok(Self {
            algorithm: ALGORITHM_ECDSA_P256.to_string(),
            created: timestamp(created),
            hw_device_id: uuid.to_string(),
            pub_key: encoded.clone(),
            pub_key_id: encoded,
            valid_not_after: timestamp(created + Duration::days(validity_days)),
            valid_not_before: timestamp(created),
        })
    }

    pub fn public_key(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.pub_key)
            .map_err(|e| SimError::InvalidKey(format!("public key is not base64: {e}")))
    }
}

/// JSON key registration: the key info plus the device's signature over it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRegistration {
    pub pub_key_info: PubKeyInfo,
    pub signature: String,
}

impl KeyRegistration {
    pub fn sign(info: PubKeyInfo, signer: &mut dyn UppSigner) -> Result<Self> {
        let signed = serde_json::to_vec(&info)?;
        let signature = signer.sign(&signed)?;
        Ok(Self {
            pub_key_info: info,
            signature: BASE64.encode(signature),
        })
    }

    /// Check the signature against the key the registration announces
    pub fn verify(&self) -> Result<bool> {
        let key = verifying_key_from_raw(&self.pub_key_info.public_key()?)?;
        let Ok(raw) = BASE64.decode(&self.signature) else {
            return Ok(false);
        };
        let Ok(signature) = Signature::from_slice(&raw) else {
            return Ok(false);
        };
        let signed = serde_json::to_vec(&self.pub_key_info)?;
        Ok(key.verify(&signed, &signature).is_ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRecord {
    Key(KeyRegistration),
    Csr {
        uuid: Uuid,
        subject: CsrSubject,
        der: Vec<u8>,
    },
}

impl RegistrationRecord {
    pub fn uuid(&self) -> Result<Uuid> {
        match self {
            RegistrationRecord::Key(reg) => Uuid::parse_str(&reg.pub_key_info.hw_device_id)
                .map_err(|e| SimError::Serialization(format!("device id is not a UUID: {e}"))),
            RegistrationRecord::Csr { uuid, .. } => Ok(*uuid),
        }
    }

    /// Bytes sent to the registration endpoint
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            RegistrationRecord::Key(reg) => Ok(serde_json::to_vec(reg)?),
            RegistrationRecord::Csr { der, .. } => Ok(der.clone()),
        }
    }
}
