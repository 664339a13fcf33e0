//! Identity store: device names, key entries and signature chain state.
//!
//! The store is shared between the provisioning flow and the protocol engine
//! as an `Arc<IdentityStore>`; all state sits behind one mutex so a chain
//! read and its update never interleave with another writer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use p256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};
use ubirch_common::{Component, Logger};
use uuid::Uuid;

use crate::error::{Result, SimError};
use crate::persistence::{read_if_exists, write_atomically};

/// Prefix of the private twin of every key entry
pub const PRIVATE_ENTRY_PREFIX: &str = "_";

/// Longest entry id the applet accepts, prefix included
pub const MAX_ENTRY_ID_LEN: usize = 32;

/// Raw P-256 signature (`r || s`) and raw public key (`x || y`) length
pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 64;

/// Chain state of a UUID that has not signed a chained message yet
pub const ZERO_SIGNATURE: [u8; SIGNATURE_LEN] = [0u8; SIGNATURE_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyRole {
    Public,
    Private,
}

/// One key slot on the secure element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub entry_id: String,
    pub title: Uuid,
    pub role: KeyRole,
}

impl KeyEntry {
    pub fn public(entry_id: &str, title: Uuid) -> Result<Self> {
        validate_entry_id(entry_id)?;
        Ok(Self {
            entry_id: entry_id.to_string(),
            title,
            role: KeyRole::Public,
        })
    }

    /// The private twin of a public entry
    pub fn private_twin(&self) -> Self {
        Self {
            entry_id: private_entry_id(&self.entry_id),
            title: self.title,
            role: KeyRole::Private,
        }
    }
}

pub fn private_entry_id(entry_id: &str) -> String {
    format!("{PRIVATE_ENTRY_PREFIX}{entry_id}")
}

/// A public entry id must leave room for the private prefix
pub fn validate_entry_id(entry_id: &str) -> Result<()> {
    if entry_id.is_empty() {
        return Err(SimError::InvalidKey("empty entry id".to_string()));
    }
    if entry_id.starts_with(PRIVATE_ENTRY_PREFIX) {
        return Err(SimError::InvalidKey(format!(
            "entry id {entry_id} uses the reserved prefix {PRIVATE_ENTRY_PREFIX}"
        )));
    }
    if entry_id.len() + PRIVATE_ENTRY_PREFIX.len() > MAX_ENTRY_ID_LEN {
        return Err(SimError::InvalidKey(format!(
            "entry id {entry_id} is longer than {} bytes",
            MAX_ENTRY_ID_LEN - PRIVATE_ENTRY_PREFIX.len()
        )));
    }
    Ok(())
}

/// Parse a raw `x || y` public key
pub fn verifying_key_from_raw(raw: &[u8]) -> Result<VerifyingKey> {
    if raw.len() != PUBLIC_KEY_LEN {
        return Err(SimError::InvalidKey(format!(
            "expected {PUBLIC_KEY_LEN} byte public key, got {}",
            raw.len()
        )));
    }
    let mut sec1 = Vec::with_capacity(PUBLIC_KEY_LEN + 1);
    sec1.push(0x04);
    sec1.extend_from_slice(raw);
    VerifyingKey::from_sec1_bytes(&sec1).map_err(|e| SimError::InvalidKey(e.to_string()))
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    names: HashMap<String, Uuid>,
    chains: HashMap<Uuid, Vec<u8>>,
    verifying_keys: HashMap<Uuid, Vec<u8>>,
}

impl StoreState {
    /// Reject snapshots whose chain or key entries have the wrong size
    fn check(&self) -> Result<()> {
        if let Some((uuid, sig)) = self.chains.iter().find(|(_, s)| s.len() != SIGNATURE_LEN) {
            return Err(SimError::Serialization(format!(
                "chain state of {uuid} is {} bytes, expected {SIGNATURE_LEN}",
                sig.len()
            )));
        }
        if let Some((uuid, key)) = self
            .verifying_keys
            .iter()
            .find(|(_, k)| k.len() != PUBLIC_KEY_LEN)
        {
            return Err(SimError::Serialization(format!(
                "verifying key of {uuid} is {} bytes, expected {PUBLIC_KEY_LEN}",
                key.len()
            )));
        }
        Ok(())
    }
}

pub struct IdentityStore {
    state: Mutex<StoreState>,
    logger: Arc<Logger>,
}

impl IdentityStore {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            logger: Arc::new(logger.with_component(Component::Identity)),
        }
    }

    /// Load the store from `path`; a missing file yields an empty store
    pub fn load(path: &Path, logger: Arc<Logger>) -> Result<Self> {
        let store = Self::new(logger);
        if let Some(bytes) = read_if_exists(path)? {
            let state: StoreState = bincode::deserialize(&bytes)?;
            state.check()?;
            store.logger.info(format!(
                "Loaded {} identities and {} chains from {}",
                state.names.len(),
                state.chains.len(),
                path.display()
            ));
            *store.lock() = state;
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(&*self.lock())?;
        write_atomically(path, &bytes)?;
        self.logger
            .debug(format!("Identity state saved to {}", path.display()));
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a device name to its UUID, replacing an earlier binding
    pub fn register(&self, name: &str, uuid: Uuid) -> Result<()> {
        validate_entry_id(name)?;
        if let Some(previous) = self.lock().names.insert(name.to_string(), uuid) {
            if previous != uuid {
                self.logger
                    .warn(format!("Identity {name} rebound from {previous} to {uuid}"));
            }
        }
        Ok(())
    }

    pub fn resolve_uuid(&self, name: &str) -> Result<Uuid> {
        self.lock()
            .names
            .get(name)
            .copied()
            .ok_or_else(|| SimError::KeyNotFound(format!("no identity registered as {name}")))
    }

    /// Public entry and private twin for a registered name
    pub fn key_entries(&self, name: &str) -> Result<(KeyEntry, KeyEntry)> {
        let public = KeyEntry::public(name, self.resolve_uuid(name)?)?;
        let private = public.private_twin();
        Ok((public, private))
    }

    /// Last chained signature of `uuid`, zeros before the first one
    pub fn chain_state_for(&self, uuid: &Uuid) -> [u8; SIGNATURE_LEN] {
        match self.lock().chains.get(uuid) {
            Some(sig) => sig.as_slice().try_into().unwrap_or_else(|_| {
                self.logger
                    .error(format!("Chain state of {uuid} is malformed, restarting it"));
                ZERO_SIGNATURE
            }),
            None => ZERO_SIGNATURE,
        }
    }

    pub fn advance_chain(&self, uuid: &Uuid, signature: &[u8; SIGNATURE_LEN]) {
        self.lock().chains.insert(*uuid, signature.to_vec());
    }

    pub fn reset_chain(&self, uuid: &Uuid) {
        if self.lock().chains.remove(uuid).is_some() {
            self.logger.info(format!("Signature chain of {uuid} reset"));
        }
    }

    /// Remember the public key that verifies messages signed as `uuid`
    pub fn register_verifying_key(&self, uuid: &Uuid, raw: &[u8]) -> Result<()> {
        verifying_key_from_raw(raw)?;
        self.lock().verifying_keys.insert(*uuid, raw.to_vec());
        Ok(())
    }

    pub fn verifying_key(&self, uuid: &Uuid) -> Option<VerifyingKey> {
        let raw = self.lock().verifying_keys.get(uuid).cloned()?;
        match verifying_key_from_raw(&raw) {
            Ok(key) => Some(key),
            Err(e) => {
                self.logger
                    .error(format!("Stored key of {uuid} is unusable: {e}"));
                None
            }
        }
    }
}
