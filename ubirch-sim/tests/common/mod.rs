//! Simulated SIM applet, modem link and backend for the integration tests.
//!
//! The simulator speaks the same `AT+CSIM` / APDU dialect as the real
//! applet, keeps its keys as in-memory P-256 keys and records every command
//! line and data session event so tests can check ordering.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use ubirch_common::{Component, Logger};
use ubirch_sim::config::DEFAULT_APPLICATION_ID;
use ubirch_sim::tlv::{self, Tlv};
use ubirch_sim::{
    Backend, CommandChannel, DataSession, IdentityStore, LocalSigner, ProtocolEngine,
    SecureElement, SimConfig, SimError, Transport,
};
use uuid::Uuid;

pub const TEST_IMSI: &str = "901288001234567";

/// Command line limit of the simulated modem
pub const MODEM_MAX_COMMAND_LEN: usize = 1024;

/// Largest block the simulator announces per `61xx`
const RESPONSE_BLOCK: usize = 0x80;

pub fn create_test_logger(name: &str) -> Arc<Logger> {
    Arc::new(Logger::new_root(Component::Custom("Test"), name))
}

/// Config with instant retries, suitable for the simulator
pub fn test_config() -> SimConfig {
    SimConfig::new("sim-test")
        .with_retry_policy(3, 0)
        .with_command_timeout_ms(1000)
}

pub fn raw_public_key(key: &VerifyingKey) -> [u8; 64] {
    let point = key.to_encoded_point(false);
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&point.as_bytes()[1..]);
    raw
}

struct Entry {
    title: Vec<u8>,
    signing: Option<SigningKey>,
    public: Option<VerifyingKey>,
}

impl Entry {
    fn verifying_key(&self) -> Option<VerifyingKey> {
        self.public
            .clone()
            .or_else(|| self.signing.as_ref().map(|k| k.verifying_key().clone()))
    }
}

struct Operation {
    entry: String,
    mode: u8,
    data: Vec<u8>,
}

struct SimState {
    aid: Vec<u8>,
    imsi: String,
    imsi_failures: u32,
    select_failures: u32,
    suspend_failures: u32,
    pin: String,
    pin_retries: u8,
    authenticated: bool,
    selected: bool,
    entries: HashMap<String, Entry>,
    certificates: HashMap<String, Vec<u8>>,
    pending: Vec<u8>,
    store_buffer: Vec<u8>,
    sign: Option<Operation>,
    verify: Option<Operation>,
    commands: Vec<String>,
    events: Vec<&'static str>,
    presented_pins: Vec<String>,
}

/// Handle on a simulated SIM; clones share the same card
#[derive(Clone)]
pub struct SimulatedSim {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSim {
    pub fn new(pin: &str) -> Self {
        let state = SimState {
            aid: hex::decode(DEFAULT_APPLICATION_ID).unwrap(),
            imsi: TEST_IMSI.to_string(),
            imsi_failures: 0,
            select_failures: 0,
            suspend_failures: 0,
            pin: pin.to_string(),
            pin_retries: 3,
            authenticated: false,
            selected: false,
            entries: HashMap::new(),
            certificates: HashMap::new(),
            pending: Vec::new(),
            store_buffer: Vec::new(),
            sign: None,
            verify: None,
            commands: Vec::new(),
            events: Vec::new(),
            presented_pins: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Channel over the simulated modem, limited by `config.max_command_len`
    pub fn channel(&self, config: &SimConfig, logger: Arc<Logger>) -> CommandChannel {
        CommandChannel::from_config(
            Box::new(SimTransport {
                sim: self.clone(),
                max_len: MODEM_MAX_COMMAND_LEN,
            }),
            Box::new(SimSession { sim: self.clone() }),
            config,
            logger,
        )
        .unwrap()
    }

    pub fn element(&self, config: &SimConfig, logger: Arc<Logger>) -> SecureElement {
        let channel = self.channel(config, logger.clone());
        SecureElement::new(channel, config, logger).unwrap()
    }

    /// Reset the volatile state as a power cycle would
    pub fn power_cycle(&self) {
        let mut st = self.lock();
        st.authenticated = false;
        st.selected = false;
        st.pending.clear();
        st.sign = None;
        st.verify = None;
    }

    pub fn fail_imsi(&self, times: u32) {
        self.lock().imsi_failures = times;
    }

    /// The data session refuses to suspend the next `times` times
    pub fn fail_suspend(&self, times: u32) {
        self.lock().suspend_failures = times;
    }

    pub fn fail_select(&self, times: u32) {
        self.lock().select_failures = times;
    }

    pub fn set_certificate(&self, entry_id: &str, der: &[u8]) {
        self.lock()
            .certificates
            .insert(entry_id.to_string(), der.to_vec());
    }

    pub fn has_entry(&self, entry_id: &str) -> bool {
        self.lock().entries.contains_key(entry_id)
    }

    pub fn public_key(&self, entry_id: &str) -> Option<VerifyingKey> {
        self.lock()
            .entries
            .get(entry_id)
            .and_then(Entry::verifying_key)
    }

    pub fn pin_retries(&self) -> u8 {
        self.lock().pin_retries
    }

    pub fn presented_pins(&self) -> Vec<String> {
        self.lock().presented_pins.clone()
    }

    /// Every command line sent to the modem
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// APDUs (hex) of the `AT+CSIM` commands, in order
    pub fn apdus(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|c| c.strip_prefix("AT+CSIM="))
            .filter_map(|c| c.split_once(','))
            .map(|(_, q)| q.trim_matches('"').to_string())
            .collect()
    }

    /// `suspend`, `send` and `resume` events in order
    pub fn events(&self) -> Vec<&'static str> {
        self.lock().events.clone()
    }

    pub fn clear_log(&self) {
        let mut st = self.lock();
        st.commands.clear();
        st.events.clear();
    }
}

impl SimState {
    fn announce(&self) -> (Vec<u8>, u16) {
        if self.pending.is_empty() {
            (Vec::new(), 0x9000)
        } else {
            let n = self.pending.len().min(RESPONSE_BLOCK);
            (Vec::new(), 0x6100 | (n as u16 & 0xFF))
        }
    }

    fn queue(&mut self, data: Vec<u8>) -> (Vec<u8>, u16) {
        self.pending = data;
        self.announce()
    }

    fn take_pending(&mut self, le: usize) -> (Vec<u8>, u16) {
        if self.pending.is_empty() {
            return (Vec::new(), 0x6985);
        }
        let n = le.min(self.pending.len());
        let out: Vec<u8> = self.pending.drain(..n).collect();
        let (_, sw) = self.announce();
        (out, sw)
    }

    fn handle(&mut self, apdu: &[u8]) -> (Vec<u8>, u16) {
        if apdu.len() < 4 {
            return (Vec::new(), 0x6700);
        }
        let (ins, p1) = (apdu[1], apdu[2]);
        if ins == 0xC0 || (ins == 0xBA && p1 == 0x01) {
            let le = match apdu.get(4) {
                Some(0) | None => 256,
                Some(n) => *n as usize,
            };
            return self.take_pending(le);
        }
        let data: &[u8] = match apdu.get(4) {
            Some(&lc) => {
                if apdu.len() != 5 + lc as usize {
                    return (Vec::new(), 0x6700);
                }
                &apdu[5..]
            }
            None => &[],
        };
        self.pending.clear();

        match ins {
            0xA4 => self.select(data),
            0x20 => self.verify_pin(data),
            _ if !self.selected => (Vec::new(), 0x6985),
            0xB9 | 0xB5 | 0xBA if !self.authenticated => (Vec::new(), 0x6982),
            // chunked commands carry raw argument fragments
            0xD5 => self.store_key(p1, data),
            0xB6 => self.sign_update(p1, data),
            0xB8 => self.verify_update(p1, data),
            _ => {
                let Ok(fields) = tlv::decode_all(data) else {
                    return (Vec::new(), 0x6A80);
                };
                match ins {
                    0xA5 => self.entry_select(&fields),
                    0xE5 => self.entry_delete(&fields),
                    0xB9 => self.generate(&fields),
                    0xCB => self.get_key(&fields),
                    0xB5 => self.sign_init(p1, &fields),
                    0xB7 => self.verify_init(p1, &fields),
                    0xBA => self.csr(&fields),
                    0xCC => self.get_certificate(&fields),
                    _ => (Vec::new(), 0x6D00),
                }
            }
        }
    }

    fn select(&mut self, aid: &[u8]) -> (Vec<u8>, u16) {
        if self.select_failures > 0 {
            self.select_failures -= 1;
            return (Vec::new(), 0x6A82);
        }
        if aid != self.aid.as_slice() {
            return (Vec::new(), 0x6A82);
        }
        self.selected = true;
        (Vec::new(), 0x9000)
    }

    fn verify_pin(&mut self, data: &[u8]) -> (Vec<u8>, u16) {
        self.presented_pins
            .push(String::from_utf8_lossy(data).into_owned());
        if self.pin_retries == 0 {
            return (Vec::new(), 0x6983);
        }
        if data == self.pin.as_bytes() {
            self.pin_retries = 3;
            self.authenticated = true;
            return (Vec::new(), 0x9000);
        }
        self.pin_retries -= 1;
        self.authenticated = false;
        if self.pin_retries == 0 {
            (Vec::new(), 0x6983)
        } else {
            (Vec::new(), 0x63C0 | self.pin_retries as u16)
        }
    }

    fn entry_ids(fields: &[Tlv]) -> Vec<String> {
        fields
            .iter()
            .filter(|(t, _)| *t == tlv::TAG_ENTRY_ID)
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    fn first_entry_id(fields: &[Tlv]) -> Option<String> {
        Self::entry_ids(fields).into_iter().next()
    }

    fn entry_select(&mut self, fields: &[Tlv]) -> (Vec<u8>, u16) {
        let Some(id) = Self::first_entry_id(fields) else {
            return (Vec::new(), 0x6A80);
        };
        let Some(entry) = self.entries.get(&id) else {
            return (Vec::new(), 0x6A88);
        };
        let reply = tlv::encode_all(&[
            (tlv::TAG_ENTRY_ID, id.as_bytes().to_vec()),
            (tlv::TAG_ENTRY_TITLE, entry.title.clone()),
        ])
        .unwrap();
        self.queue(reply)
    }

    fn entry_delete(&mut self, fields: &[Tlv]) -> (Vec<u8>, u16) {
        let Some(id) = Self::first_entry_id(fields) else {
            return (Vec::new(), 0x6A80);
        };
        match self.entries.remove(&id) {
            Some(_) => (Vec::new(), 0x9000),
            None => (Vec::new(), 0x6A88),
        }
    }

    fn generate(&mut self, fields: &[Tlv]) -> (Vec<u8>, u16) {
        let ids = Self::entry_ids(fields);
        let Some(title) = tlv::find(fields, tlv::TAG_ENTRY_TITLE) else {
            return (Vec::new(), 0x6A80);
        };
        if ids.len() != 2 {
            return (Vec::new(), 0x6A80);
        }
        if ids.iter().any(|id| self.entries.contains_key(id)) {
            return (Vec::new(), 0x6A89);
        }
        let key = SigningKey::random(&mut OsRng);
        self.entries.insert(
            ids[0].clone(),
            Entry {
                title: title.to_vec(),
                signing: None,
                public: Some(key.verifying_key().clone()),
            },
        );
        self.entries.insert(
            ids[1].clone(),
            Entry {
                title: title.to_vec(),
                signing: Some(key),
                public: None,
            },
        );
        (Vec::new(), 0x9000)
    }

    fn store_key(&mut self, p1: u8, data: &[u8]) -> (Vec<u8>, u16) {
        self.store_buffer.extend_from_slice(data);
        if p1 != 0x80 {
            return (Vec::new(), 0x9000);
        }
        let buffer = std::mem::take(&mut self.store_buffer);
        let Ok(fields) = tlv::decode_all(&buffer) else {
            return (Vec::new(), 0x6A80);
        };
        let (Some(id), Some(title), Some(point)) = (
            Self::first_entry_id(&fields),
            tlv::find(&fields, tlv::TAG_ENTRY_TITLE),
            tlv::find(&fields, tlv::TAG_PUBLIC_KEY),
        ) else {
            return (Vec::new(), 0x6A80);
        };
        let Ok(public) = VerifyingKey::from_sec1_bytes(point) else {
            return (Vec::new(), 0x6A80);
        };
        self.entries.insert(
            id,
            Entry {
                title: title.to_vec(),
                signing: None,
                public: Some(public),
            },
        );
        (Vec::new(), 0x9000)
    }

    fn get_key(&mut self, fields: &[Tlv]) -> (Vec<u8>, u16) {
        let Some(id) = Self::first_entry_id(fields) else {
            return (Vec::new(), 0x6A80);
        };
        let Some(key) = self.entries.get(&id).and_then(Entry::verifying_key) else {
            return (Vec::new(), 0x6A88);
        };
        let point = key.to_encoded_point(false).as_bytes().to_vec();
        let reply = tlv::encode_all(&[
            (tlv::TAG_ENTRY_ID, id.into_bytes()),
            (tlv::TAG_PUBLIC_KEY, point),
        ])
        .unwrap();
        self.queue(reply)
    }

    fn sign_init(&mut self, p1: u8, fields: &[Tlv]) -> (Vec<u8>, u16) {
        let Some(id) = Self::first_entry_id(fields) else {
            return (Vec::new(), 0x6A80);
        };
        if !self
            .entries
            .get(&id)
            .is_some_and(|e| e.signing.is_some())
        {
            return (Vec::new(), 0x6A88);
        }
        self.sign = Some(Operation {
            entry: id,
            mode: p1,
            data: Vec::new(),
        });
        (Vec::new(), 0x9000)
    }

    fn sign_update(&mut self, p1: u8, data: &[u8]) -> (Vec<u8>, u16) {
        let Some(op) = self.sign.as_mut() else {
            return (Vec::new(), 0x6985);
        };
        op.data.extend_from_slice(data);
        if p1 != 0x80 {
            return (Vec::new(), 0x9000);
        }
        let Some(op) = self.sign.take() else {
            return (Vec::new(), 0x6985);
        };
        // only raw signatures are simulated
        if op.mode & 0x3F != 0x00 {
            return (Vec::new(), 0x6A86);
        }
        let Some(key) = self.entries.get(&op.entry).and_then(|e| e.signing.clone()) else {
            return (Vec::new(), 0x6A88);
        };
        let signature: Signature = key.sign(&op.data);
        self.queue(signature.to_bytes().to_vec())
    }

    fn verify_init(&mut self, p1: u8, fields: &[Tlv]) -> (Vec<u8>, u16) {
        let Some(id) = Self::first_entry_id(fields) else {
            return (Vec::new(), 0x6A80);
        };
        if !self.entries.contains_key(&id) {
            return (Vec::new(), 0x6A88);
        }
        self.verify = Some(Operation {
            entry: id,
            mode: p1,
            data: Vec::new(),
        });
        (Vec::new(), 0x9000)
    }

    fn verify_update(&mut self, p1: u8, data: &[u8]) -> (Vec<u8>, u16) {
        let Some(op) = self.verify.as_mut() else {
            return (Vec::new(), 0x6985);
        };
        op.data.extend_from_slice(data);
        if p1 != 0x80 {
            return (Vec::new(), 0x9000);
        }
        let Some(op) = self.verify.take() else {
            return (Vec::new(), 0x6985);
        };
        if op.mode != 0x00 || op.data.len() < 64 {
            return (Vec::new(), 0x6A86);
        }
        let Some(key) = self.entries.get(&op.entry).and_then(Entry::verifying_key) else {
            return (Vec::new(), 0x6A88);
        };
        let (message, raw) = op.data.split_at(op.data.len() - 64);
        let Ok(signature) = Signature::from_slice(raw) else {
            return (Vec::new(), 0x6988);
        };
        match key.verify(message, &signature) {
            Ok(()) => (Vec::new(), 0x9000),
            Err(_) => (Vec::new(), 0x6988),
        }
    }

    fn csr(&mut self, fields: &[Tlv]) -> (Vec<u8>, u16) {
        let (Some(keys), Some(subject)) = (
            tlv::find(fields, tlv::TAG_CSR_KEYS),
            tlv::find(fields, tlv::TAG_CSR_SUBJECT),
        ) else {
            return (Vec::new(), 0x6A80);
        };
        let (Ok(keys), Ok(subject)) = (tlv::decode_all(keys), tlv::decode_all(subject)) else {
            return (Vec::new(), 0x6A80);
        };
        let Some(key) = Self::first_entry_id(&keys)
            .and_then(|id| self.entries.get(&id))
            .and_then(Entry::verifying_key)
        else {
            return (Vec::new(), 0x6A88);
        };
        let cn = tlv::find(&subject, tlv::TAG_SUBJECT_COMMON_NAME).unwrap_or_default();

        let mut der = b"CSR:".to_vec();
        der.extend_from_slice(cn);
        der.extend_from_slice(&raw_public_key(&key));
        der.resize(300, 0xAB);
        self.queue(der)
    }

    fn get_certificate(&mut self, fields: &[Tlv]) -> (Vec<u8>, u16) {
        let Some(id) = Self::first_entry_id(fields) else {
            return (Vec::new(), 0x6A80);
        };
        let Some(cert) = self.certificates.get(&id).cloned() else {
            return (Vec::new(), 0x6A88);
        };
        let reply = tlv::encode_all(&[(tlv::TAG_CERTIFICATE, cert)]).unwrap();
        self.queue(reply)
    }
}

/// Modem side of the simulator
pub struct SimTransport {
    sim: SimulatedSim,
    max_len: usize,
}

impl Transport for SimTransport {
    fn max_command_len(&self) -> usize {
        self.max_len
    }

    fn send(&mut self, command: &str, _timeout: Duration) -> ubirch_sim::Result<String> {
        let mut st = self.sim.lock();
        st.commands.push(command.to_string());
        st.events.push("send");
        if command.len() > self.max_len {
            return Ok("\r\nERROR\r\n".to_string());
        }
        if command == "AT+CIMI" {
            if st.imsi_failures > 0 {
                st.imsi_failures -= 1;
                return Ok("\r\n+CME ERROR: 10\r\n".to_string());
            }
            return Ok(format!("\r\n{}\r\n\r\nOK\r\n", st.imsi));
        }
        let Some((len, quoted)) = command
            .strip_prefix("AT+CSIM=")
            .and_then(|rest| rest.split_once(','))
        else {
            return Ok("\r\nERROR\r\n".to_string());
        };
        let apdu_hex = quoted.trim_matches('"');
        if len.parse::<usize>().ok() != Some(apdu_hex.len()) {
            return Ok("\r\nERROR\r\n".to_string());
        }
        let apdu = hex::decode(apdu_hex)
            .map_err(|e| SimError::Transport(format!("simulator got bad hex: {e}")))?;
        let (data, sw) = st.handle(&apdu);
        let body = format!("{}{:04X}", hex::encode_upper(&data), sw);
        Ok(format!("\r\n+CSIM: {},\"{}\"\r\n\r\nOK\r\n", body.len(), body))
    }
}

pub struct SimSession {
    sim: SimulatedSim,
}

impl DataSession for SimSession {
    fn suspend(&mut self) -> ubirch_sim::Result<()> {
        let mut st = self.sim.lock();
        if st.suspend_failures > 0 {
            st.suspend_failures -= 1;
            return Err(SimError::Transport("data session busy".to_string()));
        }
        st.events.push("suspend");
        Ok(())
    }

    fn resume(&mut self) -> ubirch_sim::Result<()> {
        self.sim.lock().events.push("resume");
        Ok(())
    }
}

/// Every `send` happens while the data session is suspended
pub fn assert_exclusive(events: &[&str]) {
    let mut suspended = false;
    for event in events {
        match *event {
            "suspend" => {
                assert!(!suspended, "nested suspend in {events:?}");
                suspended = true;
            }
            "resume" => {
                assert!(suspended, "resume without suspend in {events:?}");
                suspended = false;
            }
            _ => assert!(suspended, "command sent with data session active in {events:?}"),
        }
    }
    assert!(!suspended, "data session left suspended in {events:?}");
}

struct BackendState {
    pin: String,
    bootstrap_calls: u32,
    registrations: Vec<Vec<u8>>,
    delivered: Vec<Vec<u8>>,
    fail_sends: bool,
    plain_response: Option<Vec<u8>>,
}

/// Backend that hands out a PIN, records registrations and answers
/// every package with one signed by its own key
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
    secret: Vec<u8>,
    pub uuid: Uuid,
}

impl FakeBackend {
    pub fn new(pin: &str) -> Self {
        let secret = SigningKey::random(&mut OsRng).to_bytes().to_vec();
        Self {
            state: Arc::new(Mutex::new(BackendState {
                pin: pin.to_string(),
                bootstrap_calls: 0,
                registrations: Vec::new(),
                delivered: Vec::new(),
                fail_sends: false,
                plain_response: None,
            })),
            secret,
            uuid: Uuid::new_v4(),
        }
    }

    fn signer(&self) -> LocalSigner {
        LocalSigner::from_bytes(&self.secret).unwrap()
    }

    pub fn public_key(&self) -> [u8; 64] {
        self.signer().public_key_raw()
    }

    pub fn set_pin(&self, pin: &str) {
        self.state.lock().unwrap().pin = pin.to_string();
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    /// Answer deliveries with `body` instead of a signed package
    pub fn respond_with(&self, body: Option<&[u8]>) {
        self.state.lock().unwrap().plain_response = body.map(<[u8]>::to_vec);
    }

    pub fn bootstrap_calls(&self) -> u32 {
        self.state.lock().unwrap().bootstrap_calls
    }

    pub fn registrations(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().registrations.clone()
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().delivered.clone()
    }
}

impl Backend for FakeBackend {
    fn bootstrap(&mut self, _imsi: &str) -> ubirch_sim::Result<String> {
        let mut st = self.state.lock().unwrap();
        st.bootstrap_calls += 1;
        Ok(st.pin.clone())
    }

    fn register(&mut self, record: &[u8]) -> ubirch_sim::Result<()> {
        self.state
            .lock()
            .unwrap()
            .registrations
            .push(record.to_vec());
        Ok(())
    }

    fn send(&mut self, upp: &[u8]) -> ubirch_sim::Result<Vec<u8>> {
        {
            let mut st = self.state.lock().unwrap();
            if st.fail_sends {
                return Err(SimError::Backend("service unavailable".to_string()));
            }
            st.delivered.push(upp.to_vec());
            if let Some(body) = &st.plain_response {
                return Ok(body.clone());
            }
        }
        let logger = create_test_logger("backend");
        let engine = ProtocolEngine::new(Arc::new(IdentityStore::new(logger.clone())), logger);
        let mut signer = self.signer();
        engine.build_signed(&mut signer, &self.uuid, &Sha512::digest(upp), 0x00)
    }

    fn verify(&mut self, hash: &[u8]) -> ubirch_sim::Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .delivered
            .iter()
            .any(|upp| Sha512::digest(upp).as_slice() == hash))
    }
}
