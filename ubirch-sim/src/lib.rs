//! ubirch SIM: trust layer for sensor nodes whose keys live in a SIM applet

pub mod channel;
pub mod config;
pub mod element;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod protocol;
pub mod provisioning;
pub mod registration;
pub mod tlv;

pub use error::{ErrorCode, ErrorKind, Result, SimError};

pub use channel::{
    ChannelGuard, ChunkedExchange, ChunkedTemplate, CommandChannel, CommandResult,
    CommandTemplate, DataSession, NoDataSession, Status, Transport,
};

pub use config::SimConfig;

pub use element::{CsrSubject, SecureElement, SignMode};

pub use identity::{IdentityStore, KeyEntry, KeyRole};

pub use protocol::{decode, DigestAlgorithm, LocalSigner, ProtocolEngine, SimSigner, Upp, UppSigner};

pub use provisioning::{
    Backend, FilePinStore, MemoryPinStore, PinStore, ProvisioningFailure, ProvisioningFlow,
    ProvisioningState, Recovery, SendOutcome,
};

pub use registration::{KeyRegistration, PubKeyInfo, RegistrationRecord};
