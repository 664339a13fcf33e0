//! Tag-length-value argument encoding used by every SIM applet command.
//!
//! Tags are a single byte. The length is a single byte for values up to
//! `0xFF` bytes and `0x82 HI LO` otherwise. The applet reads a `0x82` length
//! byte as the long-form prefix, so a value of exactly `0x82` bytes is also
//! written in long form to keep decoding unambiguous.

use crate::error::{Result, SimError};

/// Long-form length prefix (two length bytes follow)
pub const LONG_LENGTH_PREFIX: u8 = 0x82;

/// Key or certificate entry identifier
pub const TAG_ENTRY_ID: u8 = 0xC4;
/// Entry title (the device UUID)
pub const TAG_ENTRY_TITLE: u8 = 0xC0;
/// Key type
pub const TAG_KEY_TYPE: u8 = 0xC1;
/// Key length
pub const TAG_KEY_LENGTH: u8 = 0xC2;
/// Raw public key value
pub const TAG_PUBLIC_KEY: u8 = 0xC3;
/// Signature / verification algorithm
pub const TAG_ALGORITHM: u8 = 0xD0;
/// Certificate payload
pub const TAG_CERTIFICATE: u8 = 0xC5;
/// CSR version
pub const TAG_CSR_VERSION: u8 = 0xD3;
/// CSR key references (public and private entry ids)
pub const TAG_CSR_KEYS: u8 = 0xE7;
/// CSR subject (constructed)
pub const TAG_CSR_SUBJECT: u8 = 0xE8;
/// Subject attribute tags inside [`TAG_CSR_SUBJECT`]
pub const TAG_SUBJECT_COUNTRY: u8 = 0xD4;
pub const TAG_SUBJECT_STATE: u8 = 0xD5;
pub const TAG_SUBJECT_LOCALITY: u8 = 0xD6;
pub const TAG_SUBJECT_ORGANIZATION: u8 = 0xD7;
pub const TAG_SUBJECT_ORGANIZATIONAL_UNIT: u8 = 0xD8;
pub const TAG_SUBJECT_COMMON_NAME: u8 = 0xD9;

/// A decoded (tag, value) pair
pub type Tlv = (u8, Vec<u8>);

/// Encode a single tag-value pair
pub fn encode(tag: u8, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + 4);
    out.push(tag);
    out.extend(encode_length(data.len())?);
    out.extend_from_slice(data);
    Ok(out)
}

fn encode_length(len: usize) -> Result<Vec<u8>> {
    match len {
        0..=0xFF if len != LONG_LENGTH_PREFIX as usize => Ok(vec![len as u8]),
        0..=0xFFFF => Ok(vec![LONG_LENGTH_PREFIX, (len >> 8) as u8, len as u8]),
        _ => Err(SimError::Framing(format!(
            "TLV value of {len} bytes exceeds the 0xFFFF limit"
        ))),
    }
}

/// Concatenate encoded entries in the given order
pub fn encode_all<T: AsRef<[u8]>>(entries: &[(u8, T)]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (tag, data) in entries {
        out.extend(encode(*tag, data.as_ref())?);
    }
    Ok(out)
}

/// Decode a concatenated TLV list; exact inverse of [`encode_all`]
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Tlv>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let tag = bytes[pos];
        pos += 1;

        let first = *bytes
            .get(pos)
            .ok_or_else(|| SimError::Framing(format!("missing length for tag {tag:02X}")))?;
        pos += 1;
        let len = if first == LONG_LENGTH_PREFIX {
            let long = bytes.get(pos..pos + 2).ok_or_else(|| {
                SimError::Framing(format!("truncated long length for tag {tag:02X}"))
            })?;
            pos += 2;
            u16::from_be_bytes([long[0], long[1]]) as usize
        } else {
            first as usize
        };

        let remaining = bytes.len() - pos;
        if len > remaining {
            return Err(SimError::Framing(format!(
                "tag {tag:02X} declares {len} bytes but only {remaining} remain"
            )));
        }
        entries.push((tag, bytes[pos..pos + len].to_vec()));
        pos += len;
    }
    Ok(entries)
}

/// First value stored under `tag`
pub fn find(entries: &[Tlv], tag: u8) -> Option<&[u8]> {
    entries
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, value)| value.as_slice())
}

/// Builder for command argument lists; preserves insertion order
#[derive(Debug, Default)]
pub struct TlvBuilder {
    entries: Vec<(u8, Vec<u8>)>,
}

impl TlvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a primitive entry
    pub fn add(mut self, tag: u8, value: impl AsRef<[u8]>) -> Self {
        self.entries.push((tag, value.as_ref().to_vec()));
        self
    }

    /// Add an entry only when a value is present
    pub fn add_opt(self, tag: u8, value: Option<impl AsRef<[u8]>>) -> Self {
        match value {
            Some(v) => self.add(tag, v),
            None => self,
        }
    }

    pub fn build(self) -> Result<Vec<u8>> {
        encode_all(&self.entries)
    }

    /// Encoded arguments as uppercase hex, ready for a command template
    pub fn build_hex(self) -> Result<String> {
        Ok(hex::encode_upper(self.build()?))
    }
}
