//! The framed, versioned unit of wire communication

use crate::error::{DecodeError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Schema version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Every schema version this build can decode
pub const SUPPORTED_VERSIONS: &[u32] = &[PROTOCOL_VERSION];

/// What an envelope's payload contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Snapshot,
    Command,
    Heartbeat,
    Error,
    Ack,
}

impl EnvelopeKind {
    /// Wire tag
    pub fn as_u8(self) -> u8 {
        match self {
            EnvelopeKind::Snapshot => 0,
            EnvelopeKind::Command => 1,
            EnvelopeKind::Heartbeat => 2,
            EnvelopeKind::Error => 3,
            EnvelopeKind::Ack => 4,
        }
    }

    /// Parse a wire tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EnvelopeKind::Snapshot),
            1 => Some(EnvelopeKind::Command),
            2 => Some(EnvelopeKind::Heartbeat),
            3 => Some(EnvelopeKind::Error),
            4 => Some(EnvelopeKind::Ack),
            _ => None,
        }
    }
}

/// Header fields plus an opaque, schema-encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u32,
    pub kind: EnvelopeKind,
    pub correlation_id: u64,
    /// Stamped by the sending connection; strictly increasing per direction
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an envelope around a serialized payload. The sequence is left at
    /// zero for the connection writer to stamp.
    pub fn seal<T: Serialize>(kind: EnvelopeKind, correlation_id: u64, payload: &T) -> Result<Self> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            kind,
            correlation_id,
            sequence: 0,
            payload: encode_payload(payload)?,
        })
    }

    /// Deserialize the payload
    pub fn open<T: DeserializeOwned>(&self) -> std::result::Result<T, DecodeError> {
        decode_payload(&self.payload)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// Encode a payload as named-field MessagePack
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(payload)?)
}

/// Decode a MessagePack payload
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> std::result::Result<T, DecodeError> {
    rmp_serde::from_slice(bytes).map_err(|e| DecodeError::CorruptPayload(e.to_string()))
}
