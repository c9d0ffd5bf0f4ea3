//! Payload schema carried inside envelopes
//!
//! Payloads are MessagePack maps with PascalCase keys. Only the fields the
//! bridge itself interprets are fixed here; entity attributes and command
//! parameters are open-ended name/value maps.

use crate::error::{DecodeError, ValidationError};
use crate::envelope::{EnvelopeKind, decode_payload, encode_payload};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Simulation-assigned entity identifier
pub type EntityId = u64;

/// A single parameter or attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Reference to a simulation entity; checked for existence before apply
    Entity(EntityId),
    Vec3([f64; 3]),
}

impl ParamValue {
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            ParamValue::Entity(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_vec3(&self) -> Option<[f64; 3]> {
        match self {
            ParamValue::Vec3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Point-in-time copy of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntityState {
    pub id: EntityId,
    pub kind: String,
    pub position: [f64; 3],
    #[serde(default)]
    pub attributes: BTreeMap<String, ParamValue>,
}

impl EntityState {
    pub fn new(id: EntityId, kind: impl Into<String>, position: [f64; 3]) -> Self {
        Self {
            id,
            kind: kind.into(),
            position,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

/// Immutable, timestamped copy of simulation state sent to optimizers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    pub tick: u64,
    /// Unix time in milliseconds at capture
    pub timestamp: u64,
    pub entities: Vec<EntityState>,
    /// Hex SHA-256 over tick and entities
    pub state_hash: String,
}

impl Snapshot {
    /// Build a snapshot from entities already copied out of the simulation
    pub fn capture(tick: u64, timestamp: u64, entities: Vec<EntityState>) -> Self {
        let state_hash = state_hash(tick, &entities);
        Self {
            tick,
            timestamp,
            entities,
            state_hash,
        }
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.iter().find(|e| e.id == id)
    }
}

/// Determinism hash over a tick's entity list
pub fn state_hash(tick: u64, entities: &[EntityState]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tick.to_le_bytes());
    // Entity lists are plain data; encoding cannot fail
    if let Ok(bytes) = encode_payload(&entities) {
        hasher.update(&bytes);
    }
    hex::encode(hasher.finalize())
}

/// Mutation requested by an optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Move `Entity` to `Position`
    MoveEntity,
    /// Set attribute `Name` on `Entity` to `Value`
    SetAttribute,
    /// Remove `Entity` from the simulation
    RemoveEntity,
    /// Set world parameter `Name` (view distance, spawn caps, ...) to `Value`
    SetWorldParameter,
    /// Do nothing; useful for liveness and ordering checks
    Noop,
    /// Any action name this build does not know
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::MoveEntity => "MoveEntity",
            Action::SetAttribute => "SetAttribute",
            Action::RemoveEntity => "RemoveEntity",
            Action::SetWorldParameter => "SetWorldParameter",
            Action::Noop => "Noop",
            Action::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Inbound request to mutate simulation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Command {
    pub correlation_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tick: Option<u64>,
    pub action: Action,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
}

impl Command {
    pub fn new(correlation_id: u64, action: Action) -> Self {
        Self {
            correlation_id,
            target_tick: None,
            action,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn targeting(mut self, tick: u64) -> Self {
        self.target_tick = Some(tick);
        self
    }

    /// Every entity id referenced by a parameter
    pub fn referenced_entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.parameters.values().filter_map(ParamValue::as_entity)
    }

    /// Fetch a required parameter
    pub fn param(&self, name: &str) -> Result<&ParamValue, ValidationError> {
        self.parameters
            .get(name)
            .ok_or_else(|| ValidationError::InvalidParameter {
                name: name.to_string(),
                reason: "missing".into(),
            })
    }
}

/// Liveness and version negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeartbeatPayload {
    /// Name of the sending side
    pub agent: String,
    pub supported_versions: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<u64>,
}

/// Explicit error notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<u64>,
}

/// Acknowledgment that a command was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AckPayload {
    pub applied_tick: u64,
}

/// Check that `payload` is a valid instance of the schema type for `kind`
pub fn validate_payload(kind: EnvelopeKind, payload: &[u8]) -> Result<(), DecodeError> {
    match kind {
        EnvelopeKind::Snapshot => decode_payload::<Snapshot>(payload).map(|_| ()),
        EnvelopeKind::Command => decode_payload::<Command>(payload).map(|_| ()),
        EnvelopeKind::Heartbeat => decode_payload::<HeartbeatPayload>(payload).map(|_| ()),
        EnvelopeKind::Error => decode_payload::<ErrorPayload>(payload).map(|_| ()),
        EnvelopeKind::Ack => decode_payload::<AckPayload>(payload).map(|_| ()),
    }
}
