//! # simlink-core
//!
//! Wire-level building blocks shared by the bridge and optimizer clients:
//! - Envelope framing and the binary codec
//! - Payload schema (snapshots, commands, heartbeats, errors, acks)
//! - Error taxonomy and wire error codes
//! - Bridge configuration and config providers

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod schema;

pub use codec::{decode, encode, read_frame_from, write_frame_to};
pub use config::{
    ADDRESS_VAR, BridgeConfig, ConfigProvider, EndpointConfig, EnvOverrides, JsonFileConfig,
    OptimizerProcessConfig, ReconnectConfig, SocketRole, StaticConfig,
};
pub use endpoint::Endpoint;
pub use envelope::{Envelope, EnvelopeKind, PROTOCOL_VERSION, SUPPORTED_VERSIONS};
pub use error::{
    DecodeError, OverflowError, Result, SimLinkError, TransportError, ValidationError, error_codes,
};
pub use schema::{
    AckPayload, Action, Command, EntityId, EntityState, ErrorPayload, HeartbeatPayload,
    ParamValue, Snapshot,
};
