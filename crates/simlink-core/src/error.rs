//! Error types for simlink

use thiserror::Error;

/// Result type for simlink operations
pub type Result<T> = std::result::Result<T, SimLinkError>;

/// Top-level simlink error
#[derive(Debug, Error)]
pub enum SimLinkError {
    /// Socket could not be bound or connected at startup
    #[error("Initialization failed: {0}")]
    FatalInit(String),

    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Malformed wire data
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Socket I/O failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Peer violated the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Expected message did not arrive in time
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for SimLinkError {
    fn from(err: serde_json::Error) -> Self {
        SimLinkError::Config(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SimLinkError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        SimLinkError::Serialization(err.to_string())
    }
}

/// Failure to turn a byte frame into an [`Envelope`](crate::Envelope)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame is shorter than its header or its declared length
    #[error("Truncated frame: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Declared length exceeds the frame limit
    #[error("Frame too large: {0} bytes")]
    Oversized(usize),

    /// Schema version is not one this build speaks
    #[error("Unsupported schema version {found}")]
    VersionMismatch { found: u32 },

    /// Kind byte or payload failed schema validation
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),
}

/// A well-formed command that cannot be applied to the current simulation state
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Unknown action")]
    UnknownAction,

    #[error("Action {0} not supported by this simulation")]
    Unsupported(String),

    #[error("Target tick {target} already elapsed (current tick {current})")]
    TargetTickElapsed { target: u64, current: u64 },

    #[error("Unknown entity {0}")]
    UnknownEntity(u64),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// The host refused the command while applying it
    #[error("Rejected by simulation: {0}")]
    Rejected(String),
}

impl ValidationError {
    /// Wire error code carried in the error envelope
    pub fn code(&self) -> i32 {
        match self {
            ValidationError::UnknownAction | ValidationError::Unsupported(_) => {
                error_codes::UNKNOWN_ACTION
            }
            ValidationError::TargetTickElapsed { .. } => error_codes::TARGET_TICK_ELAPSED,
            ValidationError::UnknownEntity(_) => error_codes::UNKNOWN_ENTITY,
            ValidationError::InvalidParameter { .. } => error_codes::INVALID_PARAMETER,
            ValidationError::Rejected(_) => error_codes::REJECTED,
        }
    }
}

/// Socket-level failure
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {address} failed: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Bind on {address} failed: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Read failed: {0}")]
    Read(std::io::Error),

    #[error("Write failed: {0}")]
    Write(std::io::Error),

    #[error("Connection closed by peer")]
    Closed,

    /// Stream framing lost; the connection cannot resynchronise
    #[error("Framing error: {0}")]
    Framing(DecodeError),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// A bounded queue was full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{queue} queue full (capacity {capacity})")]
pub struct OverflowError {
    pub queue: &'static str,
    pub capacity: usize,
}

/// Error codes carried in `Error` envelopes
pub mod error_codes {
    pub const CORRUPT_PAYLOAD: i32 = -32700;
    pub const VERSION_MISMATCH: i32 = -32001;
    pub const HANDSHAKE_REQUIRED: i32 = -32002;
    pub const INBOUND_OVERFLOW: i32 = -32003;
    pub const SESSION_CLOSED: i32 = -32004;
    pub const UNKNOWN_ACTION: i32 = -32010;
    pub const TARGET_TICK_ELAPSED: i32 = -32011;
    pub const UNKNOWN_ENTITY: i32 = -32012;
    pub const INVALID_PARAMETER: i32 = -32013;
    pub const REJECTED: i32 = -32014;
}
