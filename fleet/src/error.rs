//! Fleet error types.
//!
//! Malformed input, transport failures, registry collisions and setup
//! mistakes are all returned as values; nothing here aborts the process on a
//! peer's bad bytes.

use thiserror::Error;

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Looper error: {0}")]
    Looper(#[from] LooperError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Wire framing errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ends before the declared header or body; keep the bytes and
    /// retry once more data arrives.
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("body decode failed: {0}")]
    Body(#[from] bincode::Error),
}

impl CodecError {
    /// True when more input could turn this into a successful decode.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Incomplete { .. })
    }
}

/// NodeAddress / NodePath parse errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty node path")]
    EmptyPath,

    #[error("malformed node segment '{0}', expected name@host:port")]
    MalformedSegment(String),

    #[error("invalid port in '{0}'")]
    InvalidPort(String),
}

/// Command registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command '{name}' has the same dispatch id {id:#010x} as '{existing}'")]
    Collision {
        name: String,
        existing: String,
        id: u32,
    },

    #[error("command '{0}' is already registered")]
    Duplicate(String),

    #[error("no command registered for dispatch id {0:#010x}")]
    UnknownCommand(u32),

    #[error("command '{0}' is not registered")]
    UnknownName(String),
}

/// Socket errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket has no bind address")]
    NotBound,

    #[error("socket has no connected peers")]
    NoPeers,

    #[error("local-state messages never leave the process")]
    LocalOnly,

    #[error("socket is closed")]
    Closed,

    #[error("connect to {peer} failed: {source}")]
    Connect {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("outbound queue to {peer} is full")]
    Backlogged { peer: String },

    #[error("connection to {peer} was lost")]
    ConnectionLost { peer: String },

    #[error("write to {peer} timed out after {timeout:?}")]
    WriteTimeout {
        peer: String,
        timeout: std::time::Duration,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Message looper errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LooperError {
    #[error("looper is closed")]
    Closed,

    #[error("looper mailbox is full")]
    Full,

    #[error("event loop is already running")]
    AlreadyRunning,

    #[error("interval period must be non-zero")]
    ZeroPeriod,
}

/// Setup-time configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
