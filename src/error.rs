//! # Protocol Error Types
//!
//! Error taxonomy for the handshake: transport failures, short reads,
//! framing violations and KEM primitive failures.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The three messages exchanged during a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    PublicKey,
    Ciphertext,
    SharedSecret,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey => write!(f, "public key"),
            Self::Ciphertext => write!(f, "ciphertext"),
            Self::SharedSecret => write!(f, "shared secret"),
        }
    }
}

/// Operations exposed by the KEM capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KemOperation {
    KeyGeneration,
    Encapsulation,
    Decapsulation,
}

impl fmt::Display for KemOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyGeneration => write!(f, "key generation"),
            Self::Encapsulation => write!(f, "encapsulation"),
            Self::Decapsulation => write!(f, "decapsulation"),
        }
    }
}

/// Main error type for protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Socket-level failure (bind, accept, read, write)
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Connection establishment failed
    #[error("Could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Peer closed the stream before the expected byte count arrived
    #[error("Peer closed connection after {received} of {expected} bytes")]
    ShortRead { expected: usize, received: usize },

    /// A length prefix disagrees with the protocol constant
    #[error("Framing error in {message} message: declared length {declared}, expected {expected}")]
    Framing {
        message: MessageKind,
        declared: u16,
        expected: usize,
    },

    /// The KEM capability reported failure
    #[error("KEM {operation} failed: {reason}")]
    Primitive {
        operation: KemOperation,
        reason: String,
    },

    /// Read, write or connect deadline expired
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl ProtocolError {
    /// Shorthand for a primitive failure
    pub fn primitive(operation: KemOperation, reason: impl Into<String>) -> Self {
        Self::Primitive {
            operation,
            reason: reason.into(),
        }
    }

    /// Stable short label used in console reporting
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transport(_) | Self::Connect { .. } | Self::Timeout(_) => "transport",
            Self::ShortRead { .. } => "short-read",
            Self::Framing { .. } => "framing",
            Self::Primitive { .. } => "primitive",
            Self::Config(_) => "config",
            Self::InvalidStateTransition { .. } => "state",
        }
    }

    pub fn is_short_read(&self) -> bool {
        matches!(self, Self::ShortRead { .. })
    }
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<toml::de::Error> for ProtocolError {
    fn from(e: toml::de::Error) -> Self {
        ProtocolError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Config(e.to_string())
    }
}
