//! Error types for the guestlink bridge

use std::fmt;

use thiserror::Error;

use crate::bridge::ErrorEnvelope;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The transport refused or could not deliver a message
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    /// The sender was destroyed while the request was outstanding
    #[error("request sender destroyed")]
    SenderDestroyed,
    /// No response arrived within the configured request timeout
    #[error("request {request_type} (#{request_id}) timed out")]
    Timeout {
        request_type: String,
        request_id: u64,
    },
    /// The remote handler failed
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A handler was registered under a name the bridge reserves for itself
    #[error("request type {0:?} is reserved")]
    ReservedRequestType(String),
    /// A handler was registered twice under the same name
    #[error("handler for {0:?} registered twice")]
    DuplicateHandler(String),
    /// An origin string could not be parsed
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),
    /// Payload (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A receiver started listening outside a Tokio runtime
    #[error("no Tokio runtime to dispatch on: {0}")]
    RuntimeUnavailable(String),
}

impl BridgeError {
    /// Returns the remote error if this failure came from the other side's handler
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

/// A handler failure reconstructed on the calling side of the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub reason_code: Option<i64>,
}

impl RemoteError {
    /// Rebuild a typed error from its wire representation
    pub fn from_envelope(envelope: ErrorEnvelope) -> Self {
        Self {
            kind: envelope.kind,
            message: envelope.message,
            reason_code: envelope.reason_code,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason_code {
            Some(code) => write!(f, "{}: {} (reason {})", self.kind, self.message, code),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Convenience Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
