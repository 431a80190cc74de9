//! Error types shared by the relay and the client.

use thiserror::Error;

/// A decoding stage failed. Never surfaced to a sender: the codec falls back
/// to the next form and finally to a `System` envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a structured envelope: {0}")]
    NotStructured(#[from] serde_json::Error),

    #[error("envelope has an empty sender")]
    EmptySender,

    #[error("text has no `sender:` delimiter")]
    MissingDelimiter,
}

/// Delivery to a single recipient failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendFailure {
    #[error("recipient connection is closed")]
    Closed,

    #[error("recipient outbound buffer is full")]
    BufferFull,

    #[error("write to recipient timed out")]
    Timeout,

    #[error("transport write failed: {0}")]
    Transport(String),
}

/// Failures reported to the client's user surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("cannot open a connection to {target}: {reason}")]
    TransportConstruction { target: String, reason: String },

    #[error("reconnection failed after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("not connected to a relay")]
    NotConnected,

    #[error("message body cannot be empty")]
    EmptyMessage,

    #[error("name and server cannot change while a session is active")]
    IdentityLocked,

    #[error("enter a name and a server address first")]
    NotReady,
}
