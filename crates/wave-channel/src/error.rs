//! Error types for the channel layer.

use thiserror::Error;
use wave_core::ReturnStatus;

/// Malformed or unrecognised wire input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// Low-level link failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Link closed")]
    Closed,
}

/// Errors surfaced by [`TransportChannel`](crate::TransportChannel) calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was shut down or its session ended.
    #[error("Channel closed")]
    Closed,

    /// The link dropped after the request was written; the reply is lost.
    #[error("Connection lost before the response arrived")]
    Disconnected,

    /// The server terminated the session.
    #[error("Session finished: {0}")]
    Finished(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors surfaced by [`ViewService`](crate::ViewService) calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A well-formed response carrying a non-OK status.
    #[error("Request failed: {0}")]
    Status(ReturnStatus),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Stream ended before it was opened")]
    StreamEnded,
}

pub type Result<T> = std::result::Result<T, ServiceError>;
