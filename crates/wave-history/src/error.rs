//! Error types for delta history and reconciliation.

use thiserror::Error;
use wave_core::{HashedVersion, StatusCode};

/// Errors raised by a [`DeltaHistory`](crate::DeltaHistory).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("Unknown version: {0}")]
    UnknownVersion(HashedVersion),

    #[error("No signature recorded at version {0}")]
    UnknownVersionNumber(u64),

    #[error("A record already starts at version {0}")]
    Duplicate(u64),

    #[error("Record does not chain: expected {expected}, found {found}")]
    BrokenChain {
        expected: HashedVersion,
        found: HashedVersion,
    },

    #[error("Record does not advance the version: {applied_at} -> {resulting}")]
    NonIncreasing { applied_at: u64, resulting: u64 },

    #[error("Invalid range: {start} > {end}")]
    InvalidRange { start: u64, end: u64 },
}

/// Errors raised by a [`Transformer`](crate::Transformer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Operations cannot be transformed: {0}")]
    Incompatible(String),

    #[error("Transform changed the operation count from {before} to {after}")]
    CountChanged { before: usize, after: usize },
}

/// Errors raised while reconciling a client delta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Delta has no operations")]
    EmptyDelta,

    #[error("Target version {target} is ahead of the current version {current}")]
    FutureVersion {
        target: HashedVersion,
        current: HashedVersion,
    },

    #[error("Target version {0} is not a known version of this wavelet")]
    UnknownVersion(HashedVersion),

    #[error("Target version hash mismatch: client has {client}, history has {history}")]
    HashMismatch {
        client: HashedVersion,
        history: HashedVersion,
    },

    #[error("History has a gap after version {reached}")]
    HistoryGap { reached: u64 },

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Delta encoding failed: {0}")]
    Encoding(String),
}

impl ReconcileError {
    /// Wire status reported to the submitting client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReconcileError::EmptyDelta | ReconcileError::Transform(_) => StatusCode::InvalidOperation,
            ReconcileError::FutureVersion { .. }
            | ReconcileError::UnknownVersion(_)
            | ReconcileError::HashMismatch { .. } => StatusCode::VersionError,
            ReconcileError::History(HistoryError::UnknownVersion(_))
            | ReconcileError::History(HistoryError::UnknownVersionNumber(_)) => StatusCode::TooOld,
            ReconcileError::HistoryGap { .. }
            | ReconcileError::History(_)
            | ReconcileError::Encoding(_) => StatusCode::InternalError,
        }
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Encoding(err.to_string())
    }
}
