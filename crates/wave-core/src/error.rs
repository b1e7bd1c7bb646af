//! Error types for the core data model.

use thiserror::Error;

/// Errors raised while parsing or validating core values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid segment id: {0}")]
    InvalidSegmentId(String),

    #[error("Invalid wavelet id: {0}")]
    InvalidWaveletId(String),

    #[error("Invalid hex string: {0}")]
    InvalidHex(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
