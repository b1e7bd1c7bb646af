//! Error types for the SDK.

use thiserror::Error;
use wave_channel::ServiceError;
use wave_core::WaveletId;
use wave_fragments::FragmentError;

/// Error type for SDK operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    /// The wavelet has no open channel on this client.
    #[error("Wavelet not open: {0}")]
    NotOpen(WaveletId),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Fragment(#[from] FragmentError),

    /// The client was shut down or its session ended.
    #[error("Client closed")]
    Closed,
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
