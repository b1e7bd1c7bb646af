//! Error types for the server.

use thiserror::Error;
use wave_core::WaveletId;
use wave_history::ReconcileError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown wavelet: {0}")]
    UnknownWavelet(WaveletId),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
