//! Error types for fragment scheduling.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// The scheduler was closed; it accepts no further work.
    #[error("Fragment scheduler is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, FragmentError>;
