//! Wavesync SDK - live wavelets with lazily loaded segments
//!
//! A [`Client`] keeps one channel to the server. Each open wavelet streams
//! transformed deltas into a local [`MemoryWaveletStore`]; segments (the
//! index, the participant list and individual blips) are fetched only when
//! asked for, through a [`wave_fragments::FragmentScheduler`].
//!
//! # Architecture
//!
//! - [`client`] - connecting, opening wavelets, submitting and loading
//! - [`store`] - the local copy and how updates, acks and fragments meet
//! - [`config`] - client configuration
//! - [`error`] - error types
//!
//! When the link drops, outstanding fetches are abandoned. When it returns,
//! every open wavelet reopens from its local version and the server replays
//! what was missed.

pub mod client;
pub mod config;
pub mod error;
pub mod store;

// Re-exports for convenience
pub use client::{Client, WaveletChanged};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{Result, SdkError};
pub use store::{MemoryWaveletStore, SegmentState};
