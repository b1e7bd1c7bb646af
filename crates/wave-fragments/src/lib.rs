//! # wave-fragments
//!
//! Lazy loading of wavelet segments. The [`FragmentScheduler`] collects the
//! segments a client wants, groups them into one fetch per wavelet, caps how
//! many fetches run at once and never asks for a segment that is already on
//! its way. Replies are folded into a [`SegmentStore`].

pub mod config;
pub mod error;
pub mod scheduler;
pub mod source;

pub use config::{FragmentConfig, FragmentConfigBuilder};
pub use error::{FragmentError, Result};
pub use scheduler::{FragmentScheduler, SegmentsUpdated};
pub use source::{FragmentFetcher, SegmentStore};
