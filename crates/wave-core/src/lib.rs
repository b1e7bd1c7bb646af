//! # wave-core
//!
//! Data model shared by every Wavesync crate.
//!
//! - [`HashedVersion`]: a `(version, hash)` point in a wavelet's history
//! - [`WaveletDelta`] / [`TransformedWaveletDelta`]: proposed and reconciled changes
//! - [`WaveletDeltaRecord`]: the durable history entry
//! - [`SegmentId`] / [`RawFragment`]: lazily fetched parts of a wavelet
//! - [`ReturnStatus`]: the outcome carried by every response
//! - [`Clock`]: injectable wall clock
//!
//! ## Example
//!
//! ```rust
//! use wave_core::{HashedVersion, ParticipantId, WaveletDelta, WaveletOperation};
//!
//! let delta = WaveletDelta::new(
//!     ParticipantId::new("alice@example.com"),
//!     HashedVersion::new(0, b"wave://example.com!w+1/conv+root".to_vec()),
//!     vec![WaveletOperation::insert("b+1", 0, "Hello")],
//! );
//! assert_eq!(delta.len(), 1);
//! ```

pub mod clock;
pub mod delta;
pub mod error;
pub mod fragment;
pub mod ids;
pub mod operation;
pub mod status;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delta::{TransformedWaveletDelta, WaveletDelta, WaveletDeltaRecord};
pub use error::{CoreError, Result};
pub use fragment::{RawFragment, RawOperation, SegmentContent, SegmentSnapshot};
pub use ids::{ParticipantId, SegmentId, WaveId, WaveletId};
pub use operation::{DocOp, WaveletOperation};
pub use status::{ReturnStatus, StatusCode};
pub use version::HashedVersion;
