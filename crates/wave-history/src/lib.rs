//! # wave-history
//!
//! Server-side version chain for wavelets.
//!
//! - [`DeltaHistory`]: record storage keyed by applied-at version, with a
//!   signature table for hashed-version lookup
//! - [`Transformer`]: pluggable operational transform, with
//!   [`PositionalTransformer`] as the default
//! - [`HashedVersionFactory`]: derives each version hash from its predecessor
//! - [`Reconciler`]: transforms stale client deltas to the head and appends
//!   them
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use wave_core::{ParticipantId, SystemClock, WaveletDelta, WaveletId, WaveletOperation};
//! use wave_history::{PositionalTransformer, Reconciler, Sha256VersionFactory};
//!
//! let mut reconciler = Reconciler::new(
//!     WaveletId::new("example.com!w+1", "conv+root"),
//!     Arc::new(PositionalTransformer),
//!     Arc::new(Sha256VersionFactory),
//!     Arc::new(SystemClock),
//! );
//!
//! let head = reconciler.current_version().clone();
//! let delta = WaveletDelta::new(
//!     ParticipantId::new("alice@example.com"),
//!     head,
//!     vec![WaveletOperation::insert("b+1", 0, "Hello")],
//! );
//! let applied = reconciler.on_client_delta(delta).unwrap();
//! assert_eq!(applied.delta.resulting_version.version, 1);
//! ```

pub mod error;
pub mod hash;
pub mod history;
pub mod reconciler;
pub mod transform;

pub use error::{HistoryError, ReconcileError, TransformError};
pub use hash::{HashedVersionFactory, Sha256VersionFactory, HASH_LEN};
pub use history::{DeltaHistory, MemoryDeltaHistory};
pub use reconciler::{canonical_encoding, transform_delta, Reconciled, Reconciler};
pub use transform::{PositionalTransformer, Transformer};
