//! Deltas and durable history records.

use crate::fragment::RawOperation;
use crate::ids::ParticipantId;
use crate::operation::WaveletOperation;
use crate::version::HashedVersion;
use serde::{Deserialize, Serialize};

/// A client-proposed change relative to `target_version`, not yet applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveletDelta {
    pub author: ParticipantId,
    pub target_version: HashedVersion,
    pub ops: Vec<WaveletOperation>,
}

impl WaveletDelta {
    pub fn new(
        author: ParticipantId,
        target_version: HashedVersion,
        ops: Vec<WaveletOperation>,
    ) -> Self {
        Self {
            author,
            target_version,
            ops,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A delta after reconciliation: its `target_version` is the head it was
/// applied at and `resulting_version` chains from that head.
///
/// Only the reconciler produces these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedWaveletDelta {
    pub author: ParticipantId,
    pub target_version: HashedVersion,
    pub ops: Vec<WaveletOperation>,
    pub resulting_version: HashedVersion,
    pub application_timestamp: i64,
}

impl TransformedWaveletDelta {
    /// The version the delta was applied at.
    pub fn applied_at(&self) -> &HashedVersion {
        &self.target_version
    }

    /// The operations stamped with the version each one produces.
    ///
    /// Operation `i` of a delta applied at version `v` produces `v + i + 1`.
    pub fn raw_operations(&self) -> Vec<RawOperation> {
        let base = self.target_version.version;
        self.ops
            .iter()
            .enumerate()
            .map(|(i, op)| RawOperation {
                version: base + i as u64 + 1,
                author: self.author.clone(),
                operation: op.clone(),
            })
            .collect()
    }
}

/// A durable history entry. Immutable once appended to a delta history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveletDeltaRecord {
    pub applied_at_version: HashedVersion,
    pub resulting_version: HashedVersion,
    pub transformed_delta: TransformedWaveletDelta,
    /// The delta exactly as the client submitted it, before transformation.
    pub raw_applied_delta: WaveletDelta,
}

impl WaveletDeltaRecord {
    pub fn new(raw_applied_delta: WaveletDelta, transformed_delta: TransformedWaveletDelta) -> Self {
        Self {
            applied_at_version: transformed_delta.target_version.clone(),
            resulting_version: transformed_delta.resulting_version.clone(),
            transformed_delta,
            raw_applied_delta,
        }
    }

    pub fn author(&self) -> &ParticipantId {
        &self.transformed_delta.author
    }
}
