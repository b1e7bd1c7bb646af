//! Delta history storage.
//!
//! A delta history is the version chain of one wavelet: records keyed by the
//! version they were applied at, plus a signature table mapping version
//! numbers to hashed versions.

use crate::error::HistoryError;
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use tracing::debug;
use wave_core::{HashedVersion, WaveletDeltaRecord, WaveletId};

/// Trait for wavelet delta history storage.
pub trait DeltaHistory {
    /// Root of the chain.
    fn version_zero(&self) -> &HashedVersion;

    /// Head of the chain.
    fn current_version(&self) -> &HashedVersion;

    /// Append a record keyed by its applied-at version.
    ///
    /// The head advances when the record starts at the current head.
    fn append(&mut self, record: WaveletDeltaRecord) -> Result<(), HistoryError>;

    /// The record applied at `version`, if any.
    fn delta_starting_at(&self, version: u64) -> Option<&WaveletDeltaRecord>;

    /// The hashed version recorded for `version`, if it is a delta boundary.
    fn signature_at(&self, version: u64) -> Option<&HashedVersion>;

    /// Walk the chain from `start` towards `end`, handing each record to
    /// `receiver`. Stops at a gap, at a record that would overshoot `end`, or
    /// when the receiver breaks. Returns the number of records delivered.
    fn delta_history(
        &self,
        start: &HashedVersion,
        end: &HashedVersion,
        receiver: &mut dyn FnMut(&WaveletDeltaRecord) -> ControlFlow<()>,
    ) -> Result<usize, HistoryError>;

    /// Reset the head to `version` and drop every record reachable forward
    /// from it.
    fn truncate_at(&mut self, version: u64) -> Result<(), HistoryError>;

    /// Number of stored records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory implementation of [`DeltaHistory`].
#[derive(Clone, Debug)]
pub struct MemoryDeltaHistory {
    wavelet_id: WaveletId,
    version_zero: HashedVersion,
    current: HashedVersion,
    records: HashMap<u64, WaveletDeltaRecord>,
    signatures: BTreeMap<u64, HashedVersion>,
}

impl MemoryDeltaHistory {
    /// Create a history containing only `version_zero`.
    pub fn new(wavelet_id: WaveletId, version_zero: HashedVersion) -> Self {
        let mut signatures = BTreeMap::new();
        signatures.insert(version_zero.version, version_zero.clone());
        Self {
            wavelet_id,
            current: version_zero.clone(),
            version_zero,
            records: HashMap::new(),
            signatures,
        }
    }

    pub fn wavelet_id(&self) -> &WaveletId {
        &self.wavelet_id
    }

    /// Records in chain order from version zero up to the head.
    pub fn records_in_order(&self) -> Vec<&WaveletDeltaRecord> {
        let mut out = Vec::new();
        let mut at = self.version_zero.version;
        while let Some(record) = self.records.get(&at) {
            if at >= self.current.version {
                break;
            }
            out.push(record);
            at = record.resulting_version.version;
        }
        out
    }

    /// Advance the head across records that were appended ahead of it.
    fn advance_head(&mut self) {
        while let Some(record) = self.records.get(&self.current.version) {
            if record.applied_at_version != self.current {
                break;
            }
            self.current = record.resulting_version.clone();
        }
    }
}

impl DeltaHistory for MemoryDeltaHistory {
    fn version_zero(&self) -> &HashedVersion {
        &self.version_zero
    }

    fn current_version(&self) -> &HashedVersion {
        &self.current
    }

    fn append(&mut self, record: WaveletDeltaRecord) -> Result<(), HistoryError> {
        let applied_at = record.applied_at_version.clone();
        let resulting = record.resulting_version.clone();

        if resulting.version <= applied_at.version {
            return Err(HistoryError::NonIncreasing {
                applied_at: applied_at.version,
                resulting: resulting.version,
            });
        }
        if self.records.contains_key(&applied_at.version) {
            return Err(HistoryError::Duplicate(applied_at.version));
        }
        if let Some(known) = self.signatures.get(&applied_at.version) {
            if *known != applied_at {
                return Err(HistoryError::BrokenChain {
                    expected: known.clone(),
                    found: applied_at,
                });
            }
        }

        self.signatures
            .entry(applied_at.version)
            .or_insert_with(|| applied_at.clone());
        self.signatures.insert(resulting.version, resulting.clone());
        self.records.insert(applied_at.version, record);
        self.advance_head();

        debug!(
            wavelet = %self.wavelet_id,
            applied_at = %applied_at.short(),
            resulting = %resulting.short(),
            "appended delta record"
        );
        Ok(())
    }

    fn delta_starting_at(&self, version: u64) -> Option<&WaveletDeltaRecord> {
        self.records.get(&version)
    }

    fn signature_at(&self, version: u64) -> Option<&HashedVersion> {
        self.signatures.get(&version)
    }

    fn delta_history(
        &self,
        start: &HashedVersion,
        end: &HashedVersion,
        receiver: &mut dyn FnMut(&WaveletDeltaRecord) -> ControlFlow<()>,
    ) -> Result<usize, HistoryError> {
        if start.version > end.version {
            return Err(HistoryError::InvalidRange {
                start: start.version,
                end: end.version,
            });
        }
        match self.signatures.get(&start.version) {
            Some(known) if known == start => {}
            _ => return Err(HistoryError::UnknownVersion(start.clone())),
        }

        let mut at = start.version;
        let mut delivered = 0;
        while at < end.version {
            let Some(record) = self.records.get(&at) else {
                debug!(wavelet = %self.wavelet_id, version = at, "gap in delta history");
                break;
            };
            if record.resulting_version.version > end.version {
                break;
            }
            delivered += 1;
            if receiver(record).is_break() {
                break;
            }
            at = record.resulting_version.version;
        }
        Ok(delivered)
    }

    fn truncate_at(&mut self, version: u64) -> Result<(), HistoryError> {
        let target = self
            .signatures
            .get(&version)
            .cloned()
            .ok_or(HistoryError::UnknownVersionNumber(version))?;

        let mut at = version;
        let mut removed = 0usize;
        while let Some(record) = self.records.remove(&at) {
            at = record.resulting_version.version;
            if at != version {
                self.signatures.remove(&at);
            }
            removed += 1;
        }
        self.current = target;

        debug!(
            wavelet = %self.wavelet_id,
            version,
            removed,
            "truncated delta history"
        );
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
