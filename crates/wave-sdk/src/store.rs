//! Local copy of open wavelets.
//!
//! Each wavelet tracks the version it has applied and the segments it holds.
//! A segment is either resident (a snapshot kept current by every applied
//! delta) or loading (a fetch is outstanding and operations touching it are
//! buffered until the fragment lands). Deltas that arrive ahead of the local
//! version wait in a queue until the gap closes.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use wave_core::{
    HashedVersion, ParticipantId, RawFragment, RawOperation, SegmentContent, SegmentId,
    SegmentSnapshot, TransformedWaveletDelta, WaveletId, WaveletOperation,
};
use wave_fragments::SegmentStore;

/// State of one locally tracked segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentState {
    Resident(SegmentSnapshot),
    Loading { buffered: Vec<RawOperation> },
}

/// A change waiting for the local version to reach its applied-at version.
enum Pending {
    Delta(TransformedWaveletDelta),
    /// One of our own deltas the server had to transform. Its final
    /// operations are unknown here, so the touched segments are refetched.
    Transformed {
        resulting: HashedVersion,
        touched: Vec<SegmentId>,
    },
}

struct LocalWavelet {
    version: HashedVersion,
    desired: Option<u64>,
    segments: BTreeMap<SegmentId, SegmentState>,
    ahead: BTreeMap<u64, Pending>,
}

impl LocalWavelet {
    fn new(version: HashedVersion) -> Self {
        Self {
            version,
            desired: None,
            segments: BTreeMap::new(),
            ahead: BTreeMap::new(),
        }
    }

    /// Whether the index is resident and has never seen `blip_id`.
    fn is_unwritten_blip(&self, blip_id: &str) -> bool {
        match self.segments.get(&SegmentId::Index) {
            Some(SegmentState::Resident(SegmentSnapshot {
                content: SegmentContent::Index { blips },
                ..
            })) => !blips.contains_key(blip_id),
            _ => false,
        }
    }

    fn apply_op(&mut self, op: &RawOperation) {
        if let WaveletOperation::BlipContent { blip_id, .. } = &op.operation {
            let segment = SegmentId::blip(blip_id.clone());
            if !self.segments.contains_key(&segment) && self.is_unwritten_blip(blip_id) {
                // A brand new blip starts empty; no fetch needed.
                self.segments
                    .insert(segment.clone(), SegmentState::Resident(SegmentSnapshot::empty(&segment)));
            }
        }
        for segment in op.operation.touched_segments() {
            match self.segments.get_mut(&segment) {
                Some(SegmentState::Resident(snapshot)) => {
                    snapshot.apply(op);
                }
                Some(SegmentState::Loading { buffered }) => buffered.push(op.clone()),
                None => {}
            }
        }
    }

    /// Apply every queued change that now lines up with the local version.
    /// Returns the segments evicted for refetch.
    fn drain(&mut self, wavelet_id: &WaveletId) -> Vec<SegmentId> {
        let mut evicted = Vec::new();
        while let Some(pending) = self.ahead.remove(&self.version.version) {
            match pending {
                Pending::Delta(delta) => {
                    if delta.target_version != self.version {
                        warn!(
                            wavelet = %wavelet_id,
                            local = %self.version,
                            target = %delta.target_version,
                            "dropping delta that does not chain from the local version"
                        );
                        continue;
                    }
                    for op in delta.raw_operations() {
                        self.apply_op(&op);
                    }
                    self.version = delta.resulting_version;
                }
                Pending::Transformed { resulting, touched } => {
                    for segment in touched {
                        if self.segments.contains_key(&segment) {
                            self.segments.insert(
                                segment.clone(),
                                SegmentState::Loading {
                                    buffered: Vec::new(),
                                },
                            );
                            evicted.push(segment);
                        }
                    }
                    self.version = resulting;
                }
            }
        }
        evicted
    }

    fn enqueue(&mut self, wavelet_id: &WaveletId, applied_at: u64, pending: Pending) -> Vec<SegmentId> {
        if applied_at < self.version.version {
            debug!(wavelet = %wavelet_id, applied_at, local = self.version.version, "ignoring stale change");
            return Vec::new();
        }
        self.ahead.insert(applied_at, pending);
        self.drain(wavelet_id)
    }
}

/// In-memory document store for the wavelets a client has open.
#[derive(Default)]
pub struct MemoryWaveletStore {
    wavelets: RwLock<BTreeMap<WaveletId, LocalWavelet>>,
}

impl MemoryWaveletStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a wavelet at `version`, dropping any previous state.
    pub fn open(&self, wavelet_id: &WaveletId, version: HashedVersion) {
        self.wavelets
            .write()
            .insert(wavelet_id.clone(), LocalWavelet::new(version));
    }

    /// Stop tracking a wavelet. Returns the segments it held.
    pub fn forget(&self, wavelet_id: &WaveletId) -> Vec<SegmentId> {
        self.wavelets
            .write()
            .remove(wavelet_id)
            .map(|w| w.segments.into_keys().collect())
            .unwrap_or_default()
    }

    pub fn is_open(&self, wavelet_id: &WaveletId) -> bool {
        self.wavelets.read().contains_key(wavelet_id)
    }

    pub fn version(&self, wavelet_id: &WaveletId) -> Option<HashedVersion> {
        self.wavelets.read().get(wavelet_id).map(|w| w.version.clone())
    }

    /// Ask fetches to look ahead to `version`.
    pub fn set_desired_version(&self, wavelet_id: &WaveletId, version: u64) {
        if let Some(wavelet) = self.wavelets.write().get_mut(wavelet_id) {
            wavelet.desired = Some(version);
        }
    }

    /// Mark a segment as being fetched. Returns `false` if it is already
    /// resident and needs no fetch.
    pub fn mark_loading(&self, wavelet_id: &WaveletId, segment: &SegmentId) -> bool {
        let mut wavelets = self.wavelets.write();
        let Some(wavelet) = wavelets.get_mut(wavelet_id) else {
            return false;
        };
        match wavelet.segments.get(segment) {
            Some(SegmentState::Resident(_)) => false,
            Some(SegmentState::Loading { .. }) => true,
            None => {
                wavelet.segments.insert(
                    segment.clone(),
                    SegmentState::Loading {
                        buffered: Vec::new(),
                    },
                );
                true
            }
        }
    }

    /// Apply a delta streamed from the server. Returns segments evicted
    /// while catching up, which need refetching.
    pub fn apply_update(&self, wavelet_id: &WaveletId, delta: TransformedWaveletDelta) -> Vec<SegmentId> {
        let mut wavelets = self.wavelets.write();
        let Some(wavelet) = wavelets.get_mut(wavelet_id) else {
            return Vec::new();
        };
        let applied_at = delta.target_version.version;
        wavelet.enqueue(wavelet_id, applied_at, Pending::Delta(delta))
    }

    /// Record the server's acknowledgement of one of our deltas.
    ///
    /// If the server applied it at the version it targeted, its operations
    /// are applied as they are. Otherwise it was transformed: the touched
    /// segments are evicted and returned for refetch.
    pub fn acknowledge(
        &self,
        wavelet_id: &WaveletId,
        author: &ParticipantId,
        target: &HashedVersion,
        ops: Vec<WaveletOperation>,
        resulting: HashedVersion,
        timestamp: i64,
    ) -> Vec<SegmentId> {
        let mut wavelets = self.wavelets.write();
        let Some(wavelet) = wavelets.get_mut(wavelet_id) else {
            return Vec::new();
        };

        let applied_at = resulting.version.saturating_sub(ops.len() as u64);
        let pending = if applied_at == target.version {
            Pending::Delta(TransformedWaveletDelta {
                author: author.clone(),
                target_version: target.clone(),
                ops,
                resulting_version: resulting,
                application_timestamp: timestamp,
            })
        } else {
            debug!(
                wavelet = %wavelet_id,
                target = target.version,
                applied_at,
                "own delta was transformed"
            );
            let mut touched: Vec<SegmentId> =
                ops.iter().flat_map(WaveletOperation::touched_segments).collect();
            touched.sort();
            touched.dedup();
            Pending::Transformed { resulting, touched }
        };
        wavelet.enqueue(wavelet_id, applied_at, pending)
    }

    pub fn segment_state(&self, wavelet_id: &WaveletId, segment: &SegmentId) -> Option<SegmentState> {
        self.wavelets
            .read()
            .get(wavelet_id)
            .and_then(|w| w.segments.get(segment).cloned())
    }

    /// Resident snapshot of a segment.
    pub fn segment(&self, wavelet_id: &WaveletId, segment: &SegmentId) -> Option<SegmentSnapshot> {
        match self.segment_state(wavelet_id, segment)? {
            SegmentState::Resident(snapshot) => Some(snapshot),
            SegmentState::Loading { .. } => None,
        }
    }

    pub fn is_resident(&self, wavelet_id: &WaveletId, segment: &SegmentId) -> bool {
        self.segment(wavelet_id, segment).is_some()
    }

    /// Segments held or being fetched.
    pub fn tracked_segments(&self, wavelet_id: &WaveletId) -> Vec<SegmentId> {
        self.wavelets
            .read()
            .get(wavelet_id)
            .map(|w| w.segments.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Segments with a fetch outstanding.
    pub fn loading_segments(&self, wavelet_id: &WaveletId) -> Vec<SegmentId> {
        self.wavelets
            .read()
            .get(wavelet_id)
            .map(|w| {
                w.segments
                    .iter()
                    .filter(|(_, state)| matches!(state, SegmentState::Loading { .. }))
                    .map(|(segment, _)| segment.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn text(&self, wavelet_id: &WaveletId, blip_id: &str) -> Option<String> {
        self.segment(wavelet_id, &SegmentId::blip(blip_id))
            .and_then(|s| s.content.text().map(str::to_owned))
    }

    pub fn participants(&self, wavelet_id: &WaveletId) -> Option<Vec<ParticipantId>> {
        self.segment(wavelet_id, &SegmentId::Participants)
            .and_then(|s| s.content.participants().map(<[ParticipantId]>::to_vec))
    }

    /// Blip id -> last modified version, from the resident index.
    pub fn blips(&self, wavelet_id: &WaveletId) -> Option<BTreeMap<String, u64>> {
        match self.segment(wavelet_id, &SegmentId::Index)?.content {
            SegmentContent::Index { blips } => Some(blips),
            _ => None,
        }
    }

    /// Number of changes waiting for an earlier version.
    pub fn queued_changes(&self, wavelet_id: &WaveletId) -> usize {
        self.wavelets
            .read()
            .get(wavelet_id)
            .map(|w| w.ahead.len())
            .unwrap_or(0)
    }
}

impl SegmentStore for MemoryWaveletStore {
    fn open_version(&self, wavelet_id: &WaveletId) -> Option<u64> {
        self.wavelets.read().get(wavelet_id).map(|w| w.version.version)
    }

    fn desired_version(&self, wavelet_id: &WaveletId) -> Option<u64> {
        self.wavelets.read().get(wavelet_id).and_then(|w| w.desired)
    }

    fn segment_start_version(&self, wavelet_id: &WaveletId, segment: &SegmentId) -> Option<u64> {
        match self.segment_state(wavelet_id, segment)? {
            SegmentState::Resident(snapshot) => Some(snapshot.version),
            SegmentState::Loading { .. } => None,
        }
    }

    fn apply_fragment(&self, wavelet_id: &WaveletId, segment: &SegmentId, fragment: RawFragment) {
        let mut wavelets = self.wavelets.write();
        let Some(wavelet) = wavelets.get_mut(wavelet_id) else {
            debug!(wavelet = %wavelet_id, %segment, "fragment for a wavelet no longer open");
            return;
        };

        let (base, buffered) = match wavelet.segments.remove(segment) {
            Some(SegmentState::Resident(snapshot)) => (Some(snapshot), Vec::new()),
            Some(SegmentState::Loading { buffered }) => (None, buffered),
            None => (None, Vec::new()),
        };
        let newest = base.as_ref().map(|s| s.version);

        let mut snapshot = fragment.fold(segment, base.clone());
        for op in &buffered {
            snapshot.apply(op);
        }
        let snapshot = match (base, newest) {
            // Never roll a resident segment back.
            (Some(base), Some(version)) if version > snapshot.version => base,
            _ => snapshot,
        };
        debug!(
            wavelet = %wavelet_id,
            %segment,
            version = snapshot.version,
            replayed = buffered.len(),
            "segment loaded"
        );
        wavelet
            .segments
            .insert(segment.clone(), SegmentState::Resident(snapshot));
    }
}
