//! One hosted wavelet: its reconciler plus the per-segment operation logs
//! fragments are cut from.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};
use wave_channel::{FetchFragmentsRequest, WaveletView};
use wave_core::{
    Clock, HashedVersion, RawFragment, RawOperation, SegmentId, SegmentSnapshot,
    TransformedWaveletDelta, WaveletDelta, WaveletId,
};
use wave_history::{
    DeltaHistory, HashedVersionFactory, ReconcileError, Reconciled, Reconciler, Transformer,
};

pub(crate) struct HostedWavelet {
    reconciler: Reconciler,
    /// Every applied operation, filed under each segment it touched.
    segment_ops: BTreeMap<SegmentId, Vec<RawOperation>>,
    /// Open channel ids observing this wavelet.
    pub(crate) subscribers: BTreeSet<String>,
}

impl HostedWavelet {
    pub(crate) fn new(
        wavelet_id: WaveletId,
        transformer: Arc<dyn Transformer>,
        factory: Arc<dyn HashedVersionFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(wavelet_id, transformer, factory, clock),
            segment_ops: BTreeMap::new(),
            subscribers: BTreeSet::new(),
        }
    }

    pub(crate) fn wavelet_id(&self) -> &WaveletId {
        self.reconciler.wavelet_id()
    }

    pub(crate) fn head(&self) -> &HashedVersion {
        self.reconciler.current_version()
    }

    pub(crate) fn history_len(&self) -> usize {
        self.reconciler.history().len()
    }

    /// Reconcile a client delta and file its operations by segment.
    pub(crate) fn apply(&mut self, delta: WaveletDelta) -> Result<Reconciled, ReconcileError> {
        let reconciled = self.reconciler.on_client_delta(delta)?;
        if !reconciled.duplicate {
            for op in reconciled.delta.raw_operations() {
                for segment in op.operation.touched_segments() {
                    self.segment_ops.entry(segment).or_default().push(op.clone());
                }
            }
        }
        Ok(reconciled)
    }

    pub(crate) fn deltas_since(
        &self,
        known: &HashedVersion,
    ) -> Result<Vec<TransformedWaveletDelta>, ReconcileError> {
        self.reconciler.deltas_since(known)
    }

    pub(crate) fn truncate_at(&mut self, version: u64) -> Result<(), ReconcileError> {
        self.reconciler.truncate_at(version)?;
        for ops in self.segment_ops.values_mut() {
            ops.retain(|op| op.version <= version);
        }
        self.segment_ops.retain(|_, ops| !ops.is_empty());
        Ok(())
    }

    /// Index, participants and every blip that has been written.
    pub(crate) fn segments(&self) -> Vec<SegmentId> {
        let mut segments = vec![SegmentId::Index, SegmentId::Participants];
        segments.extend(self.segment_ops.keys().filter(|s| s.is_blip()).cloned());
        segments
    }

    /// Segment state as of `version`.
    pub(crate) fn snapshot(&self, segment: &SegmentId, version: u64) -> SegmentSnapshot {
        let mut snapshot = SegmentSnapshot::empty(segment);
        for op in self.ops(segment).iter().take_while(|op| op.version <= version) {
            snapshot.apply(op);
        }
        snapshot
    }

    /// The segment at `start` plus the operations in `(start, end]`.
    pub(crate) fn fragment(&self, segment: &SegmentId, start: u64, end: u64) -> RawFragment {
        let diff_ops = self
            .ops(segment)
            .iter()
            .filter(|op| op.version > start && op.version <= end)
            .cloned()
            .collect();
        RawFragment {
            snapshot: Some(self.snapshot(segment, start)),
            adjust_ops: Vec::new(),
            diff_ops,
        }
    }

    /// Cut the fragments a fetch asks for.
    ///
    /// At most `max_blips` blip segments are answered. A fragment that would
    /// push the reply past `max_reply_size` is left out, unless the reply is
    /// still smaller than `min_reply_size`.
    pub(crate) fn fetch(&self, request: &FetchFragmentsRequest) -> BTreeMap<SegmentId, RawFragment> {
        let end = request.end_version.min(self.head().version);
        let mut fragments = BTreeMap::new();
        let mut size = 0usize;
        let mut blips = 0usize;

        for (segment, start) in &request.start_versions {
            if segment.is_blip() && blips >= request.max_blips {
                debug!(wavelet = %self.wavelet_id(), %segment, "blip limit reached");
                continue;
            }
            let fragment = self.fragment(segment, (*start).min(end), end);
            let Some(len) = fragment.encoded_len() else {
                warn!(wavelet = %self.wavelet_id(), %segment, "dropping unencodable fragment");
                continue;
            };
            let after = size.saturating_add(len);
            if size >= request.min_reply_size && after > request.max_reply_size {
                debug!(wavelet = %self.wavelet_id(), %segment, len, "reply size budget reached");
                continue;
            }
            size = after;
            if segment.is_blip() {
                blips += 1;
            }
            fragments.insert(segment.clone(), fragment);
        }
        fragments
    }

    /// Every segment at the head, as snapshots.
    pub(crate) fn view(&self) -> WaveletView {
        let head = self.head().clone();
        let fragments = self
            .segments()
            .into_iter()
            .map(|segment| {
                let fragment = RawFragment {
                    snapshot: Some(self.snapshot(&segment, head.version)),
                    ..Default::default()
                };
                (segment, fragment)
            })
            .collect();
        WaveletView {
            wavelet_id: self.wavelet_id().clone(),
            version: head,
            fragments,
        }
    }

    fn ops(&self, segment: &SegmentId) -> &[RawOperation] {
        self.segment_ops
            .get(segment)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wave_core::{ManualClock, ParticipantId, SegmentContent, WaveletOperation};
    use wave_history::{PositionalTransformer, Sha256VersionFactory};

    fn hosted() -> HostedWavelet {
        HostedWavelet::new(
            WaveletId::new("example.com!w+1", "conv+root"),
            Arc::new(PositionalTransformer),
            Arc::new(Sha256VersionFactory),
            Arc::new(ManualClock::new(0)),
        )
    }

    fn submit(wavelet: &mut HostedWavelet, ops: Vec<WaveletOperation>) {
        let delta = WaveletDelta::new(
            ParticipantId::new("a@example.com"),
            wavelet.head().clone(),
            ops,
        );
        wavelet.apply(delta).unwrap();
    }

    fn request(starts: &[(SegmentId, u64)], end: u64) -> FetchFragmentsRequest {
        FetchFragmentsRequest {
            wavelet_id: WaveletId::new("example.com!w+1", "conv+root"),
            start_versions: starts.iter().cloned().collect(),
            end_version: end,
            min_reply_size: 0,
            max_reply_size: usize::MAX,
            max_blips: 10,
        }
    }

    #[test]
    fn test_fragment_window() {
        let mut wavelet = hosted();
        submit(&mut wavelet, vec![WaveletOperation::insert("b1", 0, "abc")]);
        submit(&mut wavelet, vec![WaveletOperation::insert("b1", 3, "def")]);
        submit(&mut wavelet, vec![WaveletOperation::insert("b1", 6, "ghi")]);

        let fragment = wavelet.fragment(&SegmentId::blip("b1"), 1, 2);
        assert_eq!(fragment.snapshot.as_ref().unwrap().content.text(), Some("abc"));
        assert_eq!(fragment.diff_ops.len(), 1);
        assert_eq!(fragment.diff_ops[0].version, 2);

        let folded = fragment.fold(&SegmentId::blip("b1"), None);
        assert_eq!(folded.content.text(), Some("abcdef"));
        assert_eq!(folded.version, 2);
    }

    #[test]
    fn test_blip_ops_also_file_under_index() {
        let mut wavelet = hosted();
        submit(
            &mut wavelet,
            vec![
                WaveletOperation::add_participant("a@example.com"),
                WaveletOperation::insert("b1", 0, "x"),
            ],
        );

        assert_eq!(
            wavelet.segments(),
            vec![SegmentId::Index, SegmentId::Participants, SegmentId::blip("b1")]
        );
        match wavelet.snapshot(&SegmentId::Index, 2).content {
            SegmentContent::Index { blips } => assert_eq!(blips.get("b1"), Some(&2)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fetch_honours_blip_limit() {
        let mut wavelet = hosted();
        for n in 0..4 {
            submit(&mut wavelet, vec![WaveletOperation::insert(format!("b{}", n), 0, "x")]);
        }
        let starts: Vec<_> = (0..4).map(|n| (SegmentId::blip(format!("b{}", n)), 0)).collect();
        let mut req = request(&starts, 4);
        req.max_blips = 2;

        let fragments = wavelet.fetch(&req);
        assert_eq!(fragments.len(), 2);
    }

    #[test]
    fn test_fetch_honours_size_budget() {
        let mut wavelet = hosted();
        let long = "x".repeat(500);
        for n in 0..3 {
            submit(&mut wavelet, vec![WaveletOperation::insert(format!("b{}", n), 0, long.clone())]);
        }
        let starts: Vec<_> = (0..3).map(|n| (SegmentId::blip(format!("b{}", n)), 0)).collect();
        let one = wavelet
            .fragment(&SegmentId::blip("b0"), 0, 3)
            .encoded_len()
            .unwrap();

        let mut req = request(&starts, 3);
        req.max_reply_size = one * 2 + one / 2;
        assert_eq!(wavelet.fetch(&req).len(), 2);

        // The minimum lets a single oversized fragment through.
        req.max_reply_size = 10;
        req.min_reply_size = 1;
        assert_eq!(wavelet.fetch(&req).len(), 1);
    }

    #[test]
    fn test_truncate_drops_segment_ops() {
        let mut wavelet = hosted();
        submit(&mut wavelet, vec![WaveletOperation::insert("b1", 0, "a")]);
        submit(&mut wavelet, vec![WaveletOperation::insert("b2", 0, "b")]);

        wavelet.truncate_at(1).unwrap();
        assert_eq!(wavelet.head().version, 1);
        assert_eq!(
            wavelet.segments(),
            vec![SegmentId::Index, SegmentId::Participants, SegmentId::blip("b1")]
        );
    }

    #[test]
    fn test_view_snapshots_at_head() {
        let mut wavelet = hosted();
        submit(&mut wavelet, vec![WaveletOperation::insert("b1", 0, "hello")]);

        let view = wavelet.view();
        assert_eq!(view.version.version, 1);
        let blip = &view.fragments[&SegmentId::blip("b1")];
        assert_eq!(blip.snapshot.as_ref().unwrap().content.text(), Some("hello"));
        assert!(blip.diff_ops.is_empty());
    }
}
