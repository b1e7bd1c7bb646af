//! Segment content and the fragments that carry it over the wire.

use crate::ids::{ParticipantId, SegmentId};
use crate::operation::WaveletOperation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A wavelet operation stamped with the version it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOperation {
    pub version: u64,
    pub author: ParticipantId,
    pub operation: WaveletOperation,
}

/// Materialized content of one segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SegmentContent {
    /// Blip id -> version of its last modification.
    Index { blips: BTreeMap<String, u64> },
    Participants { participants: Vec<ParticipantId> },
    Blip { text: String },
}

impl SegmentContent {
    /// Content of a segment before any operation touched it.
    pub fn empty(segment: &SegmentId) -> Self {
        match segment {
            SegmentId::Index => SegmentContent::Index {
                blips: BTreeMap::new(),
            },
            SegmentId::Participants => SegmentContent::Participants {
                participants: Vec::new(),
            },
            SegmentId::Blip(_) => SegmentContent::Blip {
                text: String::new(),
            },
        }
    }

    /// Apply an operation. Operations aimed at another kind of segment are
    /// ignored; callers route blip operations to the right blip.
    pub fn apply(&mut self, op: &RawOperation) {
        match (self, &op.operation) {
            (SegmentContent::Index { blips }, WaveletOperation::BlipContent { blip_id, .. }) => {
                blips.insert(blip_id.clone(), op.version);
            }
            (
                SegmentContent::Participants { participants },
                WaveletOperation::AddParticipant { participant },
            ) => {
                if !participants.contains(participant) {
                    participants.push(participant.clone());
                }
            }
            (
                SegmentContent::Participants { participants },
                WaveletOperation::RemoveParticipant { participant },
            ) => {
                participants.retain(|p| p != participant);
            }
            (SegmentContent::Blip { text }, WaveletOperation::BlipContent { op: doc_op, .. }) => {
                doc_op.apply(text);
            }
            _ => {}
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            SegmentContent::Blip { text } => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn participants(&self) -> Option<&[ParticipantId]> {
        match self {
            SegmentContent::Participants { participants } => Some(participants.as_slice()),
            _ => None,
        }
    }
}

/// Segment content as of a version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    pub version: u64,
    pub content: SegmentContent,
}

impl SegmentSnapshot {
    pub fn empty(segment: &SegmentId) -> Self {
        Self {
            version: 0,
            content: SegmentContent::empty(segment),
        }
    }

    /// Apply `op` if it is newer than this snapshot. Returns whether it applied.
    pub fn apply(&mut self, op: &RawOperation) -> bool {
        if op.version <= self.version {
            return false;
        }
        self.content.apply(op);
        self.version = op.version;
        true
    }
}

/// Wire representation of a segment around a version window.
///
/// `adjust_ops` bring the snapshot up to the window start and `diff_ops`
/// carry it from the window start to the window end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFragment {
    pub snapshot: Option<SegmentSnapshot>,
    pub adjust_ops: Vec<RawOperation>,
    pub diff_ops: Vec<RawOperation>,
}

impl RawFragment {
    /// Highest version this fragment describes.
    pub fn end_version(&self) -> Option<u64> {
        self.diff_ops
            .last()
            .or_else(|| self.adjust_ops.last())
            .map(|op| op.version)
            .or_else(|| self.snapshot.as_ref().map(|s| s.version))
    }

    /// Fold the fragment onto `base`. A snapshot in the fragment replaces
    /// the base entirely.
    pub fn fold(&self, segment: &SegmentId, base: Option<SegmentSnapshot>) -> SegmentSnapshot {
        let mut state = self
            .snapshot
            .clone()
            .or(base)
            .unwrap_or_else(|| SegmentSnapshot::empty(segment));
        for op in self.adjust_ops.iter().chain(self.diff_ops.iter()) {
            state.apply(op);
        }
        state
    }

    /// Rough wire size, used to honour reply size budgets. `None` if the
    /// fragment cannot be encoded at all.
    pub fn encoded_len(&self) -> Option<usize> {
        serde_json::to_vec(self).ok().map(|bytes| bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(version: u64, operation: WaveletOperation) -> RawOperation {
        RawOperation {
            version,
            author: ParticipantId::new("a@example.com"),
            operation,
        }
    }

    #[test]
    fn test_index_tracks_last_modification() {
        let mut index = SegmentSnapshot::empty(&SegmentId::Index);
        index.apply(&raw(1, WaveletOperation::insert("b1", 0, "a")));
        index.apply(&raw(2, WaveletOperation::insert("b2", 0, "b")));
        index.apply(&raw(3, WaveletOperation::insert("b1", 1, "c")));

        match index.content {
            SegmentContent::Index { blips } => {
                assert_eq!(blips.get("b1"), Some(&3));
                assert_eq!(blips.get("b2"), Some(&2));
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_participants_are_a_set_in_join_order() {
        let mut p = SegmentSnapshot::empty(&SegmentId::Participants);
        p.apply(&raw(1, WaveletOperation::add_participant("a")));
        p.apply(&raw(2, WaveletOperation::add_participant("b")));
        p.apply(&raw(3, WaveletOperation::add_participant("a")));
        p.apply(&raw(4, WaveletOperation::remove_participant("a")));

        assert_eq!(p.content.participants().unwrap(), &[ParticipantId::new("b")]);
        assert_eq!(p.version, 4);
    }

    #[test]
    fn test_stale_operations_are_skipped() {
        let mut blip = SegmentSnapshot::empty(&SegmentId::blip("b1"));
        assert!(blip.apply(&raw(2, WaveletOperation::insert("b1", 0, "new"))));
        assert!(!blip.apply(&raw(1, WaveletOperation::insert("b1", 0, "old"))));
        assert_eq!(blip.content.text(), Some("new"));
    }

    #[test]
    fn test_fold_snapshot_then_diff() {
        let segment = SegmentId::blip("b1");
        let fragment = RawFragment {
            snapshot: Some(SegmentSnapshot {
                version: 5,
                content: SegmentContent::Blip {
                    text: "hello".to_string(),
                },
            }),
            adjust_ops: Vec::new(),
            diff_ops: vec![
                raw(6, WaveletOperation::insert("b1", 5, " world")),
                raw(7, WaveletOperation::delete("b1", 0, 1)),
            ],
        };

        assert_eq!(fragment.end_version(), Some(7));
        let state = fragment.fold(&segment, None);
        assert_eq!(state.version, 7);
        assert_eq!(state.content.text(), Some("ello world"));
    }

    #[test]
    fn test_encoded_len_is_the_json_size() {
        let fragment = RawFragment {
            snapshot: Some(SegmentSnapshot::empty(&SegmentId::blip("b1"))),
            adjust_ops: Vec::new(),
            diff_ops: vec![raw(1, WaveletOperation::insert("b1", 0, "héllo"))],
        };
        let json = serde_json::to_vec(&fragment).unwrap();
        assert_eq!(fragment.encoded_len(), Some(json.len()));
        assert!(RawFragment::default().encoded_len().is_some_and(|len| len > 0));
    }

    #[test]
    fn test_fold_without_snapshot_extends_base() {
        let segment = SegmentId::blip("b1");
        let base = SegmentSnapshot {
            version: 2,
            content: SegmentContent::Blip {
                text: "ab".to_string(),
            },
        };
        let fragment = RawFragment {
            snapshot: None,
            adjust_ops: Vec::new(),
            diff_ops: vec![
                raw(2, WaveletOperation::insert("b1", 0, "dup")),
                raw(3, WaveletOperation::insert("b1", 2, "c")),
            ],
        };

        let state = fragment.fold(&segment, Some(base));
        assert_eq!(state.content.text(), Some("abc"));
        assert_eq!(state.version, 3);
    }
}
