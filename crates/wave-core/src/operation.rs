//! Wavelet operations.
//!
//! A wavelet operation touches exactly one segment: the participant list or
//! a single blip. Blip operations additionally bump that blip's entry in the
//! wavelet index.

use crate::ids::{ParticipantId, SegmentId};
use serde::{Deserialize, Serialize};

/// An edit to a blip's text. Positions and lengths count chars.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DocOp {
    Insert { position: usize, text: String },
    Delete { position: usize, len: usize },
}

impl DocOp {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        DocOp::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, len: usize) -> Self {
        DocOp::Delete { position, len }
    }

    /// Apply to `text`, clamping out-of-range positions.
    pub fn apply(&self, text: &mut String) {
        let char_len = text.chars().count();
        match self {
            DocOp::Insert { position, text: inserted } => {
                let at = byte_offset(text, (*position).min(char_len));
                text.insert_str(at, inserted);
            }
            DocOp::Delete { position, len } => {
                let start = (*position).min(char_len);
                let end = position.saturating_add(*len).min(char_len);
                let (from, to) = (byte_offset(text, start), byte_offset(text, end));
                text.replace_range(from..to, "");
            }
        }
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len())
}

/// One operation of a wavelet delta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WaveletOperation {
    /// Placeholder produced when a transform cancels an operation out.
    NoOp,
    AddParticipant { participant: ParticipantId },
    RemoveParticipant { participant: ParticipantId },
    BlipContent { blip_id: String, op: DocOp },
}

impl WaveletOperation {
    pub fn add_participant(participant: impl Into<String>) -> Self {
        WaveletOperation::AddParticipant {
            participant: ParticipantId::new(participant),
        }
    }

    pub fn remove_participant(participant: impl Into<String>) -> Self {
        WaveletOperation::RemoveParticipant {
            participant: ParticipantId::new(participant),
        }
    }

    pub fn insert(blip_id: impl Into<String>, position: usize, text: impl Into<String>) -> Self {
        WaveletOperation::BlipContent {
            blip_id: blip_id.into(),
            op: DocOp::insert(position, text),
        }
    }

    pub fn delete(blip_id: impl Into<String>, position: usize, len: usize) -> Self {
        WaveletOperation::BlipContent {
            blip_id: blip_id.into(),
            op: DocOp::delete(position, len),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, WaveletOperation::NoOp)
    }

    /// The segment whose content this operation changes.
    pub fn segment(&self) -> Option<SegmentId> {
        match self {
            WaveletOperation::NoOp => None,
            WaveletOperation::AddParticipant { .. } | WaveletOperation::RemoveParticipant { .. } => {
                Some(SegmentId::Participants)
            }
            WaveletOperation::BlipContent { blip_id, .. } => Some(SegmentId::blip(blip_id.clone())),
        }
    }

    /// Every segment affected, including the index for blip edits.
    pub fn touched_segments(&self) -> Vec<SegmentId> {
        match self.segment() {
            Some(segment @ SegmentId::Blip(_)) => vec![SegmentId::Index, segment],
            Some(segment) => vec![segment],
            None => Vec::new(),
        }
    }
}
