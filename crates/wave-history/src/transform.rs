//! Operational transformation of wavelet operations.
//!
//! A [`Transformer`] takes two operation sequences that were both produced
//! against the same state and rewrites each so it can be applied after the
//! other. For sequences `c` and `s` with `(c', s') = transform(c, s)`,
//! applying `s` then `c'` must give the same state as applying `c` then `s'`.

use crate::error::TransformError;
use wave_core::{DocOp, WaveletOperation};

/// Pluggable transform function used by the reconciler.
pub trait Transformer: Send + Sync {
    /// Transform concurrent `client` and `server` operation sequences.
    ///
    /// Returns `(client', server')` where `client'` applies after `server`
    /// and `server'` applies after `client`. Server operations win ties.
    fn transform(
        &self,
        client: &[WaveletOperation],
        server: &[WaveletOperation],
    ) -> Result<(Vec<WaveletOperation>, Vec<WaveletOperation>), TransformError>;
}

/// Character-position transform for blip text plus set semantics for the
/// participant list.
///
/// Operations never disappear: an operation cancelled by a concurrent one
/// becomes [`WaveletOperation::NoOp`], so every delta keeps its length and
/// the version arithmetic stays intact.
#[derive(Clone, Copy, Debug, Default)]
pub struct PositionalTransformer;

impl PositionalTransformer {
    pub fn new() -> Self {
        Self
    }
}

impl Transformer for PositionalTransformer {
    fn transform(
        &self,
        client: &[WaveletOperation],
        server: &[WaveletOperation],
    ) -> Result<(Vec<WaveletOperation>, Vec<WaveletOperation>), TransformError> {
        let mut client_out = client.to_vec();
        let mut server_out = Vec::with_capacity(server.len());

        for server_op in server {
            let mut server_op = server_op.clone();
            for client_op in client_out.iter_mut() {
                let client_next = transform_op(client_op, &server_op, false);
                let server_next = transform_op(&server_op, client_op, true);
                *client_op = client_next;
                server_op = server_next;
            }
            server_out.push(server_op);
        }

        Ok((client_out, server_out))
    }
}

/// Rewrite `op` so it applies after `against`. `op_wins` breaks ties between
/// inserts at the same position and between conflicting participant edits.
fn transform_op(op: &WaveletOperation, against: &WaveletOperation, op_wins: bool) -> WaveletOperation {
    use WaveletOperation::*;

    match (op, against) {
        (NoOp, _) | (_, NoOp) => op.clone(),
        (AddParticipant { participant: a }, AddParticipant { participant: b })
        | (RemoveParticipant { participant: a }, RemoveParticipant { participant: b })
            if a == b =>
        {
            NoOp
        }
        (AddParticipant { participant: a }, RemoveParticipant { participant: b })
        | (RemoveParticipant { participant: a }, AddParticipant { participant: b })
            if a == b =>
        {
            if op_wins {
                op.clone()
            } else {
                NoOp
            }
        }
        (
            BlipContent { blip_id, op: doc },
            BlipContent {
                blip_id: other_blip,
                op: other_doc,
            },
        ) if blip_id == other_blip => match transform_doc(doc, other_doc, op_wins) {
            Some(doc) => BlipContent {
                blip_id: blip_id.clone(),
                op: doc,
            },
            None => NoOp,
        },
        _ => op.clone(),
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Transform a text edit against a concurrent edit of the same blip.
/// `None` means the edit no longer has any effect.
fn transform_doc(op: &DocOp, against: &DocOp, op_wins: bool) -> Option<DocOp> {
    match (op, against) {
        (DocOp::Insert { position, text }, DocOp::Insert { position: other, text: other_text }) => {
            let shifted = if *other < *position || (*other == *position && !op_wins) {
                position + char_len(other_text)
            } else {
                *position
            };
            Some(DocOp::insert(shifted, text.clone()))
        }
        (DocOp::Insert { position, text }, DocOp::Delete { position: other, len }) => {
            if *position <= *other {
                Some(op.clone())
            } else if *position >= other + len {
                Some(DocOp::insert(position - len, text.clone()))
            } else {
                // The insertion point was deleted.
                None
            }
        }
        (DocOp::Delete { position, len }, DocOp::Insert { position: other, text }) => {
            let inserted = char_len(text);
            if *other <= *position {
                Some(DocOp::delete(position + inserted, *len))
            } else if *other < position + len {
                Some(DocOp::delete(*position, len + inserted))
            } else {
                Some(op.clone())
            }
        }
        (DocOp::Delete { position, len }, DocOp::Delete { position: other, len: other_len }) => {
            let (start, end) = (*position, position + len);
            let (other_start, other_end) = (*other, other + other_len);

            let overlap = end.min(other_end).saturating_sub(start.max(other_start));
            let remaining = len - overlap;
            if remaining == 0 {
                return None;
            }
            let new_start = if other_start < start {
                start - (start.min(other_end) - other_start)
            } else {
                start
            };
            Some(DocOp::delete(new_start, remaining))
        }
    }
}
