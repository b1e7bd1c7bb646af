//! Server-side reconciliation of client deltas.
//!
//! A client proposes a delta against some version it has seen. The
//! reconciler transforms it past everything applied since, appends the
//! result to the history and hands back the transformed delta for fan-out.

use crate::error::ReconcileError;
use crate::hash::HashedVersionFactory;
use crate::history::{DeltaHistory, MemoryDeltaHistory};
use crate::transform::Transformer;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, info};
use wave_core::{
    Clock, HashedVersion, TransformedWaveletDelta, WaveletDelta, WaveletDeltaRecord, WaveletId,
    WaveletOperation,
};

/// Outcome of reconciling one client delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciled {
    pub delta: TransformedWaveletDelta,
    /// The delta had already been applied; `delta` is the recorded result
    /// and nothing was appended.
    pub duplicate: bool,
}

/// Canonical bytes hashed into the resulting version.
pub fn canonical_encoding(
    author: &wave_core::ParticipantId,
    ops: &[WaveletOperation],
) -> Result<Vec<u8>, ReconcileError> {
    Ok(serde_json::to_vec(&(author, ops))?)
}

/// Transform `delta` against `history` without modifying it.
///
/// Deterministic: the same history and delta always yield the same
/// operations and resulting version. Only `application_timestamp` depends on
/// the caller.
pub fn transform_delta<H: DeltaHistory + ?Sized>(
    delta: &WaveletDelta,
    history: &H,
    transformer: &dyn Transformer,
    factory: &dyn HashedVersionFactory,
    timestamp: i64,
) -> Result<Reconciled, ReconcileError> {
    if delta.is_empty() {
        return Err(ReconcileError::EmptyDelta);
    }

    let head = history.current_version().clone();
    let target = &delta.target_version;
    if target.version > head.version {
        return Err(ReconcileError::FutureVersion {
            target: target.clone(),
            current: head,
        });
    }
    match history.signature_at(target.version) {
        Some(known) if known == target => {}
        Some(known) => {
            return Err(ReconcileError::HashMismatch {
                client: target.clone(),
                history: known.clone(),
            })
        }
        None => return Err(ReconcileError::UnknownVersion(target.clone())),
    }

    if let Some(record) = history.delta_starting_at(target.version) {
        if record.raw_applied_delta == *delta {
            debug!(
                target = %target.short(),
                resulting = %record.resulting_version.short(),
                "duplicate delta submission"
            );
            return Ok(Reconciled {
                delta: record.transformed_delta.clone(),
                duplicate: true,
            });
        }
    }

    let mut ops = delta.ops.clone();
    let mut reached = target.version;
    let mut failure = None;
    history.delta_history(target, &head, &mut |record| {
        match transformer.transform(&ops, &record.transformed_delta.ops) {
            Ok((client, _)) => {
                ops = client;
                reached = record.resulting_version.version;
                ControlFlow::Continue(())
            }
            Err(err) => {
                failure = Some(err);
                ControlFlow::Break(())
            }
        }
    })?;
    if let Some(err) = failure {
        return Err(err.into());
    }
    if reached != head.version {
        return Err(ReconcileError::HistoryGap { reached });
    }
    if ops.len() != delta.len() {
        return Err(crate::error::TransformError::CountChanged {
            before: delta.len(),
            after: ops.len(),
        }
        .into());
    }

    let applied = canonical_encoding(&delta.author, &ops)?;
    let resulting_version = factory.next_version(&head, &applied, ops.len() as u64);

    Ok(Reconciled {
        delta: TransformedWaveletDelta {
            author: delta.author.clone(),
            target_version: head,
            ops,
            resulting_version,
            application_timestamp: timestamp,
        },
        duplicate: false,
    })
}

/// Owns one wavelet's history and applies client deltas to it.
pub struct Reconciler<H: DeltaHistory = MemoryDeltaHistory> {
    wavelet_id: WaveletId,
    history: H,
    transformer: Arc<dyn Transformer>,
    factory: Arc<dyn HashedVersionFactory>,
    clock: Arc<dyn Clock>,
}

impl Reconciler<MemoryDeltaHistory> {
    /// Create a reconciler over an empty in-memory history.
    pub fn new(
        wavelet_id: WaveletId,
        transformer: Arc<dyn Transformer>,
        factory: Arc<dyn HashedVersionFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let version_zero = factory.version_zero(&wavelet_id);
        let history = MemoryDeltaHistory::new(wavelet_id.clone(), version_zero);
        Self::with_history(wavelet_id, history, transformer, factory, clock)
    }
}

impl<H: DeltaHistory> Reconciler<H> {
    pub fn with_history(
        wavelet_id: WaveletId,
        history: H,
        transformer: Arc<dyn Transformer>,
        factory: Arc<dyn HashedVersionFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            wavelet_id,
            history,
            transformer,
            factory,
            clock,
        }
    }

    pub fn wavelet_id(&self) -> &WaveletId {
        &self.wavelet_id
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn current_version(&self) -> &HashedVersion {
        self.history.current_version()
    }

    /// Reconcile a client delta and append the result.
    pub fn on_client_delta(&mut self, delta: WaveletDelta) -> Result<Reconciled, ReconcileError> {
        let reconciled = transform_delta(
            &delta,
            &self.history,
            self.transformer.as_ref(),
            self.factory.as_ref(),
            self.clock.now_millis(),
        )?;
        if reconciled.duplicate {
            return Ok(reconciled);
        }

        let transformed = reconciled.delta.clone();
        self.history
            .append(WaveletDeltaRecord::new(delta, transformed))?;

        info!(
            wavelet = %self.wavelet_id,
            author = %reconciled.delta.author,
            applied_at = %reconciled.delta.target_version.short(),
            resulting = %reconciled.delta.resulting_version.short(),
            ops = reconciled.delta.ops.len(),
            "applied delta"
        );
        Ok(reconciled)
    }

    /// Transformed deltas applied after `known`, in order. Used to catch up
    /// a client reopening a channel.
    pub fn deltas_since(
        &self,
        known: &HashedVersion,
    ) -> Result<Vec<TransformedWaveletDelta>, ReconcileError> {
        let head = self.history.current_version().clone();
        if known.version > head.version {
            return Err(ReconcileError::FutureVersion {
                target: known.clone(),
                current: head,
            });
        }
        let mut deltas = Vec::new();
        self.history.delta_history(known, &head, &mut |record| {
            deltas.push(record.transformed_delta.clone());
            ControlFlow::Continue(())
        })?;
        let reached = deltas
            .last()
            .map(|d| d.resulting_version.version)
            .unwrap_or(known.version);
        if reached != head.version {
            return Err(ReconcileError::HistoryGap { reached });
        }
        Ok(deltas)
    }

    /// Roll the history back to `version`.
    pub fn truncate_at(&mut self, version: u64) -> Result<(), ReconcileError> {
        self.history.truncate_at(version)?;
        info!(
            wavelet = %self.wavelet_id,
            version,
            "rolled back wavelet history"
        );
        Ok(())
    }
}
