//! Fragment fetch scheduler.
//!
//! Callers describe which segments they want with
//! [`new_request`](FragmentScheduler::new_request) and
//! [`add_segment`](FragmentScheduler::add_segment), then call
//! [`schedule_request`](FragmentScheduler::schedule_request). A deferred pass
//! turns each wavelet's batch into one fetch, keeping at most
//! `max_in_flight` fetches outstanding. A segment that is already being
//! fetched is not queued again until its reply lands.

use crate::config::FragmentConfig;
use crate::error::{FragmentError, Result};
use crate::source::{FragmentFetcher, SegmentStore};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wave_channel::{FetchFragmentsRequest, FetchFragmentsResponse, ServiceError};
use wave_core::{SegmentId, WaveletId};

/// Notification that fetched fragments were applied to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentsUpdated {
    pub wavelet_id: WaveletId,
    pub segments: Vec<SegmentId>,
}

#[derive(Default)]
struct SchedulerState {
    /// Per wavelet, segment -> creation version, waiting for the next pass.
    pending: BTreeMap<WaveletId, BTreeMap<SegmentId, u64>>,
    /// Segments requested and not yet answered.
    awaiting: HashSet<(WaveletId, SegmentId)>,
    in_flight: usize,
    armed: Option<JoinHandle<()>>,
    /// Bumped on reset so replies to older fetches are ignored.
    generation: u64,
    closed: bool,
}

impl SchedulerState {
    fn queued(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.awaiting.clear();
        self.in_flight = 0;
        if let Some(task) = self.armed.take() {
            task.abort();
        }
        self.generation += 1;
    }
}

struct Inner {
    config: FragmentConfig,
    fetcher: Arc<dyn FragmentFetcher>,
    store: Arc<dyn SegmentStore>,
    state: Mutex<SchedulerState>,
    updates: broadcast::Sender<SegmentsUpdated>,
}

struct Batch {
    wavelet_id: WaveletId,
    segments: BTreeMap<SegmentId, u64>,
    generation: u64,
}

/// Batches, deduplicates and rate-limits fragment fetches.
#[derive(Clone)]
pub struct FragmentScheduler {
    inner: Arc<Inner>,
}

impl FragmentScheduler {
    pub fn new(
        config: FragmentConfig,
        fetcher: Arc<dyn FragmentFetcher>,
        store: Arc<dyn SegmentStore>,
    ) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                store,
                state: Mutex::new(SchedulerState::default()),
                updates,
            }),
        }
    }

    pub fn config(&self) -> &FragmentConfig {
        &self.inner.config
    }

    /// Listen for applied fragments.
    pub fn subscribe(&self) -> broadcast::Receiver<SegmentsUpdated> {
        self.inner.updates.subscribe()
    }

    /// Open a batch for `wavelet_id`, discarding anything already queued
    /// for it.
    pub fn new_request(&self, wavelet_id: &WaveletId) -> Result<()> {
        let mut state = self.inner.lock_open()?;
        state.pending.insert(wavelet_id.clone(), BTreeMap::new());
        Ok(())
    }

    /// Queue a segment. Returns `false` when the segment is already being
    /// fetched and was not queued.
    pub fn add_segment(
        &self,
        wavelet_id: &WaveletId,
        segment: SegmentId,
        creation_version: u64,
    ) -> Result<bool> {
        let mut state = self.inner.lock_open()?;
        if state.awaiting.contains(&(wavelet_id.clone(), segment.clone())) {
            debug!(wavelet = %wavelet_id, %segment, "segment already in flight");
            return Ok(false);
        }
        state
            .pending
            .entry(wavelet_id.clone())
            .or_default()
            .insert(segment, creation_version);
        Ok(true)
    }

    /// Whether enough segments are queued that callers should stop adding.
    pub fn is_full(&self) -> Result<bool> {
        let state = self.inner.lock_open()?;
        Ok(state.queued() >= self.inner.config.max_queued_segments)
    }

    /// Arm the deferred pass unless it is already armed or nothing is queued.
    pub fn schedule_request(&self) -> Result<()> {
        let mut state = self.inner.lock_open()?;
        if state.armed.is_some() || state.queued() == 0 {
            return Ok(());
        }

        let inner = self.inner.clone();
        let delay = self.inner.config.schedule_delay_ms;
        // Spawned under the lock so the task cannot disarm before it is
        // recorded as armed.
        state.armed = Some(tokio::spawn(async move {
            if delay == 0 {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            inner.state.lock().armed = None;
            Inner::run_pass(&inner);
        }));
        Ok(())
    }

    /// Forget all batches and outstanding fetches. Replies to fetches issued
    /// before the reset are ignored.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        debug!(
            queued = state.queued(),
            in_flight = state.in_flight,
            "resetting fragment scheduler"
        );
        state.clear();
    }

    /// Reset and refuse all further calls.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.clear();
        state.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queued()
    }

    /// Whether a fetch for the segment is outstanding.
    pub fn is_awaiting(&self, wavelet_id: &WaveletId, segment: &SegmentId) -> bool {
        self.inner
            .state
            .lock()
            .awaiting
            .contains(&(wavelet_id.clone(), segment.clone()))
    }
}

impl Inner {
    fn lock_open(&self) -> Result<parking_lot::MutexGuard<'_, SchedulerState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(FragmentError::Closed);
        }
        Ok(state)
    }

    /// One scheduling pass: start fetches for queued wavelets while below
    /// the in-flight cap.
    fn run_pass(inner: &Arc<Inner>) {
        let batches = {
            let mut state = inner.state.lock();
            if state.closed {
                return;
            }
            state.pending.retain(|_, segments| !segments.is_empty());

            let mut batches = Vec::new();
            while state.in_flight < inner.config.max_in_flight {
                let Some(wavelet_id) = state.pending.keys().next().cloned() else {
                    break;
                };
                let segments = state.pending.remove(&wavelet_id).unwrap_or_default();
                for segment in segments.keys() {
                    state.awaiting.insert((wavelet_id.clone(), segment.clone()));
                }
                state.in_flight += 1;
                batches.push(Batch {
                    wavelet_id,
                    segments,
                    generation: state.generation,
                });
            }
            batches
        };

        for batch in batches {
            let request = inner.build_request(&batch);
            debug!(
                wavelet = %batch.wavelet_id,
                segments = request.start_versions.len(),
                end_version = request.end_version,
                "issuing fragment fetch"
            );
            let task_inner = inner.clone();
            tokio::spawn(async move {
                let result = task_inner.fetcher.fetch_fragments(request).await;
                Inner::complete(&task_inner, batch, result);
            });
        }
    }

    fn build_request(&self, batch: &Batch) -> FetchFragmentsRequest {
        let wavelet_id = &batch.wavelet_id;
        let open = self.store.open_version(wavelet_id).unwrap_or(0);
        let end_version = match self.store.desired_version(wavelet_id) {
            Some(desired) if desired > open => desired,
            _ => open,
        };

        let start_versions = batch
            .segments
            .iter()
            .map(|(segment, _)| {
                // Unknown or stale start: fetch a fresh snapshot at the end version.
                let start = self
                    .store
                    .segment_start_version(wavelet_id, segment)
                    .filter(|start| *start <= end_version)
                    .unwrap_or(end_version);
                (segment.clone(), start)
            })
            .collect();

        FetchFragmentsRequest {
            wavelet_id: wavelet_id.clone(),
            start_versions,
            end_version,
            min_reply_size: self.config.min_reply_size,
            max_reply_size: self.config.max_reply_size,
            max_blips: self.config.max_blips,
        }
    }

    fn complete(
        inner: &Arc<Inner>,
        batch: Batch,
        result: std::result::Result<FetchFragmentsResponse, ServiceError>,
    ) {
        let Batch {
            wavelet_id,
            segments,
            generation,
        } = batch;

        {
            let mut state = inner.state.lock();
            if state.closed || state.generation != generation {
                debug!(wavelet = %wavelet_id, "ignoring reply to a fetch from before reset");
                return;
            }
            state.in_flight = state.in_flight.saturating_sub(1);
            for segment in segments.keys() {
                state.awaiting.remove(&(wavelet_id.clone(), segment.clone()));
            }
        }

        match result {
            Ok(response) => {
                let mut updated = Vec::new();
                for (segment, fragment) in response.fragments {
                    if !segments.contains_key(&segment) {
                        debug!(wavelet = %wavelet_id, %segment, "ignoring unrequested fragment");
                        continue;
                    }
                    inner.store.apply_fragment(&wavelet_id, &segment, fragment);
                    updated.push(segment);
                }

                let missing: Vec<_> = segments
                    .keys()
                    .filter(|segment| !updated.contains(segment))
                    .map(ToString::to_string)
                    .collect();
                if !missing.is_empty() {
                    // Not requeued; a later add_segment retries.
                    warn!(wavelet = %wavelet_id, ?missing, "fetch reply omitted segments");
                }

                if !updated.is_empty() {
                    let _ = inner.updates.send(SegmentsUpdated {
                        wavelet_id,
                        segments: updated,
                    });
                }
            }
            Err(err) => {
                // Not requeued; a later add_segment retries.
                warn!(
                    wavelet = %wavelet_id,
                    segments = segments.len(),
                    error = %err,
                    "fragment fetch failed"
                );
            }
        }

        Inner::run_pass(inner);
    }
}
