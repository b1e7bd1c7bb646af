//! High-level client for Wavesync.

use crate::config::ClientConfig;
use crate::error::{Result, SdkError};
use crate::store::MemoryWaveletStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wave_channel::{
    ConnectionEvent, Connector, ServiceError, SubmitDeltaResponse, TransportChannel, ViewService,
    WaveletSubscription,
};
use wave_core::{
    HashedVersion, ParticipantId, SegmentId, StatusCode, WaveletDelta, WaveletId,
    WaveletOperation,
};
use wave_fragments::{FragmentScheduler, SegmentStore};

/// Notification that a wavelet's local copy moved to a new version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaveletChanged {
    pub wavelet_id: WaveletId,
    pub version: HashedVersion,
}

struct OpenWavelet {
    channel_id: String,
    pump: JoinHandle<()>,
}

struct Shared {
    config: ClientConfig,
    service: ViewService,
    scheduler: FragmentScheduler,
    store: Arc<MemoryWaveletStore>,
    open: Mutex<HashMap<WaveletId, OpenWavelet>>,
    changes: broadcast::Sender<WaveletChanged>,
    closed: AtomicBool,
}

/// A connected client: open wavelets stay live, and their segments load on
/// demand.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use wave_channel::WebSocketConnector;
/// use wave_core::{SegmentId, WaveletId, WaveletOperation};
/// use wave_sdk::{Client, ClientConfigBuilder};
///
/// # async fn run() -> wave_sdk::Result<()> {
/// let config = ClientConfigBuilder::new().participant("alice@example.com").build();
/// let client = Client::connect(
///     config,
///     Arc::new(WebSocketConnector::new("ws://127.0.0.1:9898")),
///     None,
/// )
/// .await?;
///
/// let wavelet = WaveletId::new("example.com!w+1", "conv+root");
/// client.open_wavelet(&wavelet).await?;
/// client
///     .submit(&wavelet, vec![WaveletOperation::insert("b+1", 0, "Hello")])
///     .await?;
/// client.load_segments(&wavelet, vec![SegmentId::blip("b+1")])?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    shared: Arc<Shared>,
    lifecycle: JoinHandle<()>,
}

impl Client {
    /// Start a channel, wait for the first connection and build the
    /// client around it.
    pub async fn connect(
        config: ClientConfig,
        primary: Arc<dyn Connector>,
        fallback: Option<Arc<dyn Connector>>,
    ) -> Result<Self> {
        let channel = TransportChannel::spawn(config.channel.clone(), primary, fallback);
        let events = channel.subscribe();
        channel.connect().map_err(ServiceError::from)?;
        channel.wait_connected().await.map_err(ServiceError::from)?;

        let service = ViewService::new(channel);
        let store = Arc::new(MemoryWaveletStore::new());
        let scheduler = FragmentScheduler::new(
            config.fragments.clone(),
            Arc::new(service.clone()),
            store.clone() as Arc<dyn SegmentStore>,
        );
        let (changes, _) = broadcast::channel(config.channel.event_capacity.max(1));

        info!(participant = %config.participant, "client connected");
        let shared = Arc::new(Shared {
            config,
            service,
            scheduler,
            store,
            open: Mutex::new(HashMap::new()),
            changes,
            closed: AtomicBool::new(false),
        });
        let lifecycle = tokio::spawn(watch_connection(shared.clone(), events));
        Ok(Self { shared, lifecycle })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.shared.config.participant
    }

    pub fn store(&self) -> &Arc<MemoryWaveletStore> {
        &self.shared.store
    }

    pub fn service(&self) -> &ViewService {
        &self.shared.service
    }

    pub fn channel(&self) -> &TransportChannel {
        self.shared.service.channel()
    }

    pub fn scheduler(&self) -> &FragmentScheduler {
        &self.shared.scheduler
    }

    /// Listen for local version changes.
    pub fn changes(&self) -> broadcast::Receiver<WaveletChanged> {
        self.shared.changes.subscribe()
    }

    pub fn is_open(&self, wavelet_id: &WaveletId) -> bool {
        self.shared.open.lock().contains_key(wavelet_id)
    }

    /// Open a live channel on a wavelet and start loading its index and
    /// participants. Returns the version the local copy starts from.
    pub async fn open_wavelet(&self, wavelet_id: &WaveletId) -> Result<HashedVersion> {
        self.shared.ensure_running()?;
        if self.is_open(wavelet_id) {
            if let Some(version) = self.shared.store.version(wavelet_id) {
                return Ok(version);
            }
        }
        self.shared.open_channel(wavelet_id, None).await
    }

    /// Submit operations against the local version and record the
    /// acknowledgement.
    pub async fn submit(
        &self,
        wavelet_id: &WaveletId,
        ops: Vec<WaveletOperation>,
    ) -> Result<SubmitDeltaResponse> {
        let shared = &self.shared;
        shared.ensure_running()?;
        let channel_id = shared
            .open
            .lock()
            .get(wavelet_id)
            .map(|open| open.channel_id.clone())
            .ok_or_else(|| SdkError::NotOpen(wavelet_id.clone()))?;
        let target = shared
            .store
            .version(wavelet_id)
            .ok_or_else(|| SdkError::NotOpen(wavelet_id.clone()))?;

        let author = shared.config.participant.clone();
        let delta = WaveletDelta::new(author.clone(), target.clone(), ops.clone());
        let response = shared
            .service
            .submit_delta(&channel_id, wavelet_id.clone(), delta)
            .await?;

        if let Some(resulting) = response.hashed_version_after_application.clone() {
            let timestamp = response.timestamp_after_application.unwrap_or_default();
            let evicted =
                shared
                    .store
                    .acknowledge(wavelet_id, &author, &target, ops, resulting, timestamp);
            queue_segments(&shared.scheduler, &shared.store, wavelet_id, evicted)?;
            shared.notify(wavelet_id);
        }
        Ok(response)
    }

    /// Ask for segments to be fetched. Segments already held are skipped.
    /// Stops early once the scheduler is full; returns how many were queued.
    pub fn load_segments(&self, wavelet_id: &WaveletId, segments: Vec<SegmentId>) -> Result<usize> {
        self.shared.ensure_running()?;
        if !self.shared.store.is_open(wavelet_id) {
            return Err(SdkError::NotOpen(wavelet_id.clone()));
        }
        Ok(queue_segments(
            &self.shared.scheduler,
            &self.shared.store,
            wavelet_id,
            segments,
        )?)
    }

    /// Load every blip listed in the resident index.
    pub fn load_all_blips(&self, wavelet_id: &WaveletId) -> Result<usize> {
        let blips = self.shared.store.blips(wavelet_id).unwrap_or_default();
        self.load_segments(wavelet_id, blips.into_keys().map(SegmentId::blip).collect())
    }

    /// Close the wavelet's channel and drop its local copy.
    pub async fn close_wavelet(&self, wavelet_id: &WaveletId) -> Result<()> {
        let open = self
            .shared
            .open
            .lock()
            .remove(wavelet_id)
            .ok_or_else(|| SdkError::NotOpen(wavelet_id.clone()))?;
        open.pump.abort();
        self.shared.store.forget(wavelet_id);
        self.shared
            .service
            .close_wavelet_channel(&open.channel_id)
            .await?;
        debug!(wavelet = %wavelet_id, channel = %open.channel_id, "wavelet closed");
        Ok(())
    }

    pub fn version(&self, wavelet_id: &WaveletId) -> Option<HashedVersion> {
        self.shared.store.version(wavelet_id)
    }

    /// Text of a resident blip.
    pub fn text(&self, wavelet_id: &WaveletId, blip_id: &str) -> Option<String> {
        self.shared.store.text(wavelet_id, blip_id)
    }

    pub fn participants(&self, wavelet_id: &WaveletId) -> Option<Vec<ParticipantId>> {
        self.shared.store.participants(wavelet_id)
    }

    /// Whether the session is over, by shutdown or by the server.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stop every task and the channel.
    pub fn shutdown(&self) {
        self.lifecycle.abort();
        self.shared.finish();
        self.shared.service.channel().shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn ensure_running(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SdkError::Closed)
        } else {
            Ok(())
        }
    }

    fn notify(&self, wavelet_id: &WaveletId) {
        if let Some(version) = self.store.version(wavelet_id) {
            let _ = self.changes.send(WaveletChanged {
                wavelet_id: wavelet_id.clone(),
                version,
            });
        }
    }

    /// Open a channel. With `known` the server replays what we missed;
    /// without it the local copy starts fresh at the server head.
    async fn open_channel(
        self: &Arc<Self>,
        wavelet_id: &WaveletId,
        known: Option<HashedVersion>,
    ) -> Result<HashedVersion> {
        let subscription = self
            .service
            .open_wavelet_channel(wavelet_id.clone(), known.clone())
            .await?;

        if known.is_none() {
            let head = subscription
                .version
                .clone()
                .ok_or(SdkError::Service(ServiceError::StreamEnded))?;
            self.store.open(wavelet_id, head);
            self.scheduler.new_request(wavelet_id)?;
            queue_segments(
                &self.scheduler,
                &self.store,
                wavelet_id,
                vec![SegmentId::Index, SegmentId::Participants],
            )?;
        }

        let channel_id = subscription.channel_id.clone();
        debug!(wavelet = %wavelet_id, channel = %channel_id, resumed = known.is_some(), "wavelet channel open");
        let pump = tokio::spawn(pump_updates(self.clone(), subscription));
        if let Some(previous) = self
            .open
            .lock()
            .insert(wavelet_id.clone(), OpenWavelet { channel_id, pump })
        {
            previous.pump.abort();
        }
        self.store
            .version(wavelet_id)
            .ok_or_else(|| SdkError::NotOpen(wavelet_id.clone()))
    }

    /// Reopen every wavelet after the link came back, catching up from the
    /// local version. A wavelet the server can no longer replay for starts
    /// over and reloads the segments it held.
    async fn resume(self: &Arc<Self>) {
        let wavelets: Vec<WaveletId> = self.open.lock().keys().cloned().collect();
        for wavelet_id in wavelets {
            let known = self.store.version(&wavelet_id);
            let reopened = match self.open_channel(&wavelet_id, known).await {
                Err(SdkError::Service(ServiceError::Status(status)))
                    if matches!(status.code, StatusCode::TooOld | StatusCode::VersionError) =>
                {
                    warn!(wavelet = %wavelet_id, %status, "cannot catch up, reloading wavelet");
                    let held = self.store.forget(&wavelet_id);
                    match self.open_channel(&wavelet_id, None).await {
                        Ok(_) => queue_segments(&self.scheduler, &self.store, &wavelet_id, held)
                            .map(|_| ())
                            .map_err(SdkError::from),
                        Err(err) => Err(err),
                    }
                }
                Ok(_) => {
                    let loading = self.store.loading_segments(&wavelet_id);
                    queue_segments(&self.scheduler, &self.store, &wavelet_id, loading)
                        .map(|_| ())
                        .map_err(SdkError::from)
                }
                Err(err) => Err(err),
            };
            match reopened {
                Ok(()) => self.notify(&wavelet_id),
                Err(err) => warn!(wavelet = %wavelet_id, error = %err, "failed to reopen wavelet"),
            }
        }
    }

    fn finish(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.scheduler.close();
        for (_, open) in self.open.lock().drain() {
            open.pump.abort();
        }
    }
}

/// Mark segments as loading and queue them for one fetch pass.
fn queue_segments(
    scheduler: &FragmentScheduler,
    store: &MemoryWaveletStore,
    wavelet_id: &WaveletId,
    segments: Vec<SegmentId>,
) -> wave_fragments::Result<usize> {
    if segments.is_empty() {
        return Ok(0);
    }
    let mut queued = 0;
    for segment in segments {
        if scheduler.is_full()? {
            debug!(wavelet = %wavelet_id, queued, "fragment scheduler full");
            break;
        }
        if !store.mark_loading(wavelet_id, &segment) {
            continue;
        }
        if scheduler.add_segment(wavelet_id, segment, 0)? {
            queued += 1;
        }
    }
    scheduler.schedule_request()?;
    Ok(queued)
}

/// Apply a channel's updates to the store until the channel ends.
async fn pump_updates(shared: Arc<Shared>, mut subscription: WaveletSubscription) {
    let wavelet_id = subscription.wavelet_id.clone();
    while let Some(update) = subscription.next_update().await {
        let update = match update {
            Ok(update) => update,
            Err(err) => {
                warn!(wavelet = %wavelet_id, error = %err, "wavelet channel failed");
                return;
            }
        };
        let Some(delta) = update.delta else {
            continue;
        };
        let evicted = shared.store.apply_update(&wavelet_id, delta);
        if let Err(err) = queue_segments(&shared.scheduler, &shared.store, &wavelet_id, evicted) {
            debug!(wavelet = %wavelet_id, error = %err, "cannot refetch evicted segments");
        }
        shared.notify(&wavelet_id);
    }
    debug!(wavelet = %wavelet_id, channel = %subscription.channel_id, "wavelet channel ended");
}

/// Follow connection events: drop fetches when the link goes, catch up
/// when it returns, stop when the server ends the session.
async fn watch_connection(shared: Arc<Shared>, mut events: broadcast::Receiver<ConnectionEvent>) {
    let mut dropped = false;
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Disconnected) => {
                dropped = true;
                shared.scheduler.reset();
            }
            Ok(ConnectionEvent::Connected) if dropped => {
                dropped = false;
                info!("connection restored, resuming wavelets");
                shared.resume().await;
            }
            Ok(ConnectionEvent::Finished(reason)) => {
                warn!(%reason, "session finished by server");
                shared.finish();
                return;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "connection events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
