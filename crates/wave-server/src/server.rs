//! The authoritative server.
//!
//! ```text
//! Client A ──┐                          ┌── OpenWaveletChannelStream ──▶ Client B
//!            ├── WaveServer ── HostedWavelet (Reconciler + segment logs)
//! Client B ──┘                          └── SubmitDeltaResponse ───────▶ Client A
//! ```
//!
//! Each connection gets a reader loop and a writer task. All wavelet state
//! lives behind one lock, and every reply or fan-out message is queued on
//! the receiving connection's outbox while that lock is held, so each
//! connection observes deltas in the order they were applied.

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::wavelet::HostedWavelet;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ulid::Ulid;
use wave_channel::{
    into_connection, CloseWaveletChannelRequest, Connection, EmptyResponse, Envelope,
    FetchFragmentsRequest, FetchFragmentsResponse, FetchWaveViewRequest, FetchWaveViewResponse,
    Message, OpenWaveletChannelRequest, OpenWaveletChannelStream, RpcFinished,
    SubmitDeltaRequest, SubmitDeltaResponse,
};
use wave_core::{
    Clock, HashedVersion, ReturnStatus, SegmentId, SegmentSnapshot, StatusCode, SystemClock,
    WaveletId,
};
use wave_history::{HashedVersionFactory, PositionalTransformer, Sha256VersionFactory, Transformer};

/// Sequence number used for unsolicited messages.
const UNSOLICITED: i32 = 0;

enum Outgoing {
    Frame(Envelope),
    Close,
}

struct Peer {
    outbox: mpsc::UnboundedSender<Outgoing>,
    authenticated: bool,
    finished: bool,
}

impl Peer {
    fn send(&self, sequence: i32, message: Message) {
        let _ = self
            .outbox
            .send(Outgoing::Frame(Envelope::new(sequence, message)));
    }

    /// Send `RpcFinished` and close the link once it is flushed.
    fn finish(&mut self, reason: &str) {
        self.send(
            UNSOLICITED,
            Message::RpcFinished(RpcFinished {
                failed: true,
                error_text: Some(reason.to_string()),
            }),
        );
        let _ = self.outbox.send(Outgoing::Close);
        self.finished = true;
    }
}

struct OpenChannel {
    wavelet_id: WaveletId,
    peer: u64,
    /// Sequence number of the open request; stream messages reuse it.
    sequence: i32,
}

/// Pluggable pieces every hosted wavelet is built from.
#[derive(Clone)]
struct Components {
    transformer: Arc<dyn Transformer>,
    factory: Arc<dyn HashedVersionFactory>,
    clock: Arc<dyn Clock>,
}

impl Components {
    fn host(&self, wavelet_id: WaveletId) -> HostedWavelet {
        HostedWavelet::new(
            wavelet_id,
            self.transformer.clone(),
            self.factory.clone(),
            self.clock.clone(),
        )
    }
}

#[derive(Default)]
struct ServerState {
    wavelets: BTreeMap<WaveletId, HostedWavelet>,
    peers: HashMap<u64, Peer>,
    channels: HashMap<String, OpenChannel>,
    next_peer: u64,
}

/// Reply shape for a request the server refuses before looking at it.
fn refusal(request: &Message, status: ReturnStatus) -> Option<Message> {
    let reply = match request {
        Message::FetchWaveViewRequest(_) => Message::FetchWaveViewResponse(FetchWaveViewResponse {
            status,
            wavelets: Vec::new(),
        }),
        Message::FetchFragmentsRequest(_) => {
            Message::FetchFragmentsResponse(FetchFragmentsResponse {
                status,
                fragments: BTreeMap::new(),
                version: None,
            })
        }
        Message::OpenWaveletChannelRequest(_) => {
            Message::OpenWaveletChannelStream(OpenWaveletChannelStream::terminated(status))
        }
        Message::SubmitDeltaRequest(_) => {
            Message::SubmitDeltaResponse(SubmitDeltaResponse::failed(status))
        }
        Message::CloseWaveletChannelRequest(_) | Message::TransportAuthenticationRequest(_) => {
            Message::EmptyResponse(EmptyResponse { status })
        }
        _ => return None,
    };
    Some(reply)
}

impl ServerState {
    fn send(&self, peer: u64, sequence: i32, message: Message) {
        if let Some(peer) = self.peers.get(&peer) {
            peer.send(sequence, message);
        }
    }

    fn fetch_wave_view(&self, request: &FetchWaveViewRequest) -> Message {
        let wavelets = self
            .wavelets
            .values()
            .filter(|wavelet| wavelet.wavelet_id().wave == request.wave_id)
            .map(HostedWavelet::view)
            .collect();
        Message::FetchWaveViewResponse(FetchWaveViewResponse {
            status: ReturnStatus::ok(),
            wavelets,
        })
    }

    fn fetch_fragments(&self, request: &FetchFragmentsRequest) -> Message {
        let response = match self.wavelets.get(&request.wavelet_id) {
            Some(wavelet) => FetchFragmentsResponse {
                status: ReturnStatus::ok(),
                fragments: wavelet.fetch(request),
                version: Some(wavelet.head().clone()),
            },
            None => FetchFragmentsResponse {
                status: ReturnStatus::error(
                    StatusCode::NotExists,
                    format!("unknown wavelet {}", request.wavelet_id),
                ),
                fragments: BTreeMap::new(),
                version: None,
            },
        };
        Message::FetchFragmentsResponse(response)
    }

    fn open(
        &mut self,
        components: &Components,
        peer: u64,
        sequence: i32,
        request: OpenWaveletChannelRequest,
    ) {
        let wavelet = self
            .wavelets
            .entry(request.wavelet_id.clone())
            .or_insert_with(|| {
                info!(wavelet = %request.wavelet_id, "hosting new wavelet");
                components.host(request.wavelet_id.clone())
            });

        let catch_up = match &request.known_version {
            Some(known) => match wavelet.deltas_since(known) {
                Ok(deltas) => deltas,
                Err(err) => {
                    debug!(wavelet = %request.wavelet_id, error = %err, "cannot catch up");
                    let status = ReturnStatus::error(err.status_code(), err.to_string());
                    self.send(
                        peer,
                        sequence,
                        Message::OpenWaveletChannelStream(OpenWaveletChannelStream::terminated(
                            status,
                        )),
                    );
                    return;
                }
            },
            None => Vec::new(),
        };

        let channel_id = Ulid::new().to_string();
        wavelet.subscribers.insert(channel_id.clone());
        let head = wavelet.head().clone();
        self.channels.insert(
            channel_id.clone(),
            OpenChannel {
                wavelet_id: request.wavelet_id.clone(),
                peer,
                sequence,
            },
        );
        info!(
            peer,
            wavelet = %request.wavelet_id,
            channel = %channel_id,
            head = %head.short(),
            catch_up = catch_up.len(),
            "opened wavelet channel"
        );

        self.send(
            peer,
            sequence,
            Message::OpenWaveletChannelStream(OpenWaveletChannelStream::opened(channel_id, head)),
        );
        for delta in catch_up {
            self.send(
                peer,
                sequence,
                Message::OpenWaveletChannelStream(OpenWaveletChannelStream::update(delta)),
            );
        }
    }

    fn submit(&mut self, peer: u64, request: SubmitDeltaRequest) -> Message {
        let failed = |code: StatusCode, message: String| {
            Message::SubmitDeltaResponse(SubmitDeltaResponse::failed(ReturnStatus::error(
                code, message,
            )))
        };

        match self.channels.get(&request.channel_id) {
            None => {
                return failed(
                    StatusCode::Unsubscribed,
                    format!("unknown channel {}", request.channel_id),
                )
            }
            Some(channel) if channel.peer != peer || channel.wavelet_id != request.wavelet_id => {
                return failed(
                    StatusCode::BadRequest,
                    format!("channel {} is not open on {}", request.channel_id, request.wavelet_id),
                )
            }
            Some(_) => {}
        }
        let Some(wavelet) = self.wavelets.get_mut(&request.wavelet_id) else {
            return failed(
                StatusCode::NotExists,
                format!("unknown wavelet {}", request.wavelet_id),
            );
        };

        let reconciled = match wavelet.apply(request.delta) {
            Ok(reconciled) => reconciled,
            Err(err) => {
                warn!(
                    wavelet = %request.wavelet_id,
                    channel = %request.channel_id,
                    error = %err,
                    "rejected delta"
                );
                return failed(err.status_code(), err.to_string());
            }
        };

        if reconciled.duplicate {
            debug!(
                wavelet = %request.wavelet_id,
                resulting = %reconciled.delta.resulting_version.short(),
                "acknowledging resubmitted delta"
            );
        } else {
            for other in wavelet
                .subscribers
                .iter()
                .filter(|channel_id| **channel_id != request.channel_id)
            {
                if let Some(channel) = self.channels.get(other) {
                    if let Some(observer) = self.peers.get(&channel.peer) {
                        observer.send(
                            channel.sequence,
                            Message::OpenWaveletChannelStream(OpenWaveletChannelStream::update(
                                reconciled.delta.clone(),
                            )),
                        );
                    }
                }
            }
        }

        let delta = reconciled.delta;
        Message::SubmitDeltaResponse(SubmitDeltaResponse {
            status: ReturnStatus::ok(),
            operations_applied: delta.ops.len() as u32,
            hashed_version_after_application: Some(delta.resulting_version),
            timestamp_after_application: Some(delta.application_timestamp),
        })
    }

    fn close(&mut self, peer: u64, sequence: i32, request: CloseWaveletChannelRequest) {
        let owned = matches!(
            self.channels.get(&request.channel_id),
            Some(channel) if channel.peer == peer
        );
        let status = match self.channels.remove(&request.channel_id) {
            Some(channel) if owned => {
                if let Some(wavelet) = self.wavelets.get_mut(&channel.wavelet_id) {
                    wavelet.subscribers.remove(&request.channel_id);
                }
                debug!(peer, channel = %request.channel_id, "closed wavelet channel");
                self.send(
                    peer,
                    channel.sequence,
                    Message::OpenWaveletChannelStream(OpenWaveletChannelStream::terminated(
                        ReturnStatus::ok(),
                    )),
                );
                ReturnStatus::ok()
            }
            Some(channel) => {
                // Belongs to another connection; put it back.
                self.channels.insert(request.channel_id.clone(), channel);
                ReturnStatus::error(StatusCode::NotAuthorized, "channel belongs to another session")
            }
            None => ReturnStatus::error(
                StatusCode::Unsubscribed,
                format!("unknown channel {}", request.channel_id),
            ),
        };
        self.send(peer, sequence, Message::EmptyResponse(EmptyResponse { status }));
    }

    fn disconnect(&mut self, peer: u64) {
        self.peers.remove(&peer);
        let wavelets = &mut self.wavelets;
        self.channels.retain(|channel_id, channel| {
            if channel.peer != peer {
                return true;
            }
            if let Some(wavelet) = wavelets.get_mut(&channel.wavelet_id) {
                wavelet.subscribers.remove(channel_id);
            }
            false
        });
    }
}

struct Inner {
    config: ServerConfig,
    components: Components,
    state: Mutex<ServerState>,
}

impl Inner {
    fn register(&self, outbox: mpsc::UnboundedSender<Outgoing>) -> u64 {
        let mut state = self.state.lock();
        state.next_peer += 1;
        let id = state.next_peer;
        state.peers.insert(
            id,
            Peer {
                outbox,
                authenticated: self.config.session_token.is_none(),
                finished: false,
            },
        );
        id
    }

    /// Handle one request. Returns `false` once the connection should stop
    /// reading.
    fn dispatch(&self, peer_id: u64, envelope: Envelope) -> bool {
        let Envelope {
            sequence_number: sequence,
            message,
        } = envelope;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(peer) = state.peers.get_mut(&peer_id) else {
            return false;
        };
        if peer.finished {
            return false;
        }

        if let Message::TransportAuthenticationRequest(auth) = &message {
            match &self.config.session_token {
                Some(expected) if *expected != auth.token => {
                    warn!(peer = peer_id, "rejected session token");
                    peer.finish("authentication failed");
                    return false;
                }
                _ => {
                    peer.authenticated = true;
                    peer.send(sequence, Message::EmptyResponse(EmptyResponse::default()));
                    return true;
                }
            }
        }

        if !peer.authenticated {
            debug!(peer = peer_id, message_type = message.type_name(), "request before login");
            let status = ReturnStatus::error(StatusCode::NotLoggedIn, "authenticate first");
            if let Some(reply) = refusal(&message, status) {
                peer.send(sequence, reply);
            }
            return true;
        }

        debug!(peer = peer_id, sequence, message_type = message.type_name(), "request");
        match message {
            Message::FetchWaveViewRequest(request) => {
                let reply = state.fetch_wave_view(&request);
                state.send(peer_id, sequence, reply);
            }
            Message::FetchFragmentsRequest(request) => {
                let reply = state.fetch_fragments(&request);
                state.send(peer_id, sequence, reply);
            }
            Message::OpenWaveletChannelRequest(request) => {
                state.open(&self.components, peer_id, sequence, request);
            }
            Message::SubmitDeltaRequest(request) => {
                let reply = state.submit(peer_id, request);
                state.send(peer_id, sequence, reply);
            }
            Message::CloseWaveletChannelRequest(request) => {
                state.close(peer_id, sequence, request);
            }
            other => {
                warn!(
                    peer = peer_id,
                    message_type = other.type_name(),
                    "ignoring message a client should not send"
                );
            }
        }
        true
    }

    fn disconnect(&self, peer_id: u64) {
        self.state.lock().disconnect(peer_id);
    }

    async fn run_connection(self: Arc<Self>, connection: Connection) {
        let Connection {
            mut sink,
            mut stream,
        } = connection;
        let (outbox, mut outgoing) = mpsc::unbounded_channel();
        let peer_id = self.register(outbox);
        info!(peer = peer_id, "connection accepted");

        let writer = tokio::spawn(async move {
            while let Some(next) = outgoing.recv().await {
                match next {
                    Outgoing::Frame(envelope) => {
                        let frame = match envelope.encode() {
                            Ok(frame) => frame,
                            Err(err) => {
                                error!(peer = peer_id, error = %err, "failed to encode reply");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(frame).await {
                            debug!(peer = peer_id, error = %err, "send failed");
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(peer = peer_id, error = %err, "connection lost");
                    break;
                }
            };
            match Envelope::decode(&frame) {
                Ok(envelope) => {
                    if !self.dispatch(peer_id, envelope) {
                        break;
                    }
                }
                Err(err) => warn!(peer = peer_id, error = %err, "dropping malformed frame"),
            }
        }

        self.disconnect(peer_id);
        let _ = writer.await;
        info!(peer = peer_id, "connection closed");
    }
}

/// Hosts wavelets and serves clients over any [`Connection`].
#[derive(Clone)]
pub struct WaveServer {
    inner: Arc<Inner>,
}

impl WaveServer {
    /// A server with the positional transformer, SHA-256 version hashes and
    /// the system clock.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_components(
            config,
            Arc::new(PositionalTransformer),
            Arc::new(Sha256VersionFactory),
            Arc::new(SystemClock),
        )
    }

    pub fn with_components(
        config: ServerConfig,
        transformer: Arc<dyn Transformer>,
        factory: Arc<dyn HashedVersionFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                components: Components {
                    transformer,
                    factory,
                    clock,
                },
                state: Mutex::new(ServerState::default()),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Serve one connection until it closes.
    pub fn accept(&self, connection: Connection) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(inner.run_connection(connection))
    }

    /// Serve every connection yielded by `connections`, e.g. a
    /// [`MemoryAcceptor`](wave_channel::MemoryAcceptor).
    pub fn serve<S>(&self, mut connections: S) -> JoinHandle<()>
    where
        S: Stream<Item = Connection> + Send + Unpin + 'static,
    {
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(connection) = connections.next().await {
                server.accept(connection);
            }
        })
    }

    /// Accept WebSocket connections on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local = listener.local_addr()?;
        info!(addr = %local, "listening for websocket connections");

        let server = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!(error = %err, "accept failed");
                        break;
                    }
                };
                let server = server.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(socket) => {
                            debug!(%remote, "websocket handshake complete");
                            let _ = server.accept(into_connection(socket)).await;
                        }
                        Err(err) => warn!(%remote, error = %err, "websocket handshake failed"),
                    }
                });
            }
        });
        Ok((local, task))
    }

    /// End every session with `RpcFinished`.
    pub fn terminate(&self, reason: &str) {
        let mut state = self.inner.state.lock();
        info!(connections = state.peers.len(), reason, "terminating all sessions");
        for peer in state.peers.values_mut() {
            if !peer.finished {
                peer.finish(reason);
            }
        }
    }

    /// Roll a wavelet back to `version`, as after a restart that lost
    /// unpersisted history.
    pub fn truncate_at(&self, wavelet_id: &WaveletId, version: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let wavelet = state
            .wavelets
            .get_mut(wavelet_id)
            .ok_or_else(|| ServerError::UnknownWavelet(wavelet_id.clone()))?;
        wavelet.truncate_at(version)?;
        Ok(())
    }

    pub fn head(&self, wavelet_id: &WaveletId) -> Option<HashedVersion> {
        let state = self.inner.state.lock();
        state.wavelets.get(wavelet_id).map(|w| w.head().clone())
    }

    /// Segment content at the head.
    pub fn snapshot(&self, wavelet_id: &WaveletId, segment: &SegmentId) -> Option<SegmentSnapshot> {
        let state = self.inner.state.lock();
        state.wavelets.get(wavelet_id).map(|w| {
            let head = w.head().version;
            w.snapshot(segment, head)
        })
    }

    pub fn history_len(&self, wavelet_id: &WaveletId) -> Option<usize> {
        let state = self.inner.state.lock();
        state.wavelets.get(wavelet_id).map(HostedWavelet::history_len)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().peers.len()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }
}
