//! The multiplexed, reconnecting transport channel.
//!
//! All channel state (connection state, pending-request table, outgoing
//! queue) lives inside one actor task. [`TransportChannel`] handles talk to
//! it over a command queue, so requests are processed strictly in call order
//! and no lock guards the tables.
//!
//! ```text
//!  request()/open_stream()/post() ──► commands ──► ┌──────────────┐ ──► sink
//!                                                  │ ChannelActor │
//!  oneshot / stream receivers  ◄── pending table ◄─ └──────────────┘ ◄── stream
//!                                                         ▲
//!                                        reconnect ticker ┘
//! ```

use crate::config::ChannelConfig;
use crate::error::{ChannelError, TransportError};
use crate::protocol::{Envelope, Message, RpcFinished, TransportAuthenticationRequest};
use crate::transport::{Connection, Connector};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Connection state, owned by the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events broadcast to connection listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Disconnected,
    /// The server ended the session. Carries the error text.
    Finished(String),
}

enum ResponseHandler {
    Single(oneshot::Sender<Result<Message, ChannelError>>),
    Stream(mpsc::UnboundedSender<Message>),
    /// Fire-and-forget: the reply is consumed silently.
    Discard,
}

enum Command {
    Connect,
    Send {
        message: Message,
        handler: ResponseHandler,
    },
    Shutdown,
}

type PendingAttempt = BoxFuture<'static, Result<Connection, TransportError>>;

/// Handle to a running channel. Cheap to clone.
#[derive(Clone)]
pub struct TransportChannel {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl TransportChannel {
    /// Start the channel actor. Nothing connects until [`connect`](Self::connect).
    pub fn spawn(
        config: ChannelConfig,
        primary: Arc<dyn Connector>,
        fallback: Option<Arc<dyn Connector>>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let actor = ChannelActor {
            config,
            primary,
            fallback,
            commands: commands_rx,
            state: state_tx,
            events: events_tx.clone(),
            next_sequence: 1,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            link: None,
            attempt: None,
            wanted: false,
            failures: 0,
            on_fallback: false,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
        }
    }

    /// Start connecting and keep reconnecting whenever the link drops.
    /// Idempotent.
    pub fn connect(&self) -> Result<(), ChannelError> {
        self.commands
            .send(Command::Connect)
            .map_err(|_| ChannelError::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the channel reports [`ConnectionState::Connected`].
    pub async fn wait_connected(&self) -> Result<(), ChannelError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .map(|_| ())
            .map_err(|_| ChannelError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Whether the actor has stopped (shutdown or session finished).
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Send a request expecting exactly one response.
    ///
    /// The request is queued when this is called, not when the returned
    /// future is first polled, so call order is wire order. A request written
    /// to a link that then drops fails with [`ChannelError::Disconnected`].
    pub fn request(
        &self,
        message: Message,
    ) -> impl Future<Output = Result<Message, ChannelError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let submitted = self.submit(message, ResponseHandler::Single(tx));
        async move {
            submitted?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Closed),
            }
        }
    }

    /// Send a streaming request. The receiver yields every message for the
    /// request, terminator included, then ends. It also ends if the link
    /// drops after the request was written.
    pub fn open_stream(
        &self,
        message: Message,
    ) -> Result<mpsc::UnboundedReceiver<Message>, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.submit(message, ResponseHandler::Stream(tx))?;
        Ok(rx)
    }

    /// Send a message whose reply is not needed.
    pub fn post(&self, message: Message) -> Result<(), ChannelError> {
        self.submit(message, ResponseHandler::Discard)
    }

    /// Stop the actor. Pending requests fail with [`ChannelError::Closed`].
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn submit(&self, message: Message, handler: ResponseHandler) -> Result<(), ChannelError> {
        self.commands
            .send(Command::Send { message, handler })
            .map_err(|_| ChannelError::Closed)
    }
}

struct ChannelActor {
    config: ChannelConfig,
    primary: Arc<dyn Connector>,
    fallback: Option<Arc<dyn Connector>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    next_sequence: i32,
    pending: HashMap<i32, ResponseHandler>,
    queue: VecDeque<(i32, String)>,
    link: Option<Connection>,
    attempt: Option<PendingAttempt>,
    /// `connect` has been called; reconnect whenever disconnected.
    wanted: bool,
    failures: u32,
    on_fallback: bool,
}

async fn next_attempt(attempt: &mut Option<PendingAttempt>) -> Result<Connection, TransportError> {
    match attempt {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<Connection>) -> Option<Result<String, TransportError>> {
    match link {
        Some(connection) => connection.stream.next().await,
        None => std::future::pending().await,
    }
}

impl ChannelActor {
    async fn run(mut self) {
        let period = Duration::from_millis(self.config.reconnect_interval_ms.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => self.on_connect_requested(),
                    Some(Command::Send { message, handler }) => self.send(message, handler).await,
                    Some(Command::Shutdown) | None => {
                        self.shutdown().await;
                        break;
                    }
                },
                result = next_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_attempt_finished(result).await;
                }
                frame = next_frame(&mut self.link) => match frame {
                    Some(Ok(frame)) => {
                        if self.on_frame(&frame).await.is_break() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "receive failed");
                        self.link_lost();
                    }
                    None => self.link_lost(),
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
        debug!("channel actor stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // No listeners is fine.
        let _ = self.events.send(event);
    }

    fn allocate_sequence(&mut self) -> i32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }

    fn current_connector(&self) -> Arc<dyn Connector> {
        match (&self.fallback, self.on_fallback) {
            (Some(fallback), true) => fallback.clone(),
            _ => self.primary.clone(),
        }
    }

    fn on_connect_requested(&mut self) {
        self.wanted = true;
        self.maybe_start_attempt();
    }

    fn on_tick(&mut self) {
        if self.wanted {
            self.maybe_start_attempt();
        }
    }

    fn maybe_start_attempt(&mut self) {
        if self.link.is_some() || self.attempt.is_some() {
            return;
        }
        let connector = self.current_connector();
        debug!(connector = connector.name(), "connecting");
        self.set_state(ConnectionState::Connecting);
        self.emit(ConnectionEvent::Connecting);
        self.attempt = Some(async move { connector.connect().await }.boxed());
    }

    async fn on_attempt_finished(&mut self, result: Result<Connection, TransportError>) {
        match result {
            Ok(connection) => {
                self.failures = 0;
                self.link = Some(connection);
                self.set_state(ConnectionState::Connected);
                info!(
                    connector = self.current_connector().name(),
                    queued = self.queue.len(),
                    "connected"
                );

                self.authenticate().await;
                self.flush().await;
                if self.link.is_some() {
                    self.emit(ConnectionEvent::Connected);
                }
            }
            Err(err) => {
                self.failures += 1;
                warn!(
                    connector = self.current_connector().name(),
                    failures = self.failures,
                    error = %err,
                    "connect attempt failed"
                );
                if !self.on_fallback
                    && self.fallback.is_some()
                    && self.failures >= self.config.fallback_after_failures
                {
                    self.on_fallback = true;
                    info!(
                        connector = self.current_connector().name(),
                        "switching to fallback transport"
                    );
                }
                self.set_state(ConnectionState::Disconnected);
                self.emit(ConnectionEvent::Disconnected);
            }
        }
    }

    /// Re-send the session credential on the fresh link.
    async fn authenticate(&mut self) {
        let Some(token) = self.config.session_token.clone() else {
            return;
        };
        let sequence = self.allocate_sequence();
        let message = Message::TransportAuthenticationRequest(TransportAuthenticationRequest { token });
        let frame = match Envelope::new(sequence, message).encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode authentication request");
                return;
            }
        };
        self.pending.insert(sequence, ResponseHandler::Discard);
        if let Err(err) = self.transmit(frame).await {
            warn!(error = %err, "authentication send failed");
            self.pending.remove(&sequence);
            self.link_lost();
        }
    }

    /// Send everything queued while disconnected, oldest first.
    async fn flush(&mut self) {
        while let Some((sequence, frame)) = self.queue.pop_front() {
            if self.link.is_none() {
                self.queue.push_front((sequence, frame));
                return;
            }
            if let Err(err) = self.transmit(frame.clone()).await {
                warn!(sequence, error = %err, "flush failed, requeueing");
                self.queue.push_front((sequence, frame));
                self.link_lost();
                return;
            }
            debug!(sequence, "flushed queued message");
        }
    }

    async fn transmit(&mut self, frame: String) -> Result<(), TransportError> {
        match self.link.as_mut() {
            Some(connection) => connection.sink.send(frame).await,
            None => Err(TransportError::Closed),
        }
    }

    async fn send(&mut self, message: Message, handler: ResponseHandler) {
        let sequence = self.allocate_sequence();
        let message_type = message.type_name();
        let frame = match Envelope::new(sequence, message).encode() {
            Ok(frame) => frame,
            Err(err) => {
                if let ResponseHandler::Single(tx) = handler {
                    let _ = tx.send(Err(err.into()));
                }
                return;
            }
        };
        self.pending.insert(sequence, handler);

        if self.link.is_none() {
            debug!(sequence, message_type, "queued while disconnected");
            self.queue.push_back((sequence, frame));
            return;
        }
        if let Err(err) = self.transmit(frame.clone()).await {
            warn!(sequence, message_type, error = %err, "send failed, requeueing");
            self.queue.push_back((sequence, frame));
            self.link_lost();
        }
    }

    fn link_lost(&mut self) {
        if self.link.take().is_none() {
            return;
        }
        let dropped = self.fail_in_flight();
        info!(dropped, queued = self.queue.len(), "disconnected");
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected);
    }

    /// Fail every request already written to the lost link. The next session
    /// never answers those sequence numbers; queued messages keep their entries.
    fn fail_in_flight(&mut self) -> usize {
        let queued: HashSet<i32> = self.queue.iter().map(|(sequence, _)| *sequence).collect();
        let in_flight: Vec<i32> = self
            .pending
            .keys()
            .copied()
            .filter(|sequence| !queued.contains(sequence))
            .collect();

        for sequence in &in_flight {
            match self.pending.remove(sequence) {
                Some(ResponseHandler::Single(tx)) => {
                    let _ = tx.send(Err(ChannelError::Disconnected));
                }
                Some(ResponseHandler::Stream(_)) => debug!(sequence, "ending stream"),
                Some(ResponseHandler::Discard) | None => {}
            }
        }
        in_flight.len()
    }

    async fn on_frame(&mut self, frame: &str) -> ControlFlow<()> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return ControlFlow::Continue(());
            }
        };

        match envelope.message {
            Message::RpcFinished(finished) => {
                self.finish(finished).await;
                ControlFlow::Break(())
            }
            message => {
                self.dispatch(envelope.sequence_number, message);
                ControlFlow::Continue(())
            }
        }
    }

    fn dispatch(&mut self, sequence: i32, message: Message) {
        let open_ended = message.is_streaming() && !message.is_terminal();
        match self.pending.remove(&sequence) {
            None => warn!(
                sequence,
                message_type = message.type_name(),
                "no pending request for response"
            ),
            Some(ResponseHandler::Single(tx)) => {
                let _ = tx.send(Ok(message));
            }
            Some(ResponseHandler::Discard) => {}
            Some(ResponseHandler::Stream(tx)) => {
                let delivered = tx.send(message).is_ok();
                if delivered && open_ended {
                    self.pending.insert(sequence, ResponseHandler::Stream(tx));
                }
            }
        }
    }

    async fn finish(&mut self, finished: RpcFinished) {
        let reason = finished
            .error_text
            .unwrap_or_else(|| "session finished".to_string());
        warn!(reason = %reason, failed = finished.failed, "session finished by server");

        for (_, handler) in self.pending.drain() {
            if let ResponseHandler::Single(tx) = handler {
                let _ = tx.send(Err(ChannelError::Finished(reason.clone())));
            }
        }
        self.queue.clear();
        self.close_link().await;
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Finished(reason));
    }

    async fn shutdown(&mut self) {
        info!(pending = self.pending.len(), "shutting down channel");
        self.pending.clear();
        self.queue.clear();
        self.close_link().await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn close_link(&mut self) {
        if let Some(mut connection) = self.link.take() {
            let _ = connection.sink.close().await;
        }
    }
}
