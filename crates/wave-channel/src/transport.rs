//! Transport abstractions.
//!
//! A [`Connector`] opens [`Connection`]s: a sink and a stream of text frames.
//! The channel neither knows nor cares whether frames travel over a
//! WebSocket or an in-process pipe.

use crate::error::TransportError;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Stream of incoming text frames. Ends when the peer goes away.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Outgoing half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An established link.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to a server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Attempt one connection.
    async fn connect(&self) -> Result<Connection, TransportError>;
}

/// Sink half of an in-process connection.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.tx
            .unbounded_send(frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.close_channel();
        Ok(())
    }
}

/// Server-side end of in-process connections.
pub type MemoryAcceptor = mpsc::UnboundedReceiver<Connection>;

/// In-process connector for tests and simulation.
///
/// Every successful `connect` hands the server half of a fresh pipe to the
/// paired [`MemoryAcceptor`]. The connector can be taken offline and can
/// sever live links to simulate network loss.
pub struct MemoryConnector {
    name: String,
    acceptor: mpsc::UnboundedSender<Connection>,
    online: AtomicBool,
    attempts: AtomicUsize,
    links: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl MemoryConnector {
    /// Create a connector and the acceptor its connections arrive on.
    pub fn new(name: impl Into<String>) -> (Arc<Self>, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded();
        let connector = Arc::new(Self {
            name: name.into(),
            acceptor: tx,
            online: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        });
        (connector, rx)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of connect attempts so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Drop every live link. Both ends observe their stream ending.
    pub fn sever(&self) {
        for tx in self.links.lock().drain(..) {
            tx.close_channel();
        }
    }
}

fn pipe() -> (MemorySink, FrameStream, mpsc::UnboundedSender<String>) {
    let (tx, rx) = mpsc::unbounded::<String>();
    let handle = tx.clone();
    (MemorySink { tx }, rx.map(Ok).boxed(), handle)
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_online() {
            return Err(TransportError::ConnectFailed(format!("{} is offline", self.name)));
        }

        let (client_sink, server_stream, upstream) = pipe();
        let (server_sink, client_stream, downstream) = pipe();

        self.acceptor
            .unbounded_send(Connection {
                sink: Box::new(server_sink),
                stream: server_stream,
            })
            .map_err(|_| TransportError::ConnectFailed(format!("{} has no listener", self.name)))?;

        self.links.lock().extend([upstream, downstream]);
        Ok(Connection {
            sink: Box::new(client_sink),
            stream: client_stream,
        })
    }
}
