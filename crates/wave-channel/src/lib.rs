//! # wave-channel
//!
//! One logical connection carrying typed request/response and streaming
//! RPCs, correlated by sequence number.
//!
//! - [`protocol`]: message types and the `{sequenceNumber, messageType,
//!   message}` envelope
//! - [`transport`]: the [`Connector`] seam plus an in-memory implementation
//! - [`websocket`]: the WebSocket implementation
//! - [`channel`]: [`TransportChannel`], which reconnects on its own, falls
//!   back to a secondary connector after repeated failures, and queues
//!   outgoing requests while disconnected
//! - [`service`]: [`ViewService`], the typed view/submission RPCs

pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod websocket;

pub use channel::{ConnectionEvent, ConnectionState, TransportChannel};
pub use config::{ChannelConfig, ChannelConfigBuilder};
pub use error::{ChannelError, ProtocolError, ServiceError, TransportError};
pub use protocol::{
    CloseWaveletChannelRequest, EmptyResponse, Envelope, FetchFragmentsRequest,
    FetchFragmentsResponse, FetchWaveViewRequest, FetchWaveViewResponse, Message,
    OpenWaveletChannelRequest, OpenWaveletChannelStream, RpcFinished, SubmitDeltaRequest,
    SubmitDeltaResponse, TransportAuthenticationRequest, WaveletView,
};
pub use service::{ViewService, WaveletSubscription, WaveletUpdate};
pub use transport::{Connection, Connector, FrameSink, FrameStream, MemoryAcceptor, MemoryConnector};
pub use websocket::{into_connection, WebSocketConnector};
