//! # wave-server
//!
//! Authoritative host for wavelets. A [`WaveServer`] keeps one reconciler
//! per wavelet, answers view and fragment fetches, applies submitted deltas
//! and streams each transformed delta to every other open channel on the
//! wavelet while acknowledging the submitter.
//!
//! Connections come from anywhere that yields a
//! [`Connection`](wave_channel::Connection): in-process pipes for tests and
//! simulation, or WebSockets via [`WaveServer::listen`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use wave_channel::MemoryConnector;
//! use wave_server::{ServerConfig, WaveServer};
//!
//! # async fn run() {
//! let server = WaveServer::new(ServerConfig::default());
//! let (connector, acceptor) = MemoryConnector::new("in-process");
//! server.serve(acceptor);
//! # let _ = connector;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod server;
mod wavelet;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::{Result, ServerError};
pub use server::WaveServer;
