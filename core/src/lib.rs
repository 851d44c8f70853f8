//! # VeloxMQ Transport Library
//!
//! The client/server transport layer of the VeloxMQ message broker. This
//! crate provides the managed connection abstraction sitting between the
//! broker/protocol layer and the asynchronous network transport.
//!
//! ## Features
//!
//! - **Ordered Writes**: concurrent writers are serialized onto one
//!   ordered byte stream; whatever acquires the write lock first hits
//!   the wire first
//! - **Write Batching**: small writes coalesce into configurable batches
//!   for throughput, with a periodic flusher covering idle buffers
//! - **Bounded Flush**: latency-sensitive writes can await transmission,
//!   capped at 10 seconds and never failing the call on timeout
//! - **Backpressure**: watermark-based writability transitions fan out
//!   to registered listeners
//! - **Graceful Shutdown**: idempotent close with bounded TLS teardown
//!   and channel close, notifying the lifecycle listener exactly once
//! - **TLS**: rustls-based acceptor and connector material
//! - **Observability**: tracing instrumentation and atomic transport
//!   metrics
//!
//! Payloads are opaque bytes: framing and wire-protocol encoding belong
//! to the protocol layer above this crate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use veloxmq::{Connector, ConnectorConfig, TransportConfig};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> veloxmq::Result<()> {
//!     let connector = Connector::new(TransportConfig::default());
//!     let target = ConnectorConfig::new("localhost", 9092);
//!
//!     let (connection, mut inbound) = connector.connect(&target).await?;
//!
//!     // Immediate send
//!     connection.write(Bytes::from_static(b"hello broker")).await?;
//!
//!     // Batched sends, pushed out by capacity, flush or the flusher
//!     connection
//!         .write_ext(Bytes::from_static(b"coalesced"), false, true)
//!         .await?;
//!     connection
//!         .write_ext(Bytes::from_static(b"urgent"), true, false)
//!         .await?;
//!
//!     if let Some(reply) = inbound.recv().await {
//!         println!("received {} bytes", reply.len());
//!     }
//!
//!     connection.close().await;
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod flusher;
pub mod listener;
pub mod metrics;
pub mod tls;

pub use acceptor::{Acceptor, ConnectionRegistry};
pub use buffer::{BufferPool, BufferPoolStats};
pub use channel::{Channel, ConnectionId, SendJob};
pub use config::{ConnectorConfig, TransportConfig};
pub use connection::Connection;
pub use connector::Connector;
pub use error::VeloxmqError;
pub use flusher::BatchFlusher;
pub use listener::{LifecycleListener, NoopLifecycleListener, ReadyListener};
pub use metrics::{global_metrics, MetricsSnapshot, TransportMetrics};
pub use tls::{TlsClientConfig, TlsServerConfig, VeloxTlsAcceptor, VeloxTlsConnector};

/// Transport library result type
pub type Result<T> = std::result::Result<T, VeloxmqError>;

/// Transport library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
