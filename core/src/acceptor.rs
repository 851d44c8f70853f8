//! Inbound connection acceptance and bookkeeping

use crate::buffer::BufferPool;
use crate::channel::tcp::TcpChannel;
use crate::channel::{Channel, ConnectionId};
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::listener::LifecycleListener;
use crate::tls::VeloxTlsAcceptor;
use crate::Result;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::info;

/// Live-connection bookkeeping
///
/// Acts as the lifecycle listener for the connections it tracks: a
/// destroyed connection removes itself here. An optional delegate
/// receives the same notification afterwards.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    delegate: Option<Arc<dyn LifecycleListener>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward destruction notifications to `delegate` after removal
    pub fn with_delegate(delegate: Arc<dyn LifecycleListener>) -> Self {
        Self {
            connections: DashMap::new(),
            delegate: Some(delegate),
        }
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(&entry))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Close every tracked connection
    pub async fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(&entry))
            .collect();
        for connection in connections {
            connection.close().await;
        }
    }
}

impl LifecycleListener for ConnectionRegistry {
    fn connection_destroyed(&self, id: ConnectionId) {
        self.connections.remove(&id);
        if let Some(delegate) = &self.delegate {
            delegate.connection_destroyed(id);
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}

/// Accepts inbound transport connections
pub struct Acceptor {
    listener: TcpListener,
    tls: Option<VeloxTlsAcceptor>,
    config: TransportConfig,
    pool: Arc<BufferPool>,
    registry: Arc<ConnectionRegistry>,
}

impl Acceptor {
    /// Bind to `addr` with default bookkeeping
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: TransportConfig) -> Result<Self> {
        Self::bind_with_registry(addr, config, Arc::new(ConnectionRegistry::new())).await
    }

    /// Bind to `addr`, tracking accepted connections in `registry`
    pub async fn bind_with_registry<A: ToSocketAddrs>(
        addr: A,
        config: TransportConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let pool = Arc::new(BufferPool::new(config.batch_size, 64));
        info!("listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            tls: None,
            config,
            pool,
            registry,
        })
    }

    /// Require a TLS handshake on every accepted stream
    pub fn with_tls(mut self, tls: VeloxTlsAcceptor) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept the next inbound connection
    ///
    /// Returns the managed connection and the inbound byte stream read
    /// from the peer. The connection is registered before it is returned.
    pub async fn accept(&self) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<Bytes>)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let channel: Arc<dyn Channel> = match &self.tls {
            Some(tls) => {
                let tls_stream = tls.accept(stream).await?;
                TcpChannel::spawn(
                    tls_stream,
                    Some(peer),
                    true,
                    &self.config,
                    Arc::clone(&self.pool),
                    inbound_tx,
                )
            }
            None => TcpChannel::spawn(
                stream,
                Some(peer),
                false,
                &self.config,
                Arc::clone(&self.pool),
                inbound_tx,
            ),
        };

        let connection = Connection::new(
            channel,
            Arc::clone(&self.registry) as Arc<dyn LifecycleListener>,
            &self.config,
            None,
        );
        self.registry.insert(Arc::clone(&connection));

        info!(connection = %connection.id(), peer = %peer, "accepted connection");
        Ok((connection, inbound_rx))
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
