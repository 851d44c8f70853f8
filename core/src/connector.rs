//! Outbound connection establishment

use crate::buffer::BufferPool;
use crate::channel::tcp::TcpChannel;
use crate::channel::Channel;
use crate::config::{ConnectorConfig, TransportConfig};
use crate::connection::Connection;
use crate::error::VeloxmqError;
use crate::listener::{LifecycleListener, NoopLifecycleListener};
use crate::tls::VeloxTlsConnector;
use crate::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

/// Factory for outbound connections
///
/// Holds the transport configuration, buffer pool and lifecycle listener
/// shared by every connection it creates. Reconnect policy belongs to
/// the caller: a failed connection's `connector_config()` is enough to
/// ask the connector for an equivalent replacement.
pub struct Connector {
    config: TransportConfig,
    pool: Arc<BufferPool>,
    lifecycle: Arc<dyn LifecycleListener>,
    tls: Option<VeloxTlsConnector>,
}

impl Connector {
    pub fn new(config: TransportConfig) -> Self {
        let pool = Arc::new(BufferPool::new(config.batch_size, 64));
        Self {
            config,
            pool,
            lifecycle: Arc::new(NoopLifecycleListener),
            tls: None,
        }
    }

    /// Set the lifecycle listener new connections notify on destruction
    pub fn with_lifecycle_listener(mut self, lifecycle: Arc<dyn LifecycleListener>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Provide the TLS material used for targets with `ssl-enabled`
    pub fn with_tls(mut self, tls: VeloxTlsConnector) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Open a connection to `target`
    ///
    /// Returns the managed connection and the inbound byte stream read
    /// from the peer.
    pub async fn connect(
        &self,
        target: &ConnectorConfig,
    ) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<Bytes>)> {
        let address = target.address();
        debug!("connecting to {}", address);

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| VeloxmqError::timeout(self.config.connect_timeout.as_millis() as u64))?
            .map_err(|e| {
                VeloxmqError::connect(format!("failed to connect to {}: {}", address, e))
            })?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();

        let config = self.effective_config(target);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let channel: Arc<dyn Channel> = if target.ssl_enabled() {
            let tls = self.tls.as_ref().ok_or_else(|| {
                VeloxmqError::invalid_config(format!(
                    "target {} requires TLS but the connector has no TLS material",
                    address
                ))
            })?;
            let tls_stream = tls.connect(stream).await?;
            TcpChannel::spawn(
                tls_stream,
                peer,
                true,
                &config,
                Arc::clone(&self.pool),
                inbound_tx,
            )
        } else {
            TcpChannel::spawn(
                stream,
                peer,
                false,
                &config,
                Arc::clone(&self.pool),
                inbound_tx,
            )
        };

        let connection = Connection::new(
            channel,
            Arc::clone(&self.lifecycle),
            &config,
            Some(target.parameters().clone()),
        );

        info!(connection = %connection.id(), broker = %address, "connected");
        Ok((connection, inbound_rx))
    }

    /// Transport configuration with per-target parameter overrides applied
    fn effective_config(&self, target: &ConnectorConfig) -> TransportConfig {
        let mut config = self.config.clone();
        config.direct_deliver = target.direct_deliver();
        if let Some(batch_delay) = target.batch_delay() {
            config.batch_delay = batch_delay;
        }
        config
    }

    /// The buffer pool shared by this connector's connections
    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.pool)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.config.connect_timeout)
            .finish()
    }
}
