//! Periodic batch maintenance
//!
//! Batched writes below the capacity threshold stay in the batch buffer
//! until something pushes them out. The flusher is that something: an
//! interval task invoking `check_flush_batch_buffer` on every registered
//! connection, so a quiet connection's last few writes never sit in the
//! buffer indefinitely. The maintenance call only tries the write lock,
//! so the flusher never delays application writers.

use crate::channel::ConnectionId;
use crate::connection::Connection;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Interval task flushing idle batch buffers
pub struct BatchFlusher {
    connections: Arc<DashMap<ConnectionId, Weak<Connection>>>,
    shutdown: broadcast::Sender<()>,
}

impl BatchFlusher {
    /// Start the maintenance task with the given period
    pub fn start(period: Duration) -> Self {
        let connections: Arc<DashMap<ConnectionId, Weak<Connection>>> = Arc::new(DashMap::new());
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);

        let registered = Arc::clone(&connections);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registered.retain(|_, connection| match connection.upgrade() {
                            Some(connection) => {
                                connection.check_flush_batch_buffer();
                                true
                            }
                            // Dropped connections are pruned
                            None => false,
                        });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("batch flusher stopped");
        });

        Self {
            connections,
            shutdown,
        }
    }

    /// Register a connection for periodic maintenance
    ///
    /// The flusher holds the connection weakly and never keeps it alive.
    pub fn register(&self, connection: &Arc<Connection>) {
        self.connections
            .insert(connection.id(), Arc::downgrade(connection));
    }

    /// Stop maintaining a connection
    pub fn deregister(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Number of currently registered connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Stop the maintenance task
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for BatchFlusher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

impl std::fmt::Debug for BatchFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchFlusher")
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockChannel;
    use crate::channel::Channel;
    use crate::config::TransportConfig;
    use crate::listener::NoopLifecycleListener;
    use bytes::Bytes;

    fn batching_connection(channel: &Arc<MockChannel>) -> Arc<Connection> {
        Connection::new(
            Arc::clone(channel) as Arc<dyn Channel>,
            Arc::new(NoopLifecycleListener),
            &TransportConfig::default(),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_pushes_out_idle_batches() {
        let channel = MockChannel::new();
        let connection = batching_connection(&channel);

        let flusher = BatchFlusher::start(Duration::from_millis(50));
        flusher.register(&connection);

        connection
            .write_ext(Bytes::from_static(b"idle bytes"), false, true)
            .await
            .expect("batched write");
        assert!(channel.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..], b"idle bytes");

        flusher.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_prunes_dropped_connections() {
        let channel = MockChannel::new();
        let connection = batching_connection(&channel);

        let flusher = BatchFlusher::start(Duration::from_millis(10));
        flusher.register(&connection);
        assert_eq!(flusher.len(), 1);

        drop(connection);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(flusher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregistered_connection_is_left_alone() {
        let channel = MockChannel::new();
        let connection = batching_connection(&channel);

        let flusher = BatchFlusher::start(Duration::from_millis(10));
        flusher.register(&connection);
        flusher.deregister(connection.id());

        connection
            .write_ext(Bytes::from_static(b"kept"), false, true)
            .await
            .expect("batched write");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.sent().is_empty());
    }
}
