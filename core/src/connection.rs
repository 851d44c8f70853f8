//! The managed connection abstraction
//!
//! A [`Connection`] sits between the broker/protocol layer and a
//! transport [`Channel`]. It serializes concurrent writers onto one
//! ordered byte stream, coalesces small writes into batches, supports an
//! awaitable bounded flush, forwards backpressure transitions to
//! registered listeners, and performs graceful, bounded-time shutdown
//! including TLS teardown.
//!
//! Writer ordering is decided at the write-serialization lock: whichever
//! caller acquires it first determines which bytes are composed first.
//! Transmission order is then guaranteed by the channel's execution
//! context, not by the lock.

use crate::channel::{Channel, ConnectionId, SendJob};
use crate::config::{ConnectorConfig, TransportConfig};
use crate::error::VeloxmqError;
use crate::listener::{LifecycleListener, ReadyListener, ReadyListenerSet};
use crate::metrics::global_metrics;
use crate::Result;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// A managed connection over one transport channel
pub struct Connection {
    id: ConnectionId,
    channel: Arc<dyn Channel>,
    state: AtomicU8,
    batching_enabled: bool,
    direct_deliver: bool,
    batch_size: usize,
    flush_timeout: Duration,
    shutdown_timeout: Duration,
    configuration: Option<HashMap<String, String>>,
    /// Write-serialization lock. The guarded value is the batch buffer,
    /// absent until a batched write lazily creates it. Holding the guard
    /// is what serializes writers; `try_lock` keeps the maintenance path
    /// from ever contending with them.
    batch: Mutex<Option<BytesMut>>,
    ready_listeners: ReadyListenerSet,
    lifecycle: Arc<dyn LifecycleListener>,
}

impl Connection {
    /// Wrap an established channel
    ///
    /// `configuration` is the opaque parameter map the connection was
    /// created from; it is only ever used to rebuild a
    /// [`ConnectorConfig`] for callers and is never read internally.
    pub fn new(
        channel: Arc<dyn Channel>,
        lifecycle: Arc<dyn LifecycleListener>,
        config: &TransportConfig,
        configuration: Option<HashMap<String, String>>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            id: channel.id(),
            channel,
            state: AtomicU8::new(STATE_OPEN),
            batching_enabled: config.batching_enabled,
            direct_deliver: config.direct_deliver,
            batch_size: config.batch_size,
            flush_timeout: config.flush_timeout,
            shutdown_timeout: config.shutdown_timeout,
            configuration,
            batch: Mutex::new(None),
            ready_listeners: ReadyListenerSet::new(),
            lifecycle,
        });

        let observed = Arc::downgrade(&connection);
        connection
            .channel
            .set_writability_observer(Box::new(move |ready| {
                if let Some(connection) = observed.upgrade() {
                    connection.fire_ready(ready);
                }
            }));

        global_metrics().record_connection_created();
        connection
    }

    /// Stable identifier, used to correlate lifecycle events
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Allocate a writable buffer from the transport's pooled allocator
    pub fn create_buffer(&self, size: usize) -> BytesMut {
        self.channel.alloc(size)
    }

    /// Peer address as text, `None` if not connected or already closed
    pub fn remote_address(&self) -> Option<String> {
        if self.is_closed() {
            return None;
        }
        self.channel.remote_address().map(|addr| addr.to_string())
    }

    /// Whether inbound data is meant to be delivered on the transport
    /// thread directly
    pub fn is_direct_deliver(&self) -> bool {
        self.direct_deliver
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_OPEN
    }

    /// Register a backpressure observer; safe from any task, including
    /// from inside a notification callback
    pub fn add_ready_listener(&self, listener: Arc<dyn ReadyListener>) {
        self.ready_listeners.add(listener);
    }

    /// Unregister a backpressure observer by identity
    pub fn remove_ready_listener(&self, listener: &Arc<dyn ReadyListener>) {
        self.ready_listeners.remove(listener);
    }

    /// Unconditional, immediate, non-batched send
    pub async fn write(&self, buffer: Bytes) -> Result<()> {
        self.write_ext(buffer, false, false).await
    }

    /// Write `buffer` to the connection
    ///
    /// With `batched` true the bytes may be absorbed into the batch
    /// buffer and transmitted later; with `flush` true the call waits up
    /// to the configured flush timeout for the transmission to complete.
    /// The wait is best effort (a timeout is logged, not returned) and is
    /// skipped when the caller already runs on the channel's own
    /// execution context.
    pub async fn write_ext(&self, buffer: Bytes, flush: bool, batched: bool) -> Result<()> {
        if self.is_closed() {
            return Err(VeloxmqError::ConnectionClosed);
        }

        let metrics = global_metrics();
        let mut batch = self.batch.lock().await;

        if batch.is_none() && self.batching_enabled && batched && !flush {
            // Lazily create the batch buffer
            *batch = Some(self.channel.alloc(self.batch_size));
        }

        let payload: Bytes = match batch.take() {
            Some(mut pending) => {
                pending.extend_from_slice(&buffer);

                if pending.len() < self.batch_size && batched && !flush {
                    // Still accumulating: the bytes are absorbed, not lost
                    *batch = Some(pending);
                    metrics.record_write_absorbed();
                    return Ok(());
                }

                // The accumulated batch becomes the payload. A terminal
                // send clears the buffer; otherwise a fresh one keeps
                // accumulating subsequent writes.
                if batched && !flush {
                    *batch = Some(self.channel.alloc(self.batch_size));
                }
                metrics.record_batch_flushed();
                pending.freeze()
            }
            None => buffer,
        };

        let payload_len = payload.len() as u64;
        let completion = if flush {
            let (tx, rx) = oneshot::channel();
            self.channel.dispatch(SendJob {
                payload,
                completion: Some(tx),
            });
            Some(rx)
        } else {
            self.channel.dispatch(SendJob::new(payload));
            None
        };
        metrics.record_send(payload_len);

        if let Some(completion) = completion {
            if !self.channel.is_on_channel_context() {
                match timeout(self.flush_timeout, completion).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => {
                        warn!(connection = %self.id, error = %e, "send failed during flush");
                    }
                    Ok(Err(_)) => {
                        // The transport dropped the completion signal
                        // while we were waiting on it
                        return Err(VeloxmqError::Interrupted);
                    }
                    Err(_) => {
                        metrics.record_flush_timeout();
                        warn!(connection = %self.id, "timed out waiting for write flush");
                    }
                }
            }
        }

        // Guard drop releases the write-serialization lock
        Ok(())
    }

    /// Periodic batch maintenance, intended for a timer external to
    /// application writers
    ///
    /// Never contends with an in-progress write: the lock is only tried,
    /// and on failure the call is a no-op.
    pub fn check_flush_batch_buffer(&self) {
        if !self.batching_enabled {
            return;
        }

        if let Ok(mut batch) = self.batch.try_lock() {
            if let Some(pending) = batch.as_mut() {
                if !pending.is_empty() {
                    let payload =
                        std::mem::replace(pending, self.channel.alloc(self.batch_size)).freeze();
                    let metrics = global_metrics();
                    metrics.record_batch_flushed();
                    metrics.record_send(payload.len() as u64);
                    self.channel.dispatch(SendJob::new(payload));
                }
            }
        }
    }

    /// Close the connection
    ///
    /// Idempotent and infallible: the first caller tears down the TLS
    /// session (bounded), closes the channel (bounded), marks the
    /// connection closed and notifies the lifecycle listener exactly
    /// once. Sub-step failures are logged and never prevent later steps.
    /// Subsequent calls are no-ops.
    pub async fn close(&self) {
        if self
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        if self.channel.has_active_tls_layer() {
            let teardown = self.channel.request_tls_shutdown();
            if timeout(self.shutdown_timeout, teardown).await.is_err() {
                warn!(connection = %self.id, "timed out waiting for TLS session shutdown");
            }
        }

        let closed = self.channel.begin_close();
        if timeout(self.shutdown_timeout, closed).await.is_err() {
            warn!(connection = %self.id, "timed out closing transport channel");
        }

        self.state.store(STATE_CLOSED, Ordering::Release);
        global_metrics().record_connection_closed();
        debug!(connection = %self.id, "connection destroyed");
        self.lifecycle.connection_destroyed(self.id);
    }

    /// Rebuild a connector descriptor for an equivalent outbound
    /// connection, or `None` if no configuration was supplied
    pub fn connector_config(&self) -> Option<ConnectorConfig> {
        self.configuration
            .as_ref()
            .map(|parameters| ConnectorConfig::from_parameters(parameters.clone()))
    }

    /// Deliver a readiness transition to every registered listener
    fn fire_ready(&self, ready: bool) {
        self.ready_listeners.notify(ready);
    }

    /// Size of the pending batch buffer, `None` when absent or when a
    /// write currently holds the lock
    #[cfg(test)]
    pub(crate) fn pending_batch_len(&self) -> Option<usize> {
        self.batch
            .try_lock()
            .ok()
            .and_then(|batch| batch.as_ref().map(BytesMut::len))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.channel.remote_address())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockChannel;
    use crate::listener::NoopLifecycleListener;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::task::JoinSet;
    use tokio::time::Instant;

    struct CountingLifecycle {
        destroyed: AtomicUsize,
        last_id: SyncMutex<Option<ConnectionId>>,
    }

    impl CountingLifecycle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                destroyed: AtomicUsize::new(0),
                last_id: SyncMutex::new(None),
            })
        }
    }

    impl LifecycleListener for CountingLifecycle {
        fn connection_destroyed(&self, id: ConnectionId) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            *self.last_id.lock() = Some(id);
        }
    }

    fn connection_over(
        channel: &Arc<MockChannel>,
        lifecycle: Arc<dyn LifecycleListener>,
        config: &TransportConfig,
    ) -> Arc<Connection> {
        Connection::new(
            Arc::clone(channel) as Arc<dyn Channel>,
            lifecycle,
            config,
            None,
        )
    }

    fn batching_config(batch_size: usize) -> TransportConfig {
        TransportConfig {
            batch_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unbatched_write_sends_immediately() {
        // Scenario A: batching disabled, plain write goes straight out
        let channel = MockChannel::new();
        let config = TransportConfig {
            batching_enabled: false,
            ..Default::default()
        };
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        connection
            .write(Bytes::from_static(b"ABC"))
            .await
            .expect("write");

        assert_eq!(channel.sent(), vec![Bytes::from_static(b"ABC")]);
        assert_eq!(connection.pending_batch_len(), None);
    }

    #[tokio::test]
    async fn test_batched_writes_accumulate_until_flush() {
        // Scenario B: sub-capacity batched writes transmit nothing until
        // a flush, which sends the accumulated bytes as one payload
        let channel = MockChannel::new();
        let config = batching_config(8192);
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        let hundred = Bytes::from(vec![0xAB; 100]);
        connection
            .write_ext(hundred.clone(), false, true)
            .await
            .expect("first batched write");
        connection
            .write_ext(hundred.clone(), false, true)
            .await
            .expect("second batched write");

        assert!(channel.sent().is_empty());
        assert_eq!(connection.pending_batch_len(), Some(200));

        connection
            .write_ext(Bytes::new(), true, true)
            .await
            .expect("flush");

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 200);
        assert_eq!(connection.pending_batch_len(), None);
    }

    #[tokio::test]
    async fn test_batch_capacity_triggers_transmission() {
        let channel = MockChannel::new();
        let config = batching_config(256);
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        connection
            .write_ext(Bytes::from(vec![1u8; 200]), false, true)
            .await
            .expect("first");
        assert!(channel.sent().is_empty());

        connection
            .write_ext(Bytes::from(vec![2u8; 200]), false, true)
            .await
            .expect("second");

        // Threshold crossed: the whole accumulation goes out as one
        // payload and a fresh buffer keeps accumulating
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 400);
        assert_eq!(connection.pending_batch_len(), Some(0));
    }

    #[tokio::test]
    async fn test_unbatched_write_flushes_pending_batch() {
        let channel = MockChannel::new();
        let config = batching_config(8192);
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        connection
            .write_ext(Bytes::from_static(b"queued"), false, true)
            .await
            .expect("batched");
        connection
            .write(Bytes::from_static(b" now"))
            .await
            .expect("unbatched");

        // The unbatched write is terminal: pending bytes and the new
        // bytes leave together and the batch buffer goes absent
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..], b"queued now");
        assert_eq!(connection.pending_batch_len(), None);
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_interleave() {
        let channel = MockChannel::new();
        let config = TransportConfig {
            batching_enabled: false,
            ..Default::default()
        };
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        let writers = 8usize;
        let writes_per_writer = 50usize;
        let record_len = 64usize;

        let mut tasks = JoinSet::new();
        for writer in 0..writers {
            let connection = Arc::clone(&connection);
            tasks.spawn(async move {
                for _ in 0..writes_per_writer {
                    let record = Bytes::from(vec![writer as u8; record_len]);
                    connection.write(record).await.expect("write");
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.expect("writer task");
        }

        // Every dispatched payload is exactly one caller's record
        let sent = channel.sent();
        assert_eq!(sent.len(), writers * writes_per_writer);
        for payload in sent {
            assert_eq!(payload.len(), record_len);
            let tag = payload[0];
            assert!(payload.iter().all(|byte| *byte == tag));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_completion() {
        let channel = MockChannel::new();
        channel.defer_completions();
        let config = TransportConfig::default();
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        let write = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .write_ext(Bytes::from_static(b"urgent"), true, false)
                    .await
            })
        };

        tokio::task::yield_now().await;
        channel.complete_pending_sends();

        write.await.expect("join").expect("write");
        assert_eq!(channel.sent(), vec![Bytes::from_static(b"urgent")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_timeout_is_logged_not_raised() {
        let channel = MockChannel::new();
        channel.defer_completions();
        let config = TransportConfig::default();
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        let before = Instant::now();
        connection
            .write_ext(Bytes::from_static(b"stalled"), true, false)
            .await
            .expect("flush timeout must not fail the call");

        // The bounded wait ran its full course
        assert!(before.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_dropped_completion_surfaces_interruption() {
        let channel = MockChannel::new();
        channel.drop_completions();
        let config = TransportConfig::default();
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        let result = connection
            .write_ext(Bytes::from_static(b"lost"), true, false)
            .await;
        assert!(matches!(result, Err(VeloxmqError::Interrupted)));

        // The lock was released on the error path
        connection
            .write(Bytes::from_static(b"after"))
            .await
            .expect("lock available after interruption");
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_never_blocks_an_active_writer() {
        let channel = MockChannel::new();
        channel.defer_completions();
        let config = TransportConfig::default();
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        // A flushing write is parked holding the lock
        let write = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .write_ext(Bytes::from_static(b"parked"), true, false)
                    .await
            })
        };
        tokio::task::yield_now().await;

        // The maintenance path returns immediately and transmits nothing
        connection.check_flush_batch_buffer();
        assert_eq!(channel.sent().len(), 1);

        channel.complete_pending_sends();
        write.await.expect("join").expect("write");
    }

    #[tokio::test]
    async fn test_maintenance_flushes_pending_batch() {
        let channel = MockChannel::new();
        let config = batching_config(8192);
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        connection
            .write_ext(Bytes::from_static(b"pending"), false, true)
            .await
            .expect("batched");
        assert!(channel.sent().is_empty());

        connection.check_flush_batch_buffer();

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..], b"pending");
        // Replaced with a fresh empty buffer, not cleared to absent
        assert_eq!(connection.pending_batch_len(), Some(0));

        // Nothing further to flush: no duplicate transmission
        connection.check_flush_batch_buffer();
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_close_notifies_lifecycle_exactly_once() {
        let channel = MockChannel::new();
        let lifecycle = CountingLifecycle::new();
        let config = TransportConfig::default();
        let connection = connection_over(
            &channel,
            Arc::clone(&lifecycle) as Arc<dyn LifecycleListener>,
            &config,
        );

        connection.close().await;
        connection.close().await;

        assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(*lifecycle.last_id.lock(), Some(connection.id()));
        assert_eq!(channel.close_count(), 1);
        assert!(connection.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_survives_hung_tls_and_channel() {
        // Scenario C: TLS teardown and channel close both hang; close
        // still completes in bounded time and notifies once
        let channel = MockChannel::new();
        channel.enable_tls();
        channel.hang_tls_shutdown();
        channel.hang_close();
        let lifecycle = CountingLifecycle::new();
        let config = TransportConfig::default();
        let connection = connection_over(
            &channel,
            Arc::clone(&lifecycle) as Arc<dyn LifecycleListener>,
            &config,
        );

        let before = Instant::now();
        connection.close().await;

        assert!(before.elapsed() >= Duration::from_secs(20));
        assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(channel.tls_shutdown_count(), 1);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_write_after_close_fails_fast() {
        let channel = MockChannel::new();
        let config = TransportConfig::default();
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        connection.close().await;

        let result = connection.write(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(VeloxmqError::ConnectionClosed)));
        assert!(channel.sent().is_empty());
        assert_eq!(connection.remote_address(), None);
    }

    #[tokio::test]
    async fn test_readiness_transitions_reach_listeners_in_order() {
        // Scenario D: not-ready then ready arrives in that order
        struct Recorder {
            transitions: SyncMutex<Vec<bool>>,
        }
        impl ReadyListener for Recorder {
            fn ready_for_writing(&self, ready: bool) {
                self.transitions.lock().push(ready);
            }
        }

        let channel = MockChannel::new();
        let config = TransportConfig::default();
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        let recorder = Arc::new(Recorder {
            transitions: SyncMutex::new(Vec::new()),
        });
        connection.add_ready_listener(recorder.clone() as Arc<dyn ReadyListener>);

        channel.trigger_writability(false);
        channel.trigger_writability(true);

        assert_eq!(*recorder.transitions.lock(), vec![false, true]);

        connection.remove_ready_listener(&(recorder.clone() as Arc<dyn ReadyListener>));
        channel.trigger_writability(false);
        assert_eq!(*recorder.transitions.lock(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_connector_config_round_trip() {
        let channel = MockChannel::new();
        let config = TransportConfig::default();

        let mut parameters = HashMap::new();
        parameters.insert("host".to_string(), "broker.internal".to_string());
        parameters.insert("port".to_string(), "4444".to_string());
        let connection = Connection::new(
            Arc::clone(&channel) as Arc<dyn Channel>,
            Arc::new(NoopLifecycleListener),
            &config,
            Some(parameters),
        );

        let rebuilt = connection.connector_config().expect("descriptor");
        assert_eq!(rebuilt.address(), "broker.internal:4444");

        let bare = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);
        assert!(bare.connector_config().is_none());
    }

    #[tokio::test]
    async fn test_create_buffer_draws_from_the_allocator() {
        let channel = MockChannel::new();
        let config = TransportConfig::default();
        let connection = connection_over(&channel, Arc::new(NoopLifecycleListener), &config);

        let buffer = connection.create_buffer(1024);
        assert!(buffer.capacity() >= 1024);
        assert!(buffer.is_empty());
    }
}
