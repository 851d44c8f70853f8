//! Tokio TCP/TLS channel implementation
//!
//! Each channel owns one worker task draining an unbounded job queue in
//! order, which realizes the per-channel execution context: whatever
//! order payloads are dispatched in is the order they reach the wire.
//! The worker also reads inbound bytes and forwards them to the reader
//! channel handed in at spawn time; the protocol layer consumes that end.

use crate::buffer::BufferPool;
use crate::channel::{
    next_channel_id, resolved_signal, Channel, ConnectionId, SendJob, WritabilityObserver,
    CHANNEL_CONTEXT,
};
use crate::config::TransportConfig;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

enum ChannelJob {
    Send(SendJob),
    TlsShutdown(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// A channel backed by a Tokio TCP stream, optionally TLS-wrapped
pub struct TcpChannel {
    id: ConnectionId,
    jobs: mpsc::UnboundedSender<ChannelJob>,
    pool: Arc<BufferPool>,
    remote: Option<SocketAddr>,
    tls: bool,
    queued_bytes: AtomicUsize,
    writable: AtomicBool,
    observer: RwLock<Option<WritabilityObserver>>,
    high_watermark: usize,
    low_watermark: usize,
}

impl TcpChannel {
    /// Spawn the worker task for an established stream and return the
    /// channel handle
    ///
    /// `inbound` receives the raw bytes read from the peer; dropping the
    /// receiving end stops inbound forwarding without affecting writes.
    pub fn spawn<S>(
        stream: S,
        remote: Option<SocketAddr>,
        tls: bool,
        config: &TransportConfig,
        pool: Arc<BufferPool>,
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let id = next_channel_id();

        let channel = Arc::new(Self {
            id,
            jobs: jobs_tx,
            pool,
            remote,
            tls,
            queued_bytes: AtomicUsize::new(0),
            writable: AtomicBool::new(true),
            observer: RwLock::new(None),
            high_watermark: config.write_high_watermark,
            low_watermark: config.write_low_watermark,
        });

        // The worker holds the channel weakly: dropping the last handle
        // closes the job queue and lets the worker exit
        let worker = Arc::downgrade(&channel);
        let pool = Arc::clone(&channel.pool);
        let read_buffer_size = config.read_buffer_size;
        tokio::spawn(CHANNEL_CONTEXT.scope(id.as_u64(), async move {
            Self::run(worker, id, pool, stream, jobs_rx, inbound, read_buffer_size).await;
        }));

        channel
    }

    async fn run<S>(
        channel: Weak<Self>,
        id: ConnectionId,
        pool: Arc<BufferPool>,
        stream: S,
        mut jobs: mpsc::UnboundedReceiver<ChannelJob>,
        inbound: mpsc::UnboundedSender<Bytes>,
        read_buffer_size: usize,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buffer = pool.acquire(read_buffer_size);
        read_buffer.resize(read_buffer_size, 0);
        let mut inbound = Some(inbound);

        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(ChannelJob::Send(job)) => {
                        let len = job.payload.len();
                        let result = Self::write_payload(&mut writer, &job.payload).await;
                        if let Some(channel) = channel.upgrade() {
                            channel.note_drained(len);
                        }
                        let failed = result.is_err();
                        if let Err(e) = &result {
                            error!(channel = %id, error = %e, "write failed");
                        }
                        if let Some(completion) = job.completion {
                            let _ = completion.send(result);
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(ChannelJob::TlsShutdown(done)) => {
                        // For a TLS stream this writes close-notify
                        if let Err(e) = writer.shutdown().await {
                            debug!(channel = %id, error = %e, "TLS shutdown failed");
                        }
                        let _ = done.send(());
                    }
                    Some(ChannelJob::Close(done)) => {
                        if let Err(e) = writer.shutdown().await {
                            debug!(channel = %id, error = %e, "channel shutdown failed");
                        }
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                },
                read = reader.read(&mut read_buffer[..]), if inbound.is_some() => match read {
                    Ok(0) => {
                        trace!(channel = %id, "peer closed the read side");
                        inbound = None;
                    }
                    Ok(n) => {
                        let forwarded = inbound
                            .as_ref()
                            .map(|tx| tx.send(Bytes::copy_from_slice(&read_buffer[..n])).is_ok())
                            .unwrap_or(false);
                        if !forwarded {
                            // Receiver gone; stop reading but keep serving writes
                            inbound = None;
                        }
                    }
                    Err(e) => {
                        trace!(channel = %id, error = %e, "read failed");
                        inbound = None;
                    }
                },
            }
        }

        pool.release(read_buffer);
        debug!(channel = %id, "channel worker stopped");
    }

    async fn write_payload<W>(writer: &mut W, payload: &Bytes) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(payload).await?;
        writer.flush().await
    }

    fn note_dispatched(&self, len: usize) {
        let queued = self.queued_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if queued > self.high_watermark && self.writable.swap(false, Ordering::AcqRel) {
            self.notify_writability(false);
        }
    }

    fn note_drained(&self, len: usize) {
        let queued = self.queued_bytes.fetch_sub(len, Ordering::AcqRel) - len;
        if queued <= self.low_watermark
            && !self.writable.load(Ordering::Acquire)
            && !self.writable.swap(true, Ordering::AcqRel)
        {
            self.notify_writability(true);
        }
    }

    fn notify_writability(&self, ready: bool) {
        let observer = self.observer.read();
        if let Some(observer) = observer.as_ref() {
            observer(ready);
        }
    }

    /// Bytes dispatched but not yet written to the socket
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn alloc(&self, size: usize) -> BytesMut {
        self.pool.acquire(size)
    }

    fn dispatch(&self, job: SendJob) {
        let len = job.payload.len();
        self.note_dispatched(len);
        if self.jobs.send(ChannelJob::Send(job)).is_err() {
            // Worker gone; the dropped completion sender signals the waiter
            self.note_drained(len);
            debug!(channel = %self.id, "dispatch on a stopped channel");
        }
    }

    fn is_on_channel_context(&self) -> bool {
        CHANNEL_CONTEXT
            .try_with(|context| *context == self.id.as_u64())
            .unwrap_or(false)
    }

    fn begin_close(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(ChannelJob::Close(tx)).is_err() {
            return resolved_signal();
        }
        rx
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn has_active_tls_layer(&self) -> bool {
        self.tls
    }

    fn request_tls_shutdown(&self) -> oneshot::Receiver<()> {
        if !self.tls {
            return resolved_signal();
        }
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(ChannelJob::TlsShutdown(tx)).is_err() {
            return resolved_signal();
        }
        rx
    }

    fn set_writability_observer(&self, observer: WritabilityObserver) {
        *self.observer.write() = Some(observer);
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("tls", &self.tls)
            .field("queued_bytes", &self.queued_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn test_config() -> TransportConfig {
        TransportConfig::default()
    }

    #[tokio::test]
    async fn test_sends_reach_the_wire_in_dispatch_order() {
        let (local, mut remote) = duplex(64 * 1024);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(BufferPool::new(8192, 8));
        let channel = TcpChannel::spawn(local, None, false, &test_config(), pool, inbound_tx);

        for chunk in [&b"first "[..], &b"second "[..], &b"third"[..]] {
            channel.dispatch(SendJob::new(Bytes::from_static(chunk)));
        }

        let mut received = vec![0u8; 18];
        remote.read_exact(&mut received).await.expect("read");
        assert_eq!(&received, b"first second third");
    }

    #[tokio::test]
    async fn test_completion_resolves_after_write() {
        let (local, mut remote) = duplex(64 * 1024);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(BufferPool::new(8192, 8));
        let channel = TcpChannel::spawn(local, None, false, &test_config(), pool, inbound_tx);

        let (tx, rx) = oneshot::channel();
        channel.dispatch(SendJob {
            payload: Bytes::from_static(b"payload"),
            completion: Some(tx),
        });

        rx.await.expect("completion delivered").expect("write ok");
        let mut received = vec![0u8; 7];
        remote.read_exact(&mut received).await.expect("read");
        assert_eq!(&received, b"payload");
    }

    #[tokio::test]
    async fn test_inbound_bytes_forwarded() {
        let (local, mut remote) = duplex(64 * 1024);
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(BufferPool::new(8192, 8));
        let _channel = TcpChannel::spawn(local, None, false, &test_config(), pool, inbound_tx);

        remote.write_all(b"hello transport").await.expect("write");
        remote.flush().await.expect("flush");

        let chunk = inbound_rx.recv().await.expect("inbound chunk");
        assert_eq!(&chunk[..], b"hello transport");
    }

    #[tokio::test]
    async fn test_close_signal_resolves() {
        let (local, _remote) = duplex(64 * 1024);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(BufferPool::new(8192, 8));
        let channel = TcpChannel::spawn(local, None, false, &test_config(), pool, inbound_tx);

        channel.begin_close().await.expect("close completes");

        // A second close on the stopped worker resolves immediately
        channel.begin_close().await.expect("idempotent close");
    }

    #[tokio::test]
    async fn test_plaintext_channel_has_no_tls_layer() {
        let (local, _remote) = duplex(1024);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(BufferPool::new(8192, 8));
        let channel = TcpChannel::spawn(local, None, false, &test_config(), pool, inbound_tx);

        assert!(!channel.has_active_tls_layer());
        channel
            .request_tls_shutdown()
            .await
            .expect("resolves immediately");
    }

    #[tokio::test]
    async fn test_caller_is_not_on_channel_context() {
        let (local, _remote) = duplex(1024);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(BufferPool::new(8192, 8));
        let channel = TcpChannel::spawn(local, None, false, &test_config(), pool, inbound_tx);

        assert!(!channel.is_on_channel_context());
    }
}
