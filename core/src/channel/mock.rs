//! In-memory channel used by connection unit tests
//!
//! Records dispatched payloads instead of writing to a socket and lets
//! tests control completion signals, TLS flags and writability
//! transitions deterministically.

use crate::buffer::BufferPool;
use crate::channel::{
    next_channel_id, resolved_signal, Channel, ConnectionId, SendJob, WritabilityObserver,
};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Clone, Copy, PartialEq)]
enum CompletionMode {
    /// Resolve completion signals as soon as the payload is recorded
    Immediate,
    /// Hold completion senders until the test releases them
    Deferred,
    /// Drop completion senders, simulating a transport dying mid-wait
    Dropped,
}

pub(crate) struct MockChannel {
    id: ConnectionId,
    pool: BufferPool,
    sent: Mutex<Vec<Bytes>>,
    pending_completions: Mutex<Vec<oneshot::Sender<std::io::Result<()>>>>,
    completion_mode: Mutex<CompletionMode>,
    tls: AtomicBool,
    hang_tls_shutdown: AtomicBool,
    hang_close: AtomicBool,
    // Senders parked here keep hung waits pending
    parked_signals: Mutex<Vec<oneshot::Sender<()>>>,
    tls_shutdowns: AtomicUsize,
    closes: AtomicUsize,
    observer: Mutex<Option<WritabilityObserver>>,
}

impl MockChannel {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_channel_id(),
            pool: BufferPool::new(8192, 8),
            sent: Mutex::new(Vec::new()),
            pending_completions: Mutex::new(Vec::new()),
            completion_mode: Mutex::new(CompletionMode::Immediate),
            tls: AtomicBool::new(false),
            hang_tls_shutdown: AtomicBool::new(false),
            hang_close: AtomicBool::new(false),
            parked_signals: Mutex::new(Vec::new()),
            tls_shutdowns: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            observer: Mutex::new(None),
        })
    }

    /// Payloads dispatched so far, in dispatch order
    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub(crate) fn defer_completions(&self) {
        *self.completion_mode.lock() = CompletionMode::Deferred;
    }

    pub(crate) fn drop_completions(&self) {
        *self.completion_mode.lock() = CompletionMode::Dropped;
    }

    /// Resolve every deferred completion signal successfully
    pub(crate) fn complete_pending_sends(&self) {
        for completion in self.pending_completions.lock().drain(..) {
            let _ = completion.send(Ok(()));
        }
    }

    pub(crate) fn enable_tls(&self) {
        self.tls.store(true, Ordering::SeqCst);
    }

    pub(crate) fn hang_tls_shutdown(&self) {
        self.hang_tls_shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn hang_close(&self) {
        self.hang_close.store(true, Ordering::SeqCst);
    }

    pub(crate) fn tls_shutdown_count(&self) -> usize {
        self.tls_shutdowns.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Deliver a writability transition as the transport would
    pub(crate) fn trigger_writability(&self, ready: bool) {
        let observer = self.observer.lock();
        if let Some(observer) = observer.as_ref() {
            observer(ready);
        }
    }

    fn signal(&self, hang: bool) -> oneshot::Receiver<()> {
        if hang {
            let (tx, rx) = oneshot::channel();
            self.parked_signals.lock().push(tx);
            rx
        } else {
            resolved_signal()
        }
    }
}

impl Channel for MockChannel {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn alloc(&self, size: usize) -> BytesMut {
        self.pool.acquire(size)
    }

    fn dispatch(&self, job: SendJob) {
        self.sent.lock().push(job.payload);
        if let Some(completion) = job.completion {
            match *self.completion_mode.lock() {
                CompletionMode::Immediate => {
                    let _ = completion.send(Ok(()));
                }
                CompletionMode::Deferred => {
                    self.pending_completions.lock().push(completion);
                }
                CompletionMode::Dropped => drop(completion),
            }
        }
    }

    fn is_on_channel_context(&self) -> bool {
        false
    }

    fn begin_close(&self) -> oneshot::Receiver<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.signal(self.hang_close.load(Ordering::SeqCst))
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        Some(([127, 0, 0, 1], 9092).into())
    }

    fn has_active_tls_layer(&self) -> bool {
        self.tls.load(Ordering::SeqCst)
    }

    fn request_tls_shutdown(&self) -> oneshot::Receiver<()> {
        self.tls_shutdowns.fetch_add(1, Ordering::SeqCst);
        self.signal(self.hang_tls_shutdown.load(Ordering::SeqCst))
    }

    fn set_writability_observer(&self, observer: WritabilityObserver) {
        *self.observer.lock() = Some(observer);
    }
}
