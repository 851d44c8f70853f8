//! Transport runtime abstraction
//!
//! A [`Channel`] is the capability set a [`Connection`](crate::Connection)
//! needs from the underlying transport: pooled buffer allocation, an
//! ordered per-channel execution context for sends, completion signals
//! for close and TLS teardown, and writability notifications. The Tokio
//! TCP/TLS implementation lives in [`tcp`]; the trait keeps the
//! connection logic portable across transports.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

/// Stable opaque identifier of a connection, derived from the identity of
/// its underlying channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the identity for a newly established channel
pub(crate) fn next_channel_id() -> ConnectionId {
    ConnectionId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
}

tokio::task_local! {
    /// Channel id of the execution context the current task belongs to
    pub(crate) static CHANNEL_CONTEXT: u64;
}

/// A payload queued for ordered, asynchronous transmission
///
/// The optional completion signal resolves once the transport has written
/// the payload to the wire (not when the peer has received it).
pub struct SendJob {
    pub payload: Bytes,
    pub completion: Option<oneshot::Sender<std::io::Result<()>>>,
}

impl SendJob {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            completion: None,
        }
    }
}

impl fmt::Debug for SendJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendJob")
            .field("len", &self.payload.len())
            .field("flush", &self.completion.is_some())
            .finish()
    }
}

/// Callback invoked on writability transitions
pub type WritabilityObserver = Box<dyn Fn(bool) + Send + Sync>;

/// Capability set a connection consumes from its transport runtime
///
/// One channel is bound 1:1 to one connection. All sends dispatched to a
/// channel are transmitted in dispatch order by a single execution
/// context, so ordering is guaranteed here rather than by locks in the
/// caller.
pub trait Channel: Send + Sync {
    /// Channel identity, stable for the channel's lifetime
    fn id(&self) -> ConnectionId;

    /// Allocate a writable buffer from the transport's pooled allocator
    fn alloc(&self, size: usize) -> BytesMut;

    /// Queue a payload on the channel's execution context
    ///
    /// Jobs are transmitted in dispatch order. When the channel is no
    /// longer running, the job is dropped and its completion sender with
    /// it, which surfaces to any waiter as an interrupted wait.
    fn dispatch(&self, job: SendJob);

    /// Whether the calling task *is* the channel's execution context
    ///
    /// This is an explicit capability query, not a thread-identity
    /// comparison: a flush issued from inside the context must not wait
    /// on itself.
    fn is_on_channel_context(&self) -> bool;

    /// Begin closing the channel; the signal resolves when it has shut down
    fn begin_close(&self) -> oneshot::Receiver<()>;

    /// Peer address, if the channel is connected
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Whether a negotiated TLS session is active on this channel
    fn has_active_tls_layer(&self) -> bool;

    /// Request graceful TLS teardown; the signal resolves once the
    /// close-notify exchange has been written
    fn request_tls_shutdown(&self) -> oneshot::Receiver<()>;

    /// Register the observer notified on writability transitions
    fn set_writability_observer(&self, observer: WritabilityObserver);
}

/// A completion signal that has already fired
///
/// Used by channel implementations for operations that complete
/// synchronously (TLS teardown on a plaintext channel, closing a channel
/// whose worker is already gone).
pub(crate) fn resolved_signal() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(());
    rx
}
