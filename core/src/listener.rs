//! Listener traits for connection lifecycle and backpressure events

use crate::channel::ConnectionId;
use dashmap::DashMap;
use std::sync::Arc;

/// Observer of connection destruction
///
/// `connection_destroyed` is invoked exactly once per connection, when
/// `Connection::close` completes. There is no resurrection; a reconnect
/// produces a new connection with a new id.
pub trait LifecycleListener: Send + Sync {
    fn connection_destroyed(&self, id: ConnectionId);
}

/// Observer of writability transitions on a connection
///
/// `ready` is false when the transport can no longer accept bytes without
/// unbounded buffering, and true again once it can. Each transition is
/// delivered to every registered listener at least once; there is no
/// ordering guarantee across distinct listeners.
pub trait ReadyListener: Send + Sync {
    fn ready_for_writing(&self, ready: bool);
}

/// Lifecycle listener that ignores all notifications
#[derive(Debug, Default)]
pub struct NoopLifecycleListener;

impl LifecycleListener for NoopLifecycleListener {
    fn connection_destroyed(&self, _id: ConnectionId) {}
}

/// Set of ready listeners safe for concurrent add/remove/notify
///
/// Listeners are keyed by `Arc` identity. Notification iterates over a
/// snapshot of the set, so a listener may deregister itself (or register
/// others) from inside its own callback without deadlocking.
pub(crate) struct ReadyListenerSet {
    listeners: DashMap<usize, Arc<dyn ReadyListener>>,
}

impl ReadyListenerSet {
    pub(crate) fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    fn key(listener: &Arc<dyn ReadyListener>) -> usize {
        Arc::as_ptr(listener) as *const () as usize
    }

    pub(crate) fn add(&self, listener: Arc<dyn ReadyListener>) {
        self.listeners.insert(Self::key(&listener), listener);
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn ReadyListener>) {
        self.listeners.remove(&Self::key(listener));
    }

    pub(crate) fn notify(&self, ready: bool) {
        let snapshot: Vec<Arc<dyn ReadyListener>> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for listener in snapshot {
            listener.ready_for_writing(ready);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl std::fmt::Debug for ReadyListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyListenerSet")
            .field("len", &self.listeners.len())
            .finish()
    }
}
