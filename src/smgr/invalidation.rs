//! Cross-worker invalidation notices
//!
//! A notice tells every receiver to close its handle for an identity.
//! Delivery is fire-and-forget; receivers drain their queue whenever they
//! reach a safe point. The sender is subscribed like everyone else and so
//! sees its own notices.

use super::types::StorageIdentity;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Invalidation bus consumed by the storage manager
pub trait InvalidationBus: Send + Sync {
    fn broadcast_invalidate(&self, identity: StorageIdentity);
}

/// Bus that delivers nowhere
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidationBus;

impl InvalidationBus for NoopInvalidationBus {
    fn broadcast_invalidate(&self, _identity: StorageIdentity) {}
}

type Queue = Mutex<VecDeque<StorageIdentity>>;

/// In-process fan-out bus with one queue per subscriber
#[derive(Debug, Default)]
pub struct InvalidationHub {
    subscribers: Mutex<Vec<Weak<Queue>>>,
}

impl InvalidationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new receiver. Notices sent before this call are not seen.
    pub fn subscribe(&self) -> InvalidationReceiver {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        self.subscribers.lock().push(Arc::downgrade(&queue));
        InvalidationReceiver { queue }
    }

    /// Number of live receivers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|queue| queue.strong_count() > 0)
            .count()
    }
}

impl InvalidationBus for InvalidationHub {
    fn broadcast_invalidate(&self, identity: StorageIdentity) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|queue| match queue.upgrade() {
            Some(queue) => {
                queue.lock().push_back(identity);
                true
            }
            None => false,
        });
        debug!(relation = %identity, receivers = subscribers.len(), "Broadcast invalidation");
    }
}

/// Receiving end of an [`InvalidationHub`] subscription
#[derive(Debug)]
pub struct InvalidationReceiver {
    queue: Arc<Queue>,
}

impl InvalidationReceiver {
    /// Take every pending notice, oldest first
    pub fn drain(&self) -> Vec<StorageIdentity> {
        self.queue.lock().drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}
