//! Pending Request Registry
//!
//! Tracks at most one in-flight load per key and the channel its waiters share.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Instant;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

use crate::error::{CacheError, Result};

/// Receiving side of a load outcome, cloneable for every waiter.
pub type PendingChannel<V> = Shared<oneshot::Receiver<Result<V>>>;

/// Sending side of a load outcome, held by whoever runs the load.
pub type PendingSender<V> = oneshot::Sender<Result<V>>;

/// Identifies one load episode, so a late handle never touches a newer load
/// registered for the same key.
pub type RegistrationId = u64;

// == Pending Request ==
/// An in-flight load for one key.
pub struct PendingRequest<V> {
    id: RegistrationId,
    channel: PendingChannel<V>,
    waiters: usize,
    stale: bool,
    started_at: Instant,
}

impl<V> PendingRequest<V> {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Callers still waiting on this load, including the one that started it.
    pub fn waiters(&self) -> usize {
        self.waiters
    }

    /// Whether the key was invalidated while the load was running.
    ///
    /// A stale result still goes to the waiters but is not cached.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

// == Request Coalescer ==
/// Registry of in-flight loads.
///
/// The registry itself is not synchronized. Callers check and register under
/// the same lock so that two callers can never both become the loader for a
/// key.
pub struct RequestCoalescer<K, V> {
    pending: HashMap<K, PendingRequest<V>>,
    next_id: RegistrationId,
}

impl<K, V> Default for RequestCoalescer<K, V> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<K, V> fmt::Debug for RequestCoalescer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<K: Hash + Eq, V: Clone> RequestCoalescer<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    // == Join ==
    /// Joins the in-flight load for `key`, if there is one.
    pub fn join(&mut self, key: &K) -> Option<(RegistrationId, PendingChannel<V>)> {
        let request = self.pending.get_mut(key)?;
        request.waiters += 1;
        Some((request.id, request.channel.clone()))
    }

    // == Leave ==
    /// Detaches a waiter that stopped waiting before the load settled.
    ///
    /// Does nothing if `id` no longer names the load in flight for `key`.
    pub fn leave(&mut self, key: &K, id: RegistrationId) -> bool {
        match self.pending.get_mut(key) {
            Some(request) if request.id == id && request.waiters > 0 => {
                request.waiters -= 1;
                true
            }
            _ => false,
        }
    }

    // == Register ==
    /// Registers a new in-flight load for `key`.
    ///
    /// Must only be called after [`RequestCoalescer::join`] returned `None`
    /// under the same lock.
    pub fn register(
        &mut self,
        key: K,
        now: Instant,
    ) -> (RegistrationId, PendingSender<V>, PendingChannel<V>) {
        let id = self.next_id;
        self.next_id += 1;

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let previous = self.pending.insert(
            key,
            PendingRequest {
                id,
                channel: channel.clone(),
                waiters: 1,
                stale: false,
                started_at: now,
            },
        );
        debug_assert!(previous.is_none(), "second load registered for one key");
        (id, sender, channel)
    }

    // == Complete ==
    /// Removes the in-flight load for `key` if it is still registration `id`.
    pub fn complete(&mut self, key: &K, id: RegistrationId) -> Option<PendingRequest<V>> {
        match self.pending.get(key) {
            Some(request) if request.id == id => self.pending.remove(key),
            _ => None,
        }
    }

    /// Marks the load for `key` stale. Returns whether one was in flight.
    pub fn mark_stale(&mut self, key: &K) -> bool {
        match self.pending.get_mut(key) {
            Some(request) => {
                request.stale = true;
                true
            }
            None => false,
        }
    }

    /// Marks every in-flight load stale. Returns how many there were.
    pub fn mark_all_stale(&mut self) -> usize {
        for request in self.pending.values_mut() {
            request.stale = true;
        }
        self.pending.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn waiters(&self, key: &K) -> Option<usize> {
        self.pending.get(key).map(PendingRequest::waiters)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// == Wait For Outcome ==
/// Waits until the load behind `channel` settles.
///
/// If the loading side went away without sending, the waiter gets a
/// [`CacheError::LoaderFailed`].
pub async fn wait_for<V: Clone>(channel: PendingChannel<V>) -> Result<V> {
    channel.await.unwrap_or_else(|_cancelled| {
        Err(CacheError::loader(anyhow::anyhow!(
            "load ended without producing a result"
        )))
    })
}
