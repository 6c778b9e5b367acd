//! Coordinator Handle
//!
//! Composes the cache store, the request coalescer and the admission gates
//! behind a single get-or-load operation.

use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::coalesce::{
    wait_for, PendingChannel, PendingSender, RegistrationId, RequestCoalescer,
};
use crate::config::{Config, RateLimitPolicy};
use crate::coordinator::stats::{CoordinatorStats, LoadCounters};
use crate::error::{CacheError, Result};
use crate::gate::{AdmissionQueue, ConcurrencyGate, ConcurrencyPermit, RateLimiter, Ticket};

/// Computes the capacity cost of a loaded value.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u64 + Send + Sync>;

enum Lookup<K: Hash + Eq + Debug, V: Clone> {
    Hit(V),
    Wait(Waiter<K, V>),
}

/// Everything mutated by more than one caller. Guarded by one lock.
struct State<K, V> {
    store: CacheStore<K, V>,
    pending: RequestCoalescer<K, V>,
    counters: LoadCounters,
}

struct Inner<K, V> {
    state: Mutex<State<K, V>>,
    clock: Arc<dyn Clock>,
    limiter: Option<RateLimiter>,
    gate: Option<ConcurrencyGate>,
    admission: AdmissionQueue,
    weigher: Weigher<K, V>,
    config: Config,
}

// == Coordinator ==
/// Get-or-load cache shared by many concurrent callers.
///
/// A hit returns straight from the store. On a miss exactly one caller starts
/// a load, and every other caller asking for the same key while it runs waits
/// for that load's outcome instead of starting its own. Loads pass the rate
/// limiter and the concurrency gate, when configured, before the loader runs.
/// Successful values are cached; failures are handed to every waiter and
/// never cached.
///
/// The handle is cheap to clone. Loads run as Tokio tasks, so calls must be
/// made from within a Tokio runtime. A load keeps running to completion and
/// fills the cache even if every caller waiting on it gives up.
pub struct Coordinator<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Coordinator<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Debug for Coordinator<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.inner.config)
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

// == Builder ==
/// Builds a [`Coordinator`] with an optional clock and weigher.
pub struct CoordinatorBuilder<K, V> {
    config: Config,
    clock: Arc<dyn Clock>,
    weigher: Option<Weigher<K, V>>,
}

impl<K, V> CoordinatorBuilder<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Replaces the system clock, e.g. with a [`ManualClock`](crate::clock::ManualClock) in tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets how much capacity each loaded value uses. Defaults to 1 per entry.
    pub fn weigher<F>(mut self, weigher: F) -> Self
    where
        F: Fn(&K, &V) -> u64 + Send + Sync + 'static,
    {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    pub fn build(self) -> Result<Coordinator<K, V>> {
        self.config.validate()?;

        let Self {
            config,
            clock,
            weigher,
        } = self;

        let store = CacheStore::with_clock(config.capacity, config.ttl, clock.clone());
        let limiter = config
            .rate_limit
            .map(|limit| RateLimiter::new(limit, clock.clone()))
            .transpose()?;
        let gate = config.max_concurrent.map(ConcurrencyGate::new);
        let weigher: Weigher<K, V> = match weigher {
            Some(weigher) => weigher,
            None => Arc::new(|_: &K, _: &V| 1u64),
        };

        Ok(Coordinator {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    store,
                    pending: RequestCoalescer::new(),
                    counters: LoadCounters::default(),
                }),
                clock,
                limiter,
                gate,
                admission: AdmissionQueue::new(),
                weigher,
                config,
            }),
        })
    }
}

impl<K, V> Coordinator<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates a coordinator on the system clock with unit-cost entries.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> CoordinatorBuilder<K, V> {
        CoordinatorBuilder {
            config,
            clock: Arc::new(SystemClock),
            weigher: None,
        }
    }

    // == Get ==
    /// Returns the cached value for `key`, loading it with `loader` on a miss.
    ///
    /// `loader` is only invoked if this call ends up starting the load; a
    /// caller that joins an in-flight load drops it unused.
    ///
    /// # Errors
    /// - [`CacheError::LoaderFailed`] if the shared load failed
    /// - [`CacheError::RateLimited`] if this call would have started a load and
    ///   the fail-fast rate limiter had no token
    /// - [`CacheError::CapacityExceeded`] if the loaded value is heavier than
    ///   the whole cache
    pub async fn get<F, Fut, E>(&self, key: K, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        match self.lookup_or_start(key, loader)? {
            Lookup::Hit(value) => Ok(value),
            Lookup::Wait(waiter) => waiter.wait().await,
        }
    }

    // == Get With Deadline ==
    /// Like [`Coordinator::get`], but stops waiting after `timeout`.
    ///
    /// On expiry the caller gets [`CacheError::Timeout`] and stops counting as
    /// a waiter; the load itself and any other waiters are unaffected.
    pub async fn get_with_timeout<F, Fut, E>(
        &self,
        key: K,
        timeout: Duration,
        loader: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let waiter = match self.lookup_or_start(key, loader)? {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Wait(waiter) => waiter,
        };

        match tokio::time::timeout(timeout, waiter.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.inner.state.lock().counters.timeouts += 1;
                debug!("gave up waiting after {:?}", timeout);
                Err(CacheError::Timeout)
            }
        }
    }

    // == Get If Present ==
    /// Returns the cached value without loading. Counts as a hit or miss.
    pub fn get_if_present(&self, key: &K) -> Option<V> {
        self.inner.state.lock().store.get(key)
    }

    /// Returns the cached value without touching recency or statistics.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner
            .state
            .lock()
            .store
            .peek(key)
            .map(|entry| entry.value.clone())
    }

    // == Insert ==
    /// Stores a value directly, replacing any cached one.
    ///
    /// A load for the same key that is already running will not overwrite it.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let cost = (self.inner.weigher)(&key, &value);
        let mut state = self.inner.state.lock();
        state.pending.mark_stale(&key);
        state.store.put(key, value, cost)
    }

    // == Invalidate ==
    /// Drops the cached value for `key`. Returns whether one was cached.
    ///
    /// A load for `key` already in flight still answers its waiters but its
    /// result is not cached.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut state = self.inner.state.lock();
        let removed = state.store.remove(key).is_some();
        let in_flight = state.pending.mark_stale(key);
        debug!(?key, removed, in_flight, "invalidated");
        removed
    }

    // == Clear ==
    /// Drops every cached value and detaches all in-flight loads from the cache.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.store.clear();
        let in_flight = state.pending.mark_all_stale();
        debug!(in_flight, "cleared cache");
    }

    // == Cleanup Expired ==
    /// Purges expired entries. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        self.inner.state.lock().store.cleanup_expired()
    }

    /// Whether `key` holds a live cached value. Does not touch recency.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.state.lock().store.contains(key)
    }

    /// Number of cached entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.inner.state.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().store.is_empty()
    }

    /// Number of keys with a load in flight.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Callers still waiting on the in-flight load for `key`, if any.
    pub fn pending_waiters(&self, key: &K) -> Option<usize> {
        self.inner.state.lock().pending.waiters(key)
    }

    // == Stats ==
    pub fn stats(&self) -> CoordinatorStats {
        let state = self.inner.state.lock();
        CoordinatorStats::new(
            state.store.stats(),
            &state.counters,
            state.pending.len(),
            self.inner.gate.as_ref().map(ConcurrencyGate::in_flight),
        )
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Hit, join, reject or start a load, all under one lock acquisition.
    fn lookup_or_start<F, Fut, E>(&self, key: K, loader: F) -> Result<Lookup<K, V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let (id, sender, channel, ticket) = {
            let mut state = self.inner.state.lock();

            if let Some(value) = state.store.get(&key) {
                trace!(?key, "cache hit");
                return Ok(Lookup::Hit(value));
            }

            if let Some((id, channel)) = state.pending.join(&key) {
                state.counters.coalesced += 1;
                trace!(?key, "joined in-flight load");
                return Ok(Lookup::Wait(self.waiter(key, id, channel)));
            }

            if self.inner.config.rate_limit_policy == RateLimitPolicy::FailFast {
                if let Some(limiter) = &self.inner.limiter {
                    if !limiter.allow() {
                        state.counters.rate_limited += 1;
                        debug!(?key, "load rejected by rate limiter");
                        return Err(CacheError::RateLimited);
                    }
                }
            }

            let (id, sender, channel) = state.pending.register(key.clone(), self.inner.clock.now());
            let ticket = self.queues_loads().then(|| self.inner.admission.ticket());
            (id, sender, channel, ticket)
        };

        debug!(?key, ?ticket, "starting load");
        tokio::spawn(self.clone().run_load(key.clone(), id, ticket, loader, sender));
        Ok(Lookup::Wait(self.waiter(key, id, channel)))
    }

    fn waiter(&self, key: K, id: RegistrationId, channel: PendingChannel<V>) -> Waiter<K, V> {
        Waiter {
            inner: Arc::clone(&self.inner),
            key: Some(key),
            id,
            channel,
        }
    }

    /// Whether loads wait at a gate, and so need a place in line.
    fn queues_loads(&self) -> bool {
        self.inner.gate.is_some()
            || (self.inner.limiter.is_some()
                && self.inner.config.rate_limit_policy == RateLimitPolicy::Wait)
    }

    async fn run_load<F, Fut, E>(
        self,
        key: K,
        id: RegistrationId,
        ticket: Option<Ticket>,
        loader: F,
        sender: PendingSender<V>,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let mut guard = PendingGuard {
            inner: Arc::clone(&self.inner),
            key: Some(key.clone()),
            id,
        };

        let outcome = match self.admit(ticket).await {
            Ok(permit) => {
                let result = loader().await.map_err(CacheError::loader);
                let outcome = self.settle(&key, id, result);
                drop(permit);
                outcome
            }
            Err(err) => self.settle(&key, id, Err(err)),
        };

        guard.disarm();
        // Every waiter may have gone away; the value is cached regardless.
        sender.send(outcome).ok();
    }

    /// Waits for this load's turn, then a rate token (wait policy) and a
    /// concurrency slot. Later loads queue behind it until both are held.
    async fn admit(&self, ticket: Option<Ticket>) -> Result<Option<ConcurrencyPermit>> {
        let Some(ticket) = ticket else {
            return Ok(None);
        };
        let _turn = self.inner.admission.turn(ticket).await;

        if self.inner.config.rate_limit_policy == RateLimitPolicy::Wait {
            if let Some(limiter) = &self.inner.limiter {
                limiter.until_ready().await;
            }
        }

        match &self.inner.gate {
            Some(gate) => gate.acquire().await.map(Some),
            None => Ok(None),
        }
    }

    /// Ends load episode `id` for `key`: caches a fresh success and drops the
    /// pending entry in the same critical section.
    fn settle(&self, key: &K, id: RegistrationId, result: Result<V>) -> Result<V> {
        // User code runs before the lock is taken
        let weighed = result.map(|value| {
            let cost = (self.inner.weigher)(key, &value);
            (value, cost)
        });

        let mut state = self.inner.state.lock();
        let now = self.inner.clock.now();
        let (stale, age) = match state.pending.complete(key, id) {
            Some(request) => (
                request.is_stale(),
                now.saturating_duration_since(request.started_at()),
            ),
            None => (true, Duration::ZERO),
        };

        match weighed {
            Ok((value, cost)) => {
                state.counters.loads += 1;
                debug!(?key, "load finished after {:?}", age);
                if stale {
                    debug!(?key, "not caching result of invalidated load");
                    return Ok(value);
                }
                match state.store.put(key.clone(), value.clone(), cost) {
                    Ok(()) => Ok(value),
                    Err(err) => {
                        warn!(?key, "loaded value not cached: {}", err);
                        Err(err)
                    }
                }
            }
            Err(err) => {
                state.counters.load_failures += 1;
                warn!(?key, "load failed after {:?}: {}", age, err);
                Err(err)
            }
        }
    }
}

/// A caller attached to an in-flight load. Leaving before the outcome
/// arrives, by timeout or by dropping the call, takes it off the load's
/// waiter count.
struct Waiter<K: Hash + Eq + Debug, V: Clone> {
    inner: Arc<Inner<K, V>>,
    key: Option<K>,
    id: RegistrationId,
    channel: PendingChannel<V>,
}

impl<K: Hash + Eq + Debug, V: Clone> Waiter<K, V> {
    async fn wait(mut self) -> Result<V> {
        let outcome = wait_for(self.channel.clone()).await;
        // The load already left the registry before sending
        self.key = None;
        outcome
    }
}

impl<K: Hash + Eq + Debug, V: Clone> Drop for Waiter<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if self.inner.state.lock().pending.leave(&key, self.id) {
                trace!(?key, "waiter left before the load settled");
            }
        }
    }
}

/// Clears the pending entry if a load task dies before settling, so the key
/// does not stay pending forever. Waiters then see the dropped sender.
struct PendingGuard<K: Hash + Eq + Debug, V: Clone> {
    inner: Arc<Inner<K, V>>,
    key: Option<K>,
    id: RegistrationId,
}

impl<K: Hash + Eq + Debug, V: Clone> PendingGuard<K, V> {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl<K: Hash + Eq + Debug, V: Clone> Drop for PendingGuard<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut state = self.inner.state.lock();
            state.pending.complete(&key, self.id);
            state.counters.load_failures += 1;
            warn!(?key, "load ended without settling");
        }
    }
}
