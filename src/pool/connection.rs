//! Bounded connection pool with waiter queueing and circuit breaking
//!
//! The pool owns a bounded set of factory-created resources:
//! - idle connections are reused in FIFO order
//! - at capacity, callers queue as waiters and are served strictly FIFO
//! - every factory attempt is gated and scored by the circuit breaker
//! - idle connections past their idle timeout are reaped in the background
//!
//! All membership bookkeeping (idle / active / waiters) lives behind a
//! single mutex with short critical sections, so two concurrent acquires
//! can never both claim the same capacity slot. The factory's `create`
//! runs outside the lock; a `creating` counter reserves the slot across
//! that await.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreaker, CircuitError};
use crate::config::PoolConfig;
use crate::events::{EventBus, PoolEvent};
use crate::factory::ResourceFactory;

/// Error types for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The circuit breaker denied the attempt; back off before retrying
    #[error("circuit breaker is open; retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// The pool stayed at capacity for the whole wait
    #[error("timed out after {0:?} waiting for a free connection")]
    AcquireTimeout(Duration),

    /// The factory failed to create a connection
    #[error("connection creation failed: {0}")]
    Create(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The pool has been shut down
    #[error("pool is shut down")]
    Shutdown,
}

/// Statistics for the connection pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections currently checked out
    pub active: usize,

    /// Connections available for reuse
    pub idle: usize,

    /// Acquire calls queued for a free slot
    pub waiting: usize,

    /// Total connections created over the pool's lifetime
    pub total_created: u64,

    /// Total connections destroyed over the pool's lifetime
    pub total_destroyed: u64,
}

/// A checked-out connection handle.
///
/// The resource is shared behind an `Arc` so the health monitor can hold
/// a transient validation reference, but the handle itself cannot be
/// cloned: exactly one caller owns a checked-out connection, and
/// [`ConnectionPool::release`] consumes the handle, which rules out a
/// double release at the type level.
pub struct PooledConnection<R> {
    id: u64,
    resource: Arc<R>,
    created_at: Instant,
}

impl<R> PooledConnection<R> {
    /// Pool-assigned identifier for this connection
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the underlying resource was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Access the underlying resource
    pub fn resource(&self) -> &R {
        &self.resource
    }
}

impl<R> std::ops::Deref for PooledConnection<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

/// A point-in-time view of one pooled resource, handed to the health
/// monitor for validation
pub struct ResourceSnapshot<R> {
    pub id: u64,
    pub resource: Arc<R>,
    pub active: bool,
}

/// Outcome of asking the pool to remove an unhealthy connection
pub(crate) enum RetireOutcome {
    /// The connection was idle and has been destroyed
    Destroyed,

    /// The connection is checked out; it will be destroyed on release
    FlaggedActive,

    /// The connection already left the pool
    NotFound,
}

struct PoolEntry<R> {
    id: u64,
    resource: Arc<R>,
    created_at: Instant,
    idle_since: Instant,
}

impl<R> PoolEntry<R> {
    fn handle(&self) -> PooledConnection<R> {
        PooledConnection {
            id: self.id,
            resource: Arc::clone(&self.resource),
            created_at: self.created_at,
        }
    }
}

struct Waiter<R> {
    id: u64,
    tx: oneshot::Sender<Result<PooledConnection<R>, PoolError>>,
}

struct PoolInner<R> {
    idle: VecDeque<PoolEntry<R>>,
    active: HashMap<u64, PoolEntry<R>>,
    waiters: VecDeque<Waiter<R>>,

    /// Active connections flagged unhealthy; destroyed on release
    doomed: HashSet<u64>,

    /// Slots reserved for factory `create` calls in flight
    creating: usize,

    shut_down: bool,
    next_connection_id: u64,
    next_waiter_id: u64,
    total_created: u64,
    total_destroyed: u64,
}

impl<R> PoolInner<R> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            active: HashMap::new(),
            waiters: VecDeque::new(),
            doomed: HashSet::new(),
            creating: 0,
            shut_down: false,
            next_connection_id: 1,
            next_waiter_id: 1,
            total_created: 0,
            total_destroyed: 0,
        }
    }

    /// Connections held plus slots reserved by in-flight creates
    fn size(&self) -> usize {
        self.idle.len() + self.active.len() + self.creating
    }

    fn register(&mut self, resource: R) -> PoolEntry<R> {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.total_created += 1;
        let now = Instant::now();
        PoolEntry {
            id,
            resource: Arc::new(resource),
            created_at: now,
            idle_since: now,
        }
    }

    /// Hand a free connection to the head waiter, or park it as idle.
    ///
    /// Waiters are served strictly FIFO; abandoned waiters (whose acquire
    /// already timed out and de-queued itself, or whose receiver dropped)
    /// are skipped.
    fn offer(&mut self, mut entry: PoolEntry<R>) {
        while let Some(waiter) = self.waiters.pop_front() {
            let id = entry.id;
            let handle = entry.handle();
            self.active.insert(id, entry);
            match waiter.tx.send(Ok(handle)) {
                Ok(()) => {
                    debug!(id, waiter = waiter.id, "handed connection to waiter");
                    return;
                }
                Err(_) => match self.active.remove(&id) {
                    Some(returned) => entry = returned,
                    // Unreachable: the entry was inserted just above
                    None => return,
                },
            }
        }
        entry.idle_since = Instant::now();
        self.idle.push_back(entry);
    }
}

enum AcquirePlan<R> {
    Ready(PooledConnection<R>),
    Create,
    Wait(
        oneshot::Receiver<Result<PooledConnection<R>, PoolError>>,
        u64,
    ),
}

/// Bounded, circuit-breaker-guarded connection pool
pub struct ConnectionPool<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    inner: Mutex<PoolInner<F::Resource>>,
    breaker: CircuitBreaker,
    events: EventBus,
    shutdown_tx: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ResourceFactory> ConnectionPool<F> {
    /// Create a pool, pre-populate it to `min_connections` (best effort),
    /// and start the background idle reaper.
    ///
    /// The reaper and health monitor hold the returned `Arc`, so the pool
    /// stays alive until [`shutdown`](Self::shutdown) is called.
    pub async fn new(config: PoolConfig, factory: F) -> Arc<Self> {
        let events = EventBus::default();
        let breaker = CircuitBreaker::new(config.breaker.clone(), events.clone());
        let (shutdown_tx, _) = watch::channel(false);

        let pool = Arc::new(Self {
            factory,
            config,
            inner: Mutex::new(PoolInner::new()),
            breaker,
            events,
            shutdown_tx,
            reaper: Mutex::new(None),
        });

        let (created, error) = pool.replenish().await;
        if let Some(error) = error {
            warn!(
                error = %error,
                created = created.len(),
                floor = pool.config.min_connections,
                "pool pre-population fell short of min_connections"
            );
        } else if !created.is_empty() {
            info!(created = created.len(), "pool pre-populated");
        }

        Self::spawn_reaper(&pool).await;
        pool
    }

    /// Acquire a connection, waiting up to the configured acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection<F::Resource>, PoolError> {
        self.acquire_timeout(self.config.acquire_timeout()).await
    }

    /// Acquire a connection, waiting up to `timeout` if the pool is at
    /// capacity.
    ///
    /// A breaker denial fails immediately without consuming any of the
    /// timeout; only a capacity wait does.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<F::Resource>, PoolError> {
        if *self.shutdown_tx.borrow() {
            return Err(PoolError::Shutdown);
        }

        self.breaker.check().await.map_err(|e| match e {
            CircuitError::Open { retry_after } => PoolError::CircuitOpen { retry_after },
        })?;

        let plan = {
            let mut inner = self.inner.lock().await;
            if inner.shut_down {
                return Err(PoolError::Shutdown);
            }

            if let Some(entry) = inner.idle.pop_front() {
                let handle = entry.handle();
                debug!(
                    id = entry.id,
                    age_secs = entry.created_at.elapsed().as_secs(),
                    "reusing idle connection"
                );
                inner.active.insert(entry.id, entry);
                AcquirePlan::Ready(handle)
            } else if inner.size() < self.config.max_connections {
                inner.creating += 1;
                AcquirePlan::Create
            } else {
                let (tx, rx) = oneshot::channel();
                let waiter_id = inner.next_waiter_id;
                inner.next_waiter_id += 1;
                inner.waiters.push_back(Waiter { id: waiter_id, tx });
                debug!(
                    waiter = waiter_id,
                    waiting = inner.waiters.len(),
                    "pool at capacity; queueing acquire"
                );
                AcquirePlan::Wait(rx, waiter_id)
            }
        };

        match plan {
            AcquirePlan::Ready(handle) => Ok(handle),
            AcquirePlan::Create => self.create_for_caller().await,
            AcquirePlan::Wait(rx, waiter_id) => self.wait_for_slot(rx, waiter_id, timeout).await,
        }
    }

    /// Return a connection to the pool.
    ///
    /// Releasing an unknown connection (one this pool no longer tracks)
    /// is a logged no-op, as is releasing after shutdown. A connection
    /// flagged unhealthy while checked out is destroyed here instead of
    /// going back to idle.
    pub async fn release(&self, conn: PooledConnection<F::Resource>) {
        let id = conn.id;
        drop(conn);

        let doomed_entry = {
            let mut inner = self.inner.lock().await;
            if inner.shut_down {
                // Shutdown already destroyed everything it tracked
                return;
            }
            let Some(entry) = inner.active.remove(&id) else {
                warn!(id, "release of unknown or already released connection");
                return;
            };
            if inner.doomed.remove(&id) {
                Some(entry)
            } else {
                inner.offer(entry);
                None
            }
        };

        if let Some(entry) = doomed_entry {
            info!(id, "destroying connection flagged unhealthy while in use");
            self.destroy_entry(entry).await;
            let _ = self.replenish().await;
        }
    }

    /// Shut the pool down: reject all waiters, stop background tasks, and
    /// destroy every pooled connection. Idempotent.
    pub async fn shutdown(&self) {
        let to_destroy = {
            let mut inner = self.inner.lock().await;
            if inner.shut_down {
                debug!("pool already shut down");
                return;
            }
            inner.shut_down = true;
            for waiter in inner.waiters.drain(..) {
                let _ = waiter.tx.send(Err(PoolError::Shutdown));
            }
            inner.doomed.clear();
            let mut all: Vec<PoolEntry<F::Resource>> = inner.idle.drain(..).collect();
            all.extend(inner.active.drain().map(|(_, entry)| entry));
            all
        };

        // Wake the reaper and health monitor before destroying anything
        let _ = self.shutdown_tx.send(true);
        self.breaker.shutdown().await;
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }

        let count = to_destroy.len();
        for entry in to_destroy {
            self.destroy_entry(entry).await;
        }

        info!(destroyed = count, "pool shut down");
        self.events.publish(PoolEvent::PoolShutdown);
    }

    /// Point-in-time statistics snapshot; never mutates pool state
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            active: inner.active.len(),
            idle: inner.idle.len(),
            waiting: inner.waiters.len(),
            total_created: inner.total_created,
            total_destroyed: inner.total_destroyed,
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// The event bus shared by the pool, breaker, and health monitor
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to pool events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// The circuit breaker guarding this pool's factory
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Snapshot every pooled resource for out-of-band validation
    pub async fn snapshot(&self) -> Vec<ResourceSnapshot<F::Resource>> {
        let inner = self.inner.lock().await;
        let mut out = Vec::with_capacity(inner.idle.len() + inner.active.len());
        for entry in &inner.idle {
            out.push(ResourceSnapshot {
                id: entry.id,
                resource: Arc::clone(&entry.resource),
                active: false,
            });
        }
        for entry in inner.active.values() {
            out.push(ResourceSnapshot {
                id: entry.id,
                resource: Arc::clone(&entry.resource),
                active: true,
            });
        }
        out
    }

    /// Destroy idle connections past the idle timeout, never dropping the
    /// idle count below `min_connections`. Returns how many were removed.
    pub async fn cleanup_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let expired = {
            let mut inner = self.inner.lock().await;
            let mut expired = Vec::new();
            while inner.idle.len() > self.config.min_connections {
                let stale = inner
                    .idle
                    .front()
                    .map(|entry| entry.idle_since.elapsed() >= idle_timeout)
                    .unwrap_or(false);
                if !stale {
                    break;
                }
                if let Some(entry) = inner.idle.pop_front() {
                    expired.push(entry);
                }
            }
            expired
        };

        let removed = expired.len();
        for entry in expired {
            debug!(id = entry.id, "destroying idle-timed-out connection");
            self.destroy_entry(entry).await;
        }
        if removed > 0 {
            debug!(removed, "cleaned up idle connections");
        }
        removed
    }

    pub(crate) fn factory(&self) -> &F {
        &self.factory
    }

    pub(crate) fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Remove an unhealthy connection. Idle connections are destroyed on
    /// the spot; active ones are flagged and destroyed when released.
    pub(crate) async fn retire(&self, id: u64) -> RetireOutcome {
        let entry = {
            let mut inner = self.inner.lock().await;
            if inner.shut_down {
                return RetireOutcome::NotFound;
            }
            if let Some(pos) = inner.idle.iter().position(|entry| entry.id == id) {
                inner.idle.remove(pos)
            } else if inner.active.contains_key(&id) {
                inner.doomed.insert(id);
                return RetireOutcome::FlaggedActive;
            } else {
                return RetireOutcome::NotFound;
            }
        };

        match entry {
            Some(entry) => {
                self.destroy_entry(entry).await;
                RetireOutcome::Destroyed
            }
            None => RetireOutcome::NotFound,
        }
    }

    /// Create connections until the idle floor is met and no waiter is
    /// starving, capacity permitting. Returns the ids created and the
    /// error that stopped the loop early, if any.
    ///
    /// Used for pre-population, after unhealthy replacements, and after a
    /// doomed connection is destroyed on release. Create failures here do
    /// not feed the breaker; only caller-driven acquisition attempts do.
    pub(crate) async fn replenish(&self) -> (Vec<u64>, Option<PoolError>) {
        let mut created = Vec::new();
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.shut_down {
                    return (created, Some(PoolError::Shutdown));
                }
                let below_floor = inner.idle.len() < self.config.min_connections;
                let starving = !inner.waiters.is_empty();
                if inner.size() >= self.config.max_connections || (!below_floor && !starving) {
                    return (created, None);
                }
                inner.creating += 1;
            }

            match self.factory.create().await {
                Ok(resource) => {
                    let mut inner = self.inner.lock().await;
                    inner.creating -= 1;
                    if inner.shut_down {
                        drop(inner);
                        self.factory.destroy(&resource).await;
                        self.inner.lock().await.total_destroyed += 1;
                        return (created, Some(PoolError::Shutdown));
                    }
                    let entry = inner.register(resource);
                    created.push(entry.id);
                    inner.offer(entry);
                }
                Err(e) => {
                    self.inner.lock().await.creating -= 1;
                    warn!(error = %e, "replenish create failed");
                    return (created, Some(PoolError::Create(Box::new(e))));
                }
            }
        }
    }

    /// Create a fresh connection for an acquiring caller; the capacity
    /// slot was already reserved under the lock.
    async fn create_for_caller(&self) -> Result<PooledConnection<F::Resource>, PoolError> {
        match self.factory.create().await {
            Ok(resource) => {
                self.breaker.on_success().await;
                let mut inner = self.inner.lock().await;
                inner.creating -= 1;
                if inner.shut_down {
                    drop(inner);
                    self.factory.destroy(&resource).await;
                    self.inner.lock().await.total_destroyed += 1;
                    return Err(PoolError::Shutdown);
                }
                let entry = inner.register(resource);
                let handle = entry.handle();
                info!(
                    id = entry.id,
                    total_created = inner.total_created,
                    "created new connection"
                );
                inner.active.insert(entry.id, entry);
                Ok(handle)
            }
            Err(e) => {
                self.inner.lock().await.creating -= 1;
                self.breaker.on_failure().await;
                warn!(error = %e, "connection creation failed");
                self.events.publish(PoolEvent::ConnectionFailure {
                    error: e.to_string(),
                });
                Err(PoolError::Create(Box::new(e)))
            }
        }
    }

    /// Park as a waiter until a connection is handed over or the deadline
    /// passes. A hand-off that races the deadline is put back into the
    /// pool and the caller still observes the timeout.
    async fn wait_for_slot(
        &self,
        mut rx: oneshot::Receiver<Result<PooledConnection<F::Resource>, PoolError>>,
        waiter_id: u64,
        timeout: Duration,
    ) -> Result<PooledConnection<F::Resource>, PoolError> {
        tokio::select! {
            result = &mut rx => match result {
                Ok(outcome) => outcome,
                // Sender dropped without a hand-off: the pool went away
                Err(_) => Err(PoolError::Shutdown),
            },
            _ = tokio::time::sleep(timeout) => {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(pos) = inner.waiters.iter().position(|w| w.id == waiter_id) {
                        inner.waiters.remove(pos);
                        debug!(waiter = waiter_id, "acquire timed out; waiter de-queued");
                        return Err(PoolError::AcquireTimeout(timeout));
                    }
                }
                // Served in the same instant the deadline fired: give the
                // connection back so nothing leaks.
                if let Ok(Ok(conn)) = rx.try_recv() {
                    debug!(waiter = waiter_id, "hand-off raced the deadline; returning connection");
                    self.release(conn).await;
                }
                Err(PoolError::AcquireTimeout(timeout))
            }
        }
    }

    async fn destroy_entry(&self, entry: PoolEntry<F::Resource>) {
        debug!(
            id = entry.id,
            age_secs = entry.created_at.elapsed().as_secs(),
            "destroying connection"
        );
        self.factory.destroy(&entry.resource).await;
        self.inner.lock().await.total_destroyed += 1;
    }

    async fn spawn_reaper(pool: &Arc<Self>) {
        let period = pool
            .config
            .idle_timeout()
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        let mut shutdown = pool.shutdown_tx.subscribe();
        let reaper_slot = &pool.reaper;
        let pool = Arc::clone(pool);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { pool.cleanup_idle().await; }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("idle reaper exited");
        });
        *reaper_slot.lock().await = Some(handle);
    }
}
