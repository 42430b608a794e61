//! Bounded, cached, single-flight access to target control channels.
//!
//! The pool holds at most one slot per target id. A slot is either an open
//! connection or a shared in-flight open that every concurrent caller for the
//! same target awaits. Work on a connection is serialized through a per-target
//! async mutex; a reference count (the lease) protects connections that are
//! in use, or whose streams are still being read, from eviction.

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rule_engine::{ConnectionDescriptor, TargetId};
use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::retry::RetryPolicy;
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::target_control::{ConnectionFactory, ControlChannel};

type OpenResult = Result<Arc<ManagedConnection>, ConnectionError>;
type SharedOpen = Shared<BoxFuture<'static, OpenResult>>;

// ================================================================================================
// MANAGED CONNECTION
// ================================================================================================

/// The single open control channel for one target.
pub struct ManagedConnection {
    /// Pool-unique id, used to tell a reopened connection from the old one
    id: u64,
    target: TargetId,
    channel: Arc<tokio::sync::Mutex<Box<dyn ControlChannel>>>,
    /// Held for the whole of one unit of work, independent of the channel guard
    work: Arc<tokio::sync::Mutex<()>>,
    in_use: AtomicUsize,
    last_used: Mutex<Instant>,
    /// Cancelled when the target is removed or the manager shuts down
    cancel: CancellationToken,
}

impl ManagedConnection {
    fn new(
        id: u64,
        target: TargetId,
        channel: Box<dyn ControlChannel>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            target,
            channel: Arc::new(tokio::sync::Mutex::new(channel)),
            work: Arc::new(tokio::sync::Mutex::new(())),
            in_use: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
            cancel,
        }
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    /// Number of outstanding leases.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    // Callers that can race with eviction must hold the pool lock.
    fn lease(self: &Arc<Self>) -> ConnectionLease {
        self.in_use.fetch_add(1, Ordering::SeqCst);
        ConnectionLease {
            connection: Arc::clone(self),
        }
    }

    async fn close(&self) {
        let mut channel = self.channel.lock().await;
        channel.disconnect().await;
        info!("Closed connection to {}", self.target);
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Reference-count guard on a ManagedConnection.
///
/// Increments the in-use count when created and decrements it (refreshing
/// the last-used time) when dropped, whether the work succeeded or not.
pub struct ConnectionLease {
    connection: Arc<ManagedConnection>,
}

impl ConnectionLease {
    pub fn target(&self) -> &TargetId {
        &self.connection.target
    }
}

impl Clone for ConnectionLease {
    fn clone(&self) -> Self {
        // The count is already positive, so eviction cannot race this.
        self.connection.in_use.fetch_add(1, Ordering::SeqCst);
        ConnectionLease {
            connection: Arc::clone(&self.connection),
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        *self.connection.last_used.lock() = Instant::now();
        self.connection.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive, ready access to a target's control channel for one unit of work.
pub struct ConnectedChannel {
    guard: OwnedMutexGuard<Box<dyn ControlChannel>>,
    lease: ConnectionLease,
}

impl ConnectedChannel {
    pub fn target(&self) -> &TargetId {
        self.lease.target()
    }

    /// Another lease on the same connection, for values that outlive the
    /// unit of work (e.g. an open recording stream).
    pub fn lease(&self) -> ConnectionLease {
        self.lease.clone()
    }
}

impl Deref for ConnectedChannel {
    type Target = dyn ControlChannel;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for ConnectedChannel {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

// ================================================================================================
// POOL STATE
// ================================================================================================

enum Slot {
    Opening { generation: u64, open: SharedOpen },
    Open(Arc<ManagedConnection>),
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<TargetId, Slot>,
    cancellations: HashMap<TargetId, CancellationToken>,
    closed: bool,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    config: ConnectionConfig,
    retry: RetryPolicy,
    state: Mutex<PoolState>,
    generations: AtomicU64,
    shutdown: CancellationToken,
}

impl PoolInner {
    /// Drops an Opening slot if it still belongs to this open attempt.
    fn discard_opening(&self, target: &TargetId, generation: u64) {
        let mut state = self.state.lock();
        if matches!(
            state.slots.get(target),
            Some(Slot::Opening { generation: g, .. }) if *g == generation
        ) {
            state.slots.remove(target);
        }
    }

    /// Replaces an Opening slot with the opened connection. False if the slot
    /// was removed meanwhile.
    fn install(&self, connection: &Arc<ManagedConnection>) -> bool {
        let mut state = self.state.lock();
        let current = matches!(
            state.slots.get(&connection.target),
            Some(Slot::Opening { generation, .. }) if *generation == connection.id
        );
        if current {
            state
                .slots
                .insert(connection.target.clone(), Slot::Open(Arc::clone(connection)));
        }
        current
    }
}

// ================================================================================================
// CONNECTION MANAGER
// ================================================================================================

/// Connection pool service. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<PoolInner>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ConnectionConfig) -> Self {
        let retry = RetryPolicy::for_connections(&config);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                retry,
                state: Mutex::new(PoolState::default()),
                generations: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Runs `task` with exclusive access to the target's connection, opening
    /// it if needed.
    ///
    /// The connection stays exclusive and leased until the task's future
    /// resolves, even if the task drops its `ConnectedChannel` early. The
    /// future is dropped and `Cancelled` returned if the target is removed
    /// while waiting or running.
    pub async fn with_connection<T, E, F, Fut>(
        &self,
        descriptor: &ConnectionDescriptor,
        task: F,
    ) -> Result<T, E>
    where
        F: FnOnce(ConnectedChannel) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ConnectionError>,
    {
        let lease = self.acquire(descriptor).await?;
        let connection = Arc::clone(&lease.connection);
        let cancelled = || ConnectionError::Cancelled(connection.target.clone());

        let turn = tokio::select! {
            turn = Arc::clone(&connection.work).lock_owned() => turn,
            _ = connection.cancel.cancelled() => return Err(cancelled().into()),
        };
        let guard = tokio::select! {
            guard = Arc::clone(&connection.channel).lock_owned() => guard,
            _ = connection.cancel.cancelled() => return Err(cancelled().into()),
        };

        let work = task(ConnectedChannel {
            guard,
            lease: lease.clone(),
        });
        let result = tokio::select! {
            result = work => result,
            _ = connection.cancel.cancelled() => Err(cancelled().into()),
        };
        drop(turn);
        drop(lease);
        result
    }

    /// Spawns `with_connection` as a task and returns its join handle.
    pub fn submit<T, E, F, Fut>(
        &self,
        descriptor: ConnectionDescriptor,
        task: F,
    ) -> JoinHandle<Result<T, E>>
    where
        F: FnOnce(ConnectedChannel) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<ConnectionError> + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move { manager.with_connection(&descriptor, task).await })
    }

    async fn acquire(&self, descriptor: &ConnectionDescriptor) -> Result<ConnectionLease, ConnectionError> {
        let target = descriptor.target_id();

        loop {
            let (pending, evicted) = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(ConnectionError::Closed);
                }

                match state.slots.get(target) {
                    Some(Slot::Open(connection)) => return Ok(connection.lease()),
                    Some(Slot::Opening { open, .. }) => (open.clone(), None),
                    None => {
                        let evicted = self.make_room(&mut state, target)?;
                        let cancel = state
                            .cancellations
                            .entry(target.clone())
                            .or_insert_with(|| self.inner.shutdown.child_token())
                            .clone();
                        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
                        let open = self.spawn_open(descriptor.clone(), generation, cancel);
                        state.slots.insert(
                            target.clone(),
                            Slot::Opening {
                                generation,
                                open: open.clone(),
                            },
                        );
                        (open, evicted)
                    }
                }
            };

            if let Some(victim) = evicted {
                info!(
                    "Evicting least recently used connection to {} to make room for {}",
                    victim.target, target
                );
                victim.close().await;
            }

            let connection = pending.await?;

            // The connection may have been evicted between the open finishing
            // and this caller leasing it. Lease under the lock or start over.
            let state = self.inner.state.lock();
            if let Some(Slot::Open(current)) = state.slots.get(target) {
                if Arc::ptr_eq(current, &connection) {
                    return Ok(connection.lease());
                }
            }
            debug!("Connection to {} changed while waiting, retrying acquire", target);
        }
    }

    /// Evicts the least recently used idle connection if the pool is full.
    fn make_room(
        &self,
        state: &mut PoolState,
        target: &TargetId,
    ) -> Result<Option<Arc<ManagedConnection>>, ConnectionError> {
        if state.slots.len() < self.inner.config.max_open {
            return Ok(None);
        }

        let victim = state
            .slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Open(connection) if connection.in_use() == 0 => {
                    Some((id.clone(), connection.last_used()))
                }
                _ => None,
            })
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(id, _)| id);

        match victim.and_then(|id| state.slots.remove(&id)) {
            Some(Slot::Open(connection)) => Ok(Some(connection)),
            _ => {
                warn!(
                    "Connection pool exhausted ({} in use) while connecting to {}",
                    self.inner.config.max_open, target
                );
                Err(ConnectionError::CapacityExhausted {
                    target: target.clone(),
                    max_open: self.inner.config.max_open,
                })
            }
        }
    }

    // The open runs as its own task so it completes (or is cleaned up) even
    // when every waiter gives up.
    fn spawn_open(
        &self,
        descriptor: ConnectionDescriptor,
        generation: u64,
        cancel: CancellationToken,
    ) -> SharedOpen {
        let inner = Arc::clone(&self.inner);
        let cleanup = Arc::clone(&self.inner);
        let failed_target = descriptor.target_id().clone();

        let handle = tokio::spawn(async move {
            let target = descriptor.target_id().clone();
            let credentials = descriptor.credentials();

            let opened = tokio::select! {
                result = inner.retry.execute(|attempt| {
                    debug!("Opening connection to {} (attempt {})", target, attempt + 1);
                    inner.factory.open(&target, credentials)
                }) => result,
                _ = cancel.cancelled() => {
                    inner.discard_opening(&target, generation);
                    return Err(ConnectionError::Cancelled(target.clone()));
                }
            };

            match opened {
                Err(exhausted) => {
                    inner.discard_opening(&target, generation);
                    warn!(
                        "Failed to connect to {} after {} attempt(s): {}",
                        target, exhausted.attempts, exhausted.last
                    );
                    Err(ConnectionError::ConnectionFailed {
                        target,
                        attempts: exhausted.attempts,
                        reason: exhausted.last.to_string(),
                    })
                }
                Ok(channel) => {
                    let connection = Arc::new(ManagedConnection::new(
                        generation,
                        target.clone(),
                        channel,
                        cancel,
                    ));
                    if inner.install(&connection) {
                        info!("Opened connection to {}", target);
                        Ok(connection)
                    } else {
                        // Target removed or manager closed mid-open
                        connection.close().await;
                        Err(ConnectionError::Cancelled(target))
                    }
                }
            }
        });

        handle
            .map(move |joined| {
                joined.unwrap_or_else(|e| {
                    cleanup.discard_opening(&failed_target, generation);
                    warn!("Open task for {} failed: {}", failed_target, e);
                    Err(ConnectionError::ConnectionFailed {
                        target: failed_target,
                        attempts: 0,
                        reason: format!("open task failed: {}", e),
                    })
                })
            })
            .boxed()
            .shared()
    }

    // ============================================================================================
    // EVICTION AND SHUTDOWN
    // ============================================================================================

    /// Closes every connection idle longer than the configured TTL.
    /// Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let ttl = self.inner.config.idle_ttl;
        let expired: Vec<Arc<ManagedConnection>> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<TargetId> = state
                .slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Open(c) if c.in_use() == 0 && c.idle_for() > ttl => Some(id.clone()),
                    _ => None,
                })
                .collect();
            ids.iter()
                .filter_map(|id| match state.slots.remove(id) {
                    Some(Slot::Open(c)) => Some(c),
                    _ => None,
                })
                .collect()
        };

        for connection in &expired {
            info!(
                "Evicting connection to {} after {:?} idle",
                connection.target,
                connection.idle_for()
            );
            connection.close().await;
        }
        expired.len()
    }

    /// Starts the background task that periodically evicts idle connections.
    /// Stops when the manager is closed.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.reap_interval;

        tokio::spawn(async move {
            info!("Starting idle connection reaper with {:?} interval", period);
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = manager.evict_idle().await;
                        if evicted > 0 {
                            debug!("Reaper closed {} idle connection(s)", evicted);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Cancels pending work for a removed target and closes its connection.
    pub async fn on_target_removed(&self, target: &TargetId) {
        let (cancel, slot) = {
            let mut state = self.inner.state.lock();
            (
                state.cancellations.remove(target),
                state.slots.remove(target),
            )
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(Slot::Open(connection)) = slot {
            connection.close().await;
        }
    }

    /// Cancels all work and closes every connection. Further calls fail with
    /// `Closed`.
    pub async fn close_all(&self) {
        let open: Vec<Arc<ManagedConnection>> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.cancellations.clear();
            state
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Open(c) => Some(c),
                    Slot::Opening { .. } => None,
                })
                .collect()
        };
        self.inner.shutdown.cancel();

        for connection in open {
            connection.close().await;
        }
        info!("Connection manager closed");
    }

    // ============================================================================================
    // INTROSPECTION
    // ============================================================================================

    /// Number of open or opening connections.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    pub fn is_open(&self, target: &TargetId) -> bool {
        matches!(self.inner.state.lock().slots.get(target), Some(Slot::Open(_)))
    }

    /// Outstanding leases on the target's connection, `None` if not open.
    pub fn in_use(&self, target: &TargetId) -> Option<usize> {
        match self.inner.state.lock().slots.get(target) {
            Some(Slot::Open(connection)) => Some(connection.in_use()),
            _ => None,
        }
    }
}
