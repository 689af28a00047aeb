//! Async connection manager.
//!
//! Acquires and releases physical connections on behalf of scopes. The pooled
//! variant (selected by a `+pool` URL scheme) bounds concurrent physical
//! connections with a capacity limit and a FIFO wait queue; the unpooled
//! variant opens one connection per scope with no cap. Both are re-entrant:
//! nested acquisition within one scope increments the slot's transaction
//! depth instead of opening a second physical connection.
//!
//! Release semantics are fixed: commit on clean exit, rollback when an error
//! was signaled, then close the connection and wake the oldest waiter.
//!
//! Locking rules: the pool state mutex is synchronous and never held across
//! an await; the physical connect is serialized by its own async mutex so two
//! scopes never race to create redundant connections.

use crate::conn::driver::DbConnection;
use crate::conn::registry::{ConnectionRegistry, Scope, ScopeId, SlotHandle};
use crate::conn::url::ConnectInfo;
use crate::error::{DbError, DbResult};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, warn};

/// Pool capacity used when the URL does not specify `max_connections`.
pub const DEFAULT_POOL_CAPACITY: u32 = 10;

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<()>,
}

struct PoolState {
    in_use: usize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    closed: bool,
}

pub struct ConnectionManager {
    info: ConnectInfo,
    capacity: Option<usize>,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<PoolState>,
    /// Serializes physical connection setup.
    connect_lock: AsyncMutex<()>,
    /// In-memory SQLite: one fixed connection shared by every scope.
    /// Independent `:memory:` databases per pool slot would not share data.
    shared: Option<SlotHandle>,
}

impl ConnectionManager {
    /// Create a manager for a parsed connection target.
    pub fn new(info: ConnectInfo) -> Self {
        let capacity = info
            .pooled
            .then(|| info.max_connections.unwrap_or(DEFAULT_POOL_CAPACITY) as usize);
        let shared = info.memory.then(SlotHandle::default);

        if info.memory && info.pooled {
            info!("In-memory database: routing all scopes to a single connection");
        }

        Self {
            info,
            capacity,
            registry: Arc::new(ConnectionRegistry::new()),
            state: Mutex::new(PoolState {
                in_use: 0,
                waiters: VecDeque::new(),
                next_ticket: 0,
                closed: false,
            }),
            connect_lock: AsyncMutex::new(()),
            shared,
        }
    }

    /// Parse a connection URL and create a manager for it.
    pub fn from_url(url: &str) -> DbResult<Self> {
        Ok(Self::new(ConnectInfo::parse(url)?))
    }

    /// Allocate a fresh scope registered with this manager.
    pub fn scope(&self) -> Scope {
        Scope::new(Arc::clone(&self.registry))
    }

    /// The connection target this manager serves.
    pub fn connect_info(&self) -> &ConnectInfo {
        &self.info
    }

    /// Configured pool capacity, `None` for the unpooled variant.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of physical connections currently leased out.
    pub fn in_use(&self) -> usize {
        self.state.lock().expect("pool state lock poisoned").in_use
    }

    /// Number of acquisitions currently suspended on a saturated pool.
    pub fn waiter_count(&self) -> usize {
        self.state
            .lock()
            .expect("pool state lock poisoned")
            .waiters
            .len()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().expect("pool state lock poisoned").closed
    }

    fn slot_for(&self, scope: ScopeId) -> SlotHandle {
        match &self.shared {
            Some(shared) => Arc::clone(shared),
            None => self.registry.current(scope),
        }
    }

    /// Acquire a connection for `scope`, suspending FIFO when the pool is
    /// saturated. Re-entrant: if the scope already holds an open slot this
    /// increments its transaction depth and returns the same connection.
    pub async fn acquire(&self, scope: ScopeId) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        if self.shared.is_some() {
            return self.acquire_shared().await;
        }

        let slot = self.registry.current(scope);
        {
            let mut guard = slot.lock().await;
            if guard.depth > 0 {
                guard.depth += 1;
                debug!(scope = %scope, depth = guard.depth, "Re-entrant acquire");
                return Ok(());
            }
        }

        self.admit().await?;

        let connected = async {
            let _serial = self.connect_lock.lock().await;
            let mut conn = DbConnection::connect(&self.info).await?;
            conn.begin().await?;
            Ok::<_, DbError>(conn)
        }
        .await;

        let conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                self.release_permit();
                return Err(e);
            }
        };

        let mut guard = slot.lock().await;
        guard.conn = Some(conn);
        guard.depth = 1;
        guard.failed = false;
        debug!(scope = %scope, "Connection acquired");
        Ok(())
    }

    /// Shared-slot path for in-memory databases: no pool admission, the one
    /// connection stays open for the manager's lifetime.
    async fn acquire_shared(&self) -> DbResult<()> {
        let Some(shared) = &self.shared else {
            return Err(DbError::internal("shared slot missing"));
        };
        let mut guard = shared.lock().await;
        if guard.conn.is_none() {
            guard.conn = Some(DbConnection::connect(&self.info).await?);
        }
        if guard.depth == 0 {
            guard.failed = false;
            if let Some(conn) = guard.conn.as_mut() {
                conn.begin().await?;
            }
        }
        guard.depth += 1;
        Ok(())
    }

    /// Pool admission: take a free permit or join the FIFO queue and suspend.
    /// A released permit passes directly to the oldest waiter, so a granted
    /// waiter skips the capacity check.
    async fn admit(&self) -> DbResult<()> {
        let Some(capacity) = self.capacity else {
            return Ok(());
        };

        let pending = {
            let mut state = self.state.lock().expect("pool state lock poisoned");
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            // Existing waiters go first even when a permit is free.
            if state.waiters.is_empty() && state.in_use < capacity {
                state.in_use += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.waiters.push_back(Waiter { ticket, tx });
                debug!(ticket, queued = state.waiters.len(), "Pool saturated, waiting");
                Some((ticket, rx))
            }
        };

        let Some((ticket, rx)) = pending else {
            return Ok(());
        };

        let mut guard = WaitGuard {
            manager: self,
            ticket,
            armed: true,
        };
        let granted = rx.await;
        guard.armed = false;
        match granted {
            Ok(()) => Ok(()),
            Err(_) => Err(DbError::PoolClosed),
        }
    }

    /// Return a permit: wake the oldest waiter if any, otherwise free a slot.
    fn release_permit(&self) {
        if self.capacity.is_none() {
            return;
        }
        let mut state = self.state.lock().expect("pool state lock poisoned");
        if state.closed {
            state.in_use = state.in_use.saturating_sub(1);
            return;
        }
        hand_off(&mut state);
    }

    /// Release `scope`'s lease: decrement depth, and at zero commit (clean) or
    /// roll back (failed), close the connection, and wake the oldest waiter.
    /// A commit failure still rolls back and closes before surfacing.
    pub async fn release(&self, scope: ScopeId) -> DbResult<()> {
        let slot = self.slot_for(scope);
        let mut guard = slot.lock().await;
        if guard.depth == 0 {
            return Err(DbError::NotConnected { scope: scope.0 });
        }
        guard.depth -= 1;
        if guard.depth > 0 {
            debug!(scope = %scope, depth = guard.depth, "Nested release");
            return Ok(());
        }

        let failed = guard.failed;
        guard.failed = false;

        if self.shared.is_some() {
            // The single in-memory connection outlives individual scopes.
            let Some(conn) = guard.conn.as_mut() else {
                return Ok(());
            };
            if failed {
                return conn.rollback().await;
            }
            if let Err(e) = conn.commit().await {
                let _ = conn.rollback().await;
                return Err(e);
            }
            return Ok(());
        }

        let Some(mut conn) = guard.conn.take() else {
            self.release_permit();
            return Err(DbError::internal(format!(
                "Slot for scope {} lost its connection",
                scope
            )));
        };
        drop(guard);

        let outcome = if failed {
            let result = conn.rollback().await;
            if let Err(e) = &result {
                warn!(scope = %scope, error = %e, "Rollback failed");
            }
            result
        } else {
            match conn.commit().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    let _ = conn.rollback().await;
                    Err(e)
                }
            }
        };

        if let Err(e) = conn.close().await {
            warn!(scope = %scope, error = %e, "Close failed");
        }
        self.release_permit();
        debug!(scope = %scope, "Connection released");
        outcome
    }

    /// Signal that an error occurred during the scope's lifetime; the
    /// outermost release will roll back instead of committing.
    pub async fn mark_failed(&self, scope: ScopeId) {
        let slot = self.slot_for(scope);
        let mut guard = slot.lock().await;
        if guard.depth > 0 {
            guard.failed = true;
        }
    }

    /// Run `body` with a connection leased to `scope`: acquire before, release
    /// after on every exit path, rolling back when the body returns an error.
    /// This is the per-request middleware contract.
    pub async fn scoped<T, F, Fut>(&self, scope: ScopeId, body: F) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.acquire(scope).await?;
        let outcome = body().await;
        if outcome.is_err() {
            self.mark_failed(scope).await;
        }
        let released = self.release(scope).await;
        match outcome {
            Ok(value) => released.map(|()| value),
            Err(e) => Err(e),
        }
    }

    /// Execute a statement on the connection leased to `scope`.
    pub async fn execute(&self, scope: ScopeId, sql: &str) -> DbResult<u64> {
        let slot = self.slot_for(scope);
        let mut guard = slot.lock().await;
        match guard.conn.as_mut() {
            Some(conn) => conn.execute(sql).await,
            None => Err(DbError::NotConnected { scope: scope.0 }),
        }
    }

    /// Execute a bound statement on the connection leased to `scope`.
    pub async fn execute_bind(&self, scope: ScopeId, sql: &str, args: &[&str]) -> DbResult<u64> {
        let slot = self.slot_for(scope);
        let mut guard = slot.lock().await;
        match guard.conn.as_mut() {
            Some(conn) => conn.execute_bind(sql, args).await,
            None => Err(DbError::NotConnected { scope: scope.0 }),
        }
    }

    /// Fetch a single string column on the connection leased to `scope`.
    pub async fn fetch_strings(&self, scope: ScopeId, sql: &str) -> DbResult<Vec<String>> {
        let slot = self.slot_for(scope);
        let mut guard = slot.lock().await;
        match guard.conn.as_mut() {
            Some(conn) => conn.fetch_strings(sql).await,
            None => Err(DbError::NotConnected { scope: scope.0 }),
        }
    }

    /// Current transaction depth for a scope (0 when not acquired).
    pub async fn depth(&self, scope: ScopeId) -> u32 {
        let slot = self.slot_for(scope);
        slot.lock().await.depth
    }

    /// Whether a scope currently holds an open connection.
    pub async fn is_open(&self, scope: ScopeId) -> bool {
        let slot = self.slot_for(scope);
        slot.lock().await.is_open()
    }

    /// Off-load a blocking call onto the worker thread pool. This is the
    /// execution strategy for drivers with no cooperative suspend primitive.
    pub async fn run_blocking<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce() -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| DbError::internal(format!("Blocking task failed: {}", e)))?
    }

    /// Forcibly close every open connection and fail all queued waiters.
    /// Called once during orderly shutdown; subsequent acquires fail.
    pub async fn shutdown(&self) {
        let drained: Vec<Waiter> = {
            let mut state = self.state.lock().expect("pool state lock poisoned");
            state.closed = true;
            state.waiters.drain(..).collect()
        };
        if !drained.is_empty() {
            info!(waiters = drained.len(), "Failing queued waiters");
        }
        // Dropping the senders resolves each waiter with a terminal error.
        drop(drained);

        for (scope_id, slot) in self.registry.drain() {
            let mut guard = slot.lock().await;
            guard.depth = 0;
            guard.failed = false;
            if let Some(mut conn) = guard.conn.take() {
                info!(scope = %scope_id, "Closing connection");
                let _ = conn.rollback().await;
                let _ = conn.close().await;
            }
        }

        if let Some(shared) = &self.shared {
            let mut guard = shared.lock().await;
            guard.depth = 0;
            guard.failed = false;
            if let Some(mut conn) = guard.conn.take() {
                let _ = conn.rollback().await;
                let _ = conn.close().await;
            }
        }

        {
            let mut state = self.state.lock().expect("pool state lock poisoned");
            state.in_use = 0;
        }
        info!("All connections closed");
    }
}

/// Wake the oldest waiter with the freed permit, or return it to the pool.
/// Sending inside the state lock guarantees the grant lands before any
/// cancellation cleanup for that waiter can run.
fn hand_off(state: &mut PoolState) {
    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.tx.send(()).is_ok() {
            debug!(ticket = waiter.ticket, "Granted slot to oldest waiter");
            return;
        }
        // Receiver already gone; try the next in line.
    }
    state.in_use = state.in_use.saturating_sub(1);
}

/// Unlinks an abandoned waiter from the queue. If a grant raced with the
/// cancellation, the permit is forwarded to the next waiter so FIFO order
/// and the capacity bound survive.
struct WaitGuard<'a> {
    manager: &'a ConnectionManager,
    ticket: u64,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self
            .manager
            .state
            .lock()
            .expect("pool state lock poisoned");
        if let Some(pos) = state
            .waiters
            .iter()
            .position(|w| w.ticket == self.ticket)
        {
            state.waiters.remove(pos);
        } else if !state.closed {
            hand_off(&mut state);
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("db_type", &self.info.db_type)
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}
