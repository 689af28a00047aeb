//! Task-scoped connection registry.
//!
//! Each concurrent unit of work (a request handler, a background job) is
//! identified by a [`ScopeId`] and owns at most one [`Slot`] - the record
//! tracking its leased connection and transaction nesting depth. The registry
//! is an explicit context-keyed lookup rather than a process global: the same
//! pool code works whether callers allocate a fresh scope per task or fall
//! back to [`ScopeId::GLOBAL`] when no task scheduler is active.
//!
//! A slot is only ever mutated by its owning scope (through the manager);
//! first access lazily creates a default closed slot, so uninitialized reads
//! never observe an undefined state.

use crate::conn::driver::DbConnection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

/// Identifies the concurrent unit of work a connection is leased to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) u64);

impl ScopeId {
    /// Process-wide fallback scope, used when no per-task scoping is wanted.
    pub const GLOBAL: ScopeId = ScopeId(0);
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state for one scope.
///
/// Invariant: `depth > 0` implies `conn.is_some()`.
#[derive(Debug, Default)]
pub struct Slot {
    /// The leased physical connection, absent while the scope holds no lease.
    pub conn: Option<DbConnection>,
    /// Transaction nesting depth; re-entrant acquires increment this.
    pub depth: u32,
    /// Set when an error was signaled during the scope's lifetime;
    /// the outermost release rolls back instead of committing.
    pub failed: bool,
}

impl Slot {
    /// Whether this slot currently holds an open connection.
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }
}

/// Shared handle to one scope's slot.
pub type SlotHandle = Arc<AsyncMutex<Slot>>;

/// Maps scope identifiers to their connection slots.
pub struct ConnectionRegistry {
    slots: Mutex<HashMap<ScopeId, SlotHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Get the slot for a scope, lazily creating a default (closed, depth 0)
    /// slot on first access.
    pub fn current(&self, scope: ScopeId) -> SlotHandle {
        let mut slots = self.slots.lock().expect("registry lock poisoned");
        Arc::clone(slots.entry(scope).or_default())
    }

    /// Drop a scope's slot. Called when the scope ends.
    pub fn remove(&self, scope: ScopeId) -> Option<SlotHandle> {
        let mut slots = self.slots.lock().expect("registry lock poisoned");
        slots.remove(&scope)
    }

    /// Allocate a fresh scope identifier.
    pub fn allocate(&self) -> ScopeId {
        ScopeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Take every registered slot, leaving the registry empty.
    pub fn drain(&self) -> Vec<(ScopeId, SlotHandle)> {
        let mut slots = self.slots.lock().expect("registry lock poisoned");
        slots.drain().collect()
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.slots.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for a concurrent unit of work.
///
/// Dropping the scope unregisters its slot; any connection still held is
/// dropped with it, which the driver treats as an unclean close.
pub struct Scope {
    id: ScopeId,
    registry: Arc<ConnectionRegistry>,
}

impl Scope {
    pub(crate) fn new(registry: Arc<ConnectionRegistry>) -> Self {
        let id = registry.allocate();
        Self { id, registry }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some(slot) = self.registry.remove(self.id) {
            if let Ok(slot) = slot.try_lock() {
                if slot.is_open() {
                    warn!(scope = %self.id, "Scope dropped with an open connection");
                }
            }
        }
    }
}
