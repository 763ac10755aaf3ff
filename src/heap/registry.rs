//! Thread-safe store of managed values rooted on behalf of native code.
//!
//! Native code (background workers, pending tasks) cannot hold managed values
//! directly: the collector would not see them. Instead it stores the value
//! here and keeps the returned [`RootId`]. The registry is registered with the
//! engine as a tracing root, so every stored value stays alive until removed.
//!
//! ```text
//! worker thread                     script thread / collector
//! ─────────────                     ─────────────────────────
//! store(v) ──► write lock ──► id    trace() ──► read lock ──► visit all
//! get(id)  ──► read lock  ──► v
//! remove(id) ► write lock
//! ```
//!
//! The registry also tracks [`HeapUser`]s: native objects holding roots that
//! must let go of them before their domain is torn down.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::engine::{DomainId, RootTracer, ScriptEngine};
use crate::error::RegistryError;

/// Handle to a value stored in a [`HeapValueRegistry`].
///
/// Ids are issued monotonically and never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(u64);

impl RootId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root#{}", self.0)
    }
}

/// Native object that must release its rooted values before a collection
/// that tears down its domain (or the whole runtime).
pub trait HeapUser: Send + Sync {
    fn prepare_for_global_gc(&self);
}

/// Registration handle returned by [`HeapValueRegistry::register_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserKey(u64);

struct RegisteredUser {
    key: UserKey,
    domain: Option<DomainId>,
    user: Weak<dyn HeapUser>,
}

struct RootTable<V> {
    next_id: u64,
    entries: HashMap<RootId, V>,
}

pub struct HeapValueRegistry<V> {
    roots: RwLock<RootTable<V>>,
    users: Mutex<Vec<RegisteredUser>>,
    next_user: AtomicU64,
    attached: AtomicBool,
}

impl<V> Default for HeapValueRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HeapValueRegistry<V> {
    pub fn new() -> Self {
        Self {
            roots: RwLock::new(RootTable {
                next_id: 1,
                entries: HashMap::new(),
            }),
            users: Mutex::new(Vec::new()),
            next_user: AtomicU64::new(1),
            attached: AtomicBool::new(false),
        }
    }

    /// Root `value` and return its id.
    pub fn store(&self, value: V) -> RootId {
        let mut table = self.roots.write().expect("heap value registry poisoned");
        let id = RootId(table.next_id);
        table.next_id += 1;
        table.entries.insert(id, value);
        tracing::trace!("Rooted {} (live: {})", id, table.entries.len());
        id
    }

    /// Fetch a copy of the value stored under `id`.
    pub fn get(&self, id: RootId) -> Result<V, RegistryError>
    where
        V: Clone,
    {
        self.roots
            .read()
            .expect("heap value registry poisoned")
            .entries
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Unroot `id`. Removing an unknown id is a no-op.
    pub fn remove(&self, id: RootId) -> Option<V> {
        let removed = self
            .roots
            .write()
            .expect("heap value registry poisoned")
            .entries
            .remove(&id);
        if removed.is_some() {
            tracing::trace!("Unrooted {}", id);
        }
        removed
    }

    /// Unroot `id` and hand back its value.
    pub fn take(&self, id: RootId) -> Result<V, RegistryError> {
        self.remove(id).ok_or(RegistryError::NotFound(id))
    }

    pub fn contains(&self, id: RootId) -> bool {
        self.roots
            .read()
            .expect("heap value registry poisoned")
            .entries
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.roots
            .read()
            .expect("heap value registry poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Track a heap user, optionally scoped to one domain.
    pub fn register_user(&self, domain: Option<DomainId>, user: &Arc<dyn HeapUser>) -> UserKey {
        let key = UserKey(self.next_user.fetch_add(1, Ordering::Relaxed));
        self.users
            .lock()
            .expect("heap user list poisoned")
            .push(RegisteredUser {
                key,
                domain,
                user: Arc::downgrade(user),
            });
        key
    }

    pub fn unregister_user(&self, key: UserKey) {
        self.users
            .lock()
            .expect("heap user list poisoned")
            .retain(|registered| registered.key != key);
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().expect("heap user list poisoned").len()
    }

    /// Ask heap users to release their roots ahead of a teardown collection.
    ///
    /// With `Some(domain)` only users of that domain are notified; with
    /// `None` every user is. Notified users are unregistered. Returns the
    /// number of users notified.
    pub fn prepare_for_global_gc(&self, domain: Option<DomainId>) -> usize {
        let notified: Vec<Arc<dyn HeapUser>> = {
            let mut users = self.users.lock().expect("heap user list poisoned");
            let mut selected = Vec::new();
            users.retain(|registered| {
                let matches = domain.is_none() || registered.domain == domain;
                if !matches {
                    return true;
                }
                if let Some(user) = registered.user.upgrade() {
                    selected.push(user);
                }
                false
            });
            selected
        };

        // Users may call back into the registry
        for user in &notified {
            user.prepare_for_global_gc();
        }

        if !notified.is_empty() {
            tracing::debug!(
                "Prepared {} heap users for collection ({})",
                notified.len(),
                domain.map_or_else(|| "all domains".to_string(), |d| d.to_string())
            );
        }

        notified.len()
    }
}

impl<V: Send + Sync + 'static> HeapValueRegistry<V> {
    /// Register the registry as a tracing root of `engine`.
    ///
    /// Registration happens under the write lock so that no trace can run
    /// against a half-registered table.
    pub fn attach<E: ScriptEngine<Value = V>>(self: &Arc<Self>, engine: &E) {
        let _table = self.roots.write().expect("heap value registry poisoned");
        if self.attached.swap(true, Ordering::AcqRel) {
            return;
        }
        let tracer: Arc<dyn RootTracer<V>> = Arc::clone(self) as Arc<dyn RootTracer<V>>;
        engine.register_trace_root(tracer);
        tracing::debug!("Heap value registry attached to engine");
    }

    pub fn detach<E: ScriptEngine<Value = V>>(&self, engine: &E) {
        let _table = self.roots.write().expect("heap value registry poisoned");
        if !self.attached.swap(false, Ordering::AcqRel) {
            return;
        }
        engine.unregister_trace_root();
        tracing::debug!("Heap value registry detached from engine");
    }
}

impl<V: Send + Sync> RootTracer<V> for HeapValueRegistry<V> {
    fn trace(&self, visit: &mut dyn FnMut(&V)) {
        let table = self.roots.read().expect("heap value registry poisoned");
        for value in table.entries.values() {
            visit(value);
        }
    }
}

impl<V> fmt::Debug for HeapValueRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapValueRegistry")
            .field("live_roots", &self.len())
            .field("heap_users", &self.user_count())
            .field("attached", &self.is_attached())
            .finish()
    }
}
