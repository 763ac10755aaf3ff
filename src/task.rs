//! Async task continuations posted back from background workers.
//!
//! A container hands out a [`TaskPoster`] to worker threads. When script
//! starts an async operation the container registers a [`PendingTask`] that
//! roots the continuation context in the heap value registry. The worker
//! later posts a [`TaskMessage`]; the script thread picks it up in
//! `run_pending_jobs()` and invokes the continuation callback with the
//! context followed by the posted values.
//!
//! ```text
//! worker thread ── TaskPoster::complete ──► mpsc ──► TaskMailbox::drain
//!                                                          │
//!                                   registry.take(root) ◄──┤
//!                                                          ▼
//!                                             invoke_callback(name, args)
//! ```
//!
//! While a task is pending, its context is charged to the container's domain
//! by its [`HeapCost`]. Finalizing the container cancels every pending task:
//! the task drops its root and charge, and later messages for it are
//! discarded.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::heap::{
    DomainStats, HeapChargeGuard, HeapCost, HeapUser, HeapValueRegistry, RootId, UserKey,
    charge_to,
};

pub type TaskId = u64;

/// Result of a background operation.
#[derive(Debug)]
pub enum TaskMessage<V> {
    /// Invoke the continuation with these extra arguments.
    Completed(TaskId, Vec<V>),
    /// The operation produced nothing; release the continuation.
    Abandoned(TaskId),
}

/// Posts task results to one container from any thread.
pub struct TaskPoster<V> {
    tx: mpsc::UnboundedSender<TaskMessage<V>>,
}

impl<V> Clone for TaskPoster<V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<V> TaskPoster<V> {
    /// Returns `false` if the container is gone.
    pub fn complete(&self, task: TaskId, args: Vec<V>) -> bool {
        self.tx.send(TaskMessage::Completed(task, args)).is_ok()
    }

    pub fn abandon(&self, task: TaskId) -> bool {
        self.tx.send(TaskMessage::Abandoned(task)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<V> fmt::Debug for TaskPoster<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPoster")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Continuation waiting for a worker result.
///
/// Holds its context rooted until it runs or its domain is torn down.
pub struct PendingTask<V> {
    id: TaskId,
    callback: String,
    root: Mutex<Option<RootId>>,
    registry: Weak<HeapValueRegistry<V>>,
}

impl<V> PendingTask<V> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn callback(&self) -> &str {
        &self.callback
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.lock().expect("pending task poisoned").is_none()
    }

    /// Unroot and return the context. `None` once cancelled.
    fn take_context(&self) -> Option<V> {
        let root = self.root.lock().expect("pending task poisoned").take()?;
        self.registry.upgrade()?.take(root).ok()
    }

    fn cancel(&self) {
        let Some(root) = self.root.lock().expect("pending task poisoned").take() else {
            return;
        };
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(root);
        }
        tracing::trace!("Cancelled pending task {}", self.id);
    }
}

impl<V: Send + Sync> HeapUser for PendingTask<V> {
    fn prepare_for_global_gc(&self) {
        self.cancel();
    }
}

/// A continuation ready to run on the script thread.
#[derive(Debug)]
pub(crate) struct ReadyTask<V> {
    pub(crate) callback: String,
    pub(crate) args: Vec<V>,
}

struct TaskEntry<V> {
    task: Arc<PendingTask<V>>,
    user: UserKey,
    _charge: HeapChargeGuard,
}

/// Per-container receiving end of the task channel.
pub(crate) struct TaskMailbox<V> {
    tx: mpsc::UnboundedSender<TaskMessage<V>>,
    rx: RefCell<mpsc::UnboundedReceiver<TaskMessage<V>>>,
    pending: RefCell<HashMap<TaskId, TaskEntry<V>>>,
    next_id: Cell<TaskId>,
}

impl<V: HeapCost + Send + Sync + 'static> TaskMailbox<V> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: RefCell::new(rx),
            pending: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        }
    }

    pub(crate) fn poster(&self) -> TaskPoster<V> {
        TaskPoster {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Root `context`, charge it to `domain` and register a continuation
    /// for `callback`.
    pub(crate) fn register(
        &self,
        registry: &Arc<HeapValueRegistry<V>>,
        domain: &Rc<DomainStats>,
        callback: &str,
        context: V,
    ) -> TaskId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let charge = charge_to(domain, &context);
        let root = registry.store(context);
        let task = Arc::new(PendingTask {
            id,
            callback: callback.to_string(),
            root: Mutex::new(Some(root)),
            registry: Arc::downgrade(registry),
        });
        let user: Arc<dyn HeapUser> = task.clone();
        let user = registry.register_user(Some(domain.id()), &user);

        self.pending.borrow_mut().insert(
            id,
            TaskEntry {
                task,
                user,
                _charge: charge,
            },
        );
        tracing::trace!("Registered pending task {} -> {}", id, callback);
        id
    }

    /// Collect posted results whose continuations are still live.
    pub(crate) fn drain(&self, registry: &HeapValueRegistry<V>) -> Vec<ReadyTask<V>> {
        let mut ready = Vec::new();
        loop {
            let message = match self.rx.borrow_mut().try_recv() {
                Ok(message) => message,
                Err(_) => break,
            };

            let (id, extra) = match message {
                TaskMessage::Completed(id, args) => (id, Some(args)),
                TaskMessage::Abandoned(id) => (id, None),
            };

            let Some(entry) = self.pending.borrow_mut().remove(&id) else {
                tracing::trace!("Dropping result for unknown task {}", id);
                continue;
            };
            registry.unregister_user(entry.user);

            match extra {
                Some(args) => {
                    let Some(context) = entry.task.take_context() else {
                        tracing::trace!("Dropping result for cancelled task {}", id);
                        continue;
                    };
                    let mut all = Vec::with_capacity(args.len() + 1);
                    all.push(context);
                    all.extend(args);
                    ready.push(ReadyTask {
                        callback: entry.task.callback.clone(),
                        args: all,
                    });
                }
                None => entry.task.cancel(),
            }
        }
        ready
    }

    /// Forget every pending continuation, releasing their roots.
    pub(crate) fn cancel_all(&self, registry: &HeapValueRegistry<V>) {
        let entries: Vec<TaskEntry<V>> = self.pending.borrow_mut().drain().map(|(_, e)| e).collect();
        for entry in entries {
            registry.unregister_user(entry.user);
            entry.task.cancel();
        }
    }
}
