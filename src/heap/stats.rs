//! Per-domain allocation accounting.

use std::cell::Cell;

use crate::engine::DomainId;

/// Live allocation counters of one execution domain.
///
/// Owned by the domain (shared with the engine through `Rc`) and read by the
/// governor on the script thread. The `last_*` values are the snapshot taken
/// when the domain's most recent collection completed.
#[derive(Debug)]
pub struct DomainStats {
    id: DomainId,
    current_heap_bytes: Cell<u64>,
    current_alloc_count: Cell<u64>,
    last_heap_bytes: Cell<u64>,
    last_alloc_count: Cell<u64>,
    marked_for_collection: Cell<bool>,
    marked_for_deletion: Cell<bool>,
    collections_completed: Cell<u64>,
    reclaimable: Cell<bool>,
}

/// Copy of a domain's counters, for logging and inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainStatsSnapshot {
    pub id: DomainId,
    pub current_heap_bytes: u64,
    pub current_alloc_count: u64,
    pub last_heap_bytes: u64,
    pub last_alloc_count: u64,
    pub marked_for_collection: bool,
    pub marked_for_deletion: bool,
}

impl DomainStats {
    pub fn new(id: DomainId) -> Self {
        Self {
            id,
            current_heap_bytes: Cell::new(0),
            current_alloc_count: Cell::new(0),
            last_heap_bytes: Cell::new(0),
            last_alloc_count: Cell::new(0),
            marked_for_collection: Cell::new(false),
            marked_for_deletion: Cell::new(false),
            collections_completed: Cell::new(0),
            reclaimable: Cell::new(false),
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn current_heap_bytes(&self) -> u64 {
        self.current_heap_bytes.get()
    }

    pub fn current_alloc_count(&self) -> u64 {
        self.current_alloc_count.get()
    }

    pub fn last_heap_bytes(&self) -> u64 {
        self.last_heap_bytes.get()
    }

    pub fn last_alloc_count(&self) -> u64 {
        self.last_alloc_count.get()
    }

    pub fn is_marked_for_collection(&self) -> bool {
        self.marked_for_collection.get()
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.get()
    }

    /// Number of collection cycles this domain took part in.
    pub fn collections_completed(&self) -> u64 {
        self.collections_completed.get()
    }

    /// Record one allocation of `bytes`.
    pub fn record_allocation(&self, bytes: u64) {
        self.current_heap_bytes
            .set(self.current_heap_bytes.get().saturating_add(bytes));
        self.current_alloc_count
            .set(self.current_alloc_count.get().saturating_add(1));
    }

    /// Record that `bytes` were released.
    pub fn record_release(&self, bytes: u64) {
        self.current_heap_bytes
            .set(self.current_heap_bytes.get().saturating_sub(bytes));
    }

    /// Apply a signed charge from a native companion object.
    pub(crate) fn apply_charge(&self, delta: i64) {
        if delta > 0 {
            self.record_allocation(delta.unsigned_abs());
        } else if delta < 0 {
            self.record_release(delta.unsigned_abs());
        }
    }

    /// The owning container is gone; reclaim after the next completed cycle.
    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.set(true);
    }

    pub(crate) fn mark_for_collection(&self) {
        self.marked_for_collection.set(true);
    }

    /// Snapshot the counters at the end of a collection cycle.
    pub(crate) fn on_collection_done(&self) {
        self.last_heap_bytes.set(self.current_heap_bytes.get());
        self.last_alloc_count.set(self.current_alloc_count.get());
        self.marked_for_collection.set(false);
        self.collections_completed
            .set(self.collections_completed.get() + 1);
        if self.marked_for_deletion.get() {
            self.reclaimable.set(true);
        }
    }

    /// Marked for deletion and swept by a completed cycle since.
    pub(crate) fn is_reclaimable(&self) -> bool {
        self.reclaimable.get()
    }

    pub fn snapshot(&self) -> DomainStatsSnapshot {
        DomainStatsSnapshot {
            id: self.id,
            current_heap_bytes: self.current_heap_bytes(),
            current_alloc_count: self.current_alloc_count(),
            last_heap_bytes: self.last_heap_bytes(),
            last_alloc_count: self.last_alloc_count(),
            marked_for_collection: self.is_marked_for_collection(),
            marked_for_deletion: self.is_marked_for_deletion(),
        }
    }
}
