//! Capability set consumed from the embedded managed runtime.
//!
//! The runtime is an external collaborator: it owns the real heap, compiles
//! and runs script, and performs collections. Everything in this crate talks
//! to it through [`ScriptEngine`], and only from the single script thread.
//!
//! Methods take `&self` because script can re-enter the host (and therefore
//! the engine) from inside any call; implementations keep their own interior
//! mutability and must not hold borrows across calls back into the host.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ScriptError;
use crate::heap::{DomainStats, HeapCost};

/// Identifier of one execution domain (realm) inside the shared runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub(crate) u64);

impl DomainId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain#{}", self.0)
    }
}

/// Participates in the runtime's marking pass so that visited values are
/// treated as roots.
///
/// Registered with [`ScriptEngine::register_trace_root`]; may be invoked from
/// whatever thread the collector marks on.
pub trait RootTracer<V>: Send + Sync {
    fn trace(&self, visit: &mut dyn FnMut(&V));
}

/// The managed runtime as seen by the governor and the containers.
pub trait ScriptEngine: 'static {
    /// A managed value that native code may hold on to through the registry.
    ///
    /// Values rooted on a domain's behalf are charged to it by their
    /// [`HeapCost`].
    type Value: Clone + Send + Sync + fmt::Debug + HeapCost + 'static;

    // ---------------------------------------------------------------------
    // Execution domains
    // ---------------------------------------------------------------------

    /// Create a domain with its global object and fixed built-ins.
    ///
    /// `stats` is owned by the domain; the engine charges script allocations
    /// to it with [`DomainStats::record_allocation`] and friends.
    fn create_domain(&self, id: DomainId, stats: &Rc<DomainStats>) -> Result<(), ScriptError>;

    /// Tear down a domain. Must tolerate partially created domains.
    fn destroy_domain(&self, id: DomainId);

    // ---------------------------------------------------------------------
    // Script execution
    // ---------------------------------------------------------------------

    /// Compile and run top-level source text inside a domain.
    fn evaluate(&self, domain: DomainId, source: &str) -> Result<(), ScriptError>;

    /// Call a global function of the domain by name.
    ///
    /// Returns `Ok(None)` if the function is not defined or returned nothing.
    fn call_function(
        &self,
        domain: DomainId,
        name: &str,
        args: &[Self::Value],
    ) -> Result<Option<Self::Value>, ScriptError>;

    /// Drain the job queue (promise reactions) of a domain.
    fn run_pending_jobs(&self, domain: DomainId) -> Result<(), ScriptError>;

    // ---------------------------------------------------------------------
    // Collection primitives
    // ---------------------------------------------------------------------

    /// Bytes allocated by the runtime outside of any domain's accounting.
    fn global_heap_bytes(&self) -> u64;

    /// Include one domain in the next collection cycle.
    fn prepare_domain_for_collection(&self, domain: DomainId);

    /// Include every domain in the next collection cycle.
    fn prepare_full_collection(&self);

    fn begin_incremental_collection(&self, slice_budget: Duration);

    fn continue_incremental_slice(&self, slice_budget: Duration);

    fn is_incremental_collection_in_progress(&self) -> bool;

    /// Run the remainder of the current incremental cycle synchronously.
    fn finish_incremental_collection(&self);

    /// Switch between incremental and global (non-incremental) collection mode.
    fn set_incremental_mode(&self, enabled: bool);

    /// Run one synchronous collection over the prepared domains.
    fn run_full_collection(&self, shrinking: bool);

    // ---------------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------------

    fn register_trace_root(&self, tracer: Arc<dyn RootTracer<Self::Value>>);

    fn unregister_trace_root(&self);
}
