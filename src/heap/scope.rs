//! DomainScope - RAII tracking of the domain script is currently running in.
//!
//! Native companion objects charge their memory to whichever domain is
//! entered on this thread. Charges made while no domain is entered are
//! parked and applied to the next domain that is entered.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::DomainStats;

thread_local! {
    /// Domain entered on this thread (if any).
    static CURRENT_DOMAIN: RefCell<Option<Rc<DomainStats>>> = const { RefCell::new(None) };

    /// Accumulated charges made outside any domain.
    static PENDING_CHARGE: Cell<i64> = const { Cell::new(0) };
}

/// RAII guard marking a domain as the current one for this thread.
///
/// On construction:
/// - Applies any parked charges to the entered domain
/// - Registers the domain for `try_current()`
///
/// On drop:
/// - Restores the previously entered domain (scopes nest)
///
/// # Example
///
/// ```ignore
/// let _scope = DomainScope::enter(&stats);
///
/// // Charged to `stats`
/// let guard = HeapChargeGuard::new(4096);
/// ```
pub struct DomainScope {
    previous: Option<Rc<DomainStats>>,
}

impl DomainScope {
    pub fn enter(stats: &Rc<DomainStats>) -> Self {
        let pending = PENDING_CHARGE.with(|p| p.replace(0));

        if pending != 0 {
            stats.apply_charge(pending);
            log::trace!(
                "Applied deferred heap charge to {}: {} bytes",
                stats.id(),
                pending
            );
        }

        let previous = CURRENT_DOMAIN.with(|c| c.replace(Some(Rc::clone(stats))));

        Self { previous }
    }

    /// The domain entered on this thread, if any.
    pub fn try_current() -> Option<Rc<DomainStats>> {
        CURRENT_DOMAIN.with(|c| c.borrow().clone())
    }
}

impl Drop for DomainScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_DOMAIN.with(|c| *c.borrow_mut() = previous);
    }
}

/// Park a charge until the next domain is entered.
pub(crate) fn defer_charge(delta: i64) {
    if delta != 0 {
        PENDING_CHARGE.with(|p| p.set(p.get() + delta));
        log::trace!("Deferred heap charge: {} bytes", delta);
    }
}

#[cfg(test)]
pub(crate) fn pending_charge() -> i64 {
    PENDING_CHARGE.with(|p| p.get())
}
