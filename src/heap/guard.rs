//! Heap charges for native memory held on behalf of script.

use std::rc::{Rc, Weak};

use super::DomainStats;
use super::scope::{DomainScope, defer_charge};

/// RAII guard that charges native memory to an execution domain.
///
/// When created, charges the amount to the entered domain (or parks it if no
/// domain is entered). When dropped, releases the amount from the same
/// domain. The domain is held weakly: once it has been reclaimed, releases
/// are dropped.
///
/// # Example
///
/// ```ignore
/// struct DecodedImage {
///     pixels: Vec<u8>,
///     _charge: HeapChargeGuard,
/// }
///
/// impl DecodedImage {
///     fn new(pixels: Vec<u8>) -> Self {
///         let charge = HeapChargeGuard::new(pixels.len() as i64);
///         Self { pixels, _charge: charge }
///     }
/// }
/// ```
pub struct HeapChargeGuard {
    amount: i64,
    domain: Option<Weak<DomainStats>>,
}

impl HeapChargeGuard {
    pub fn new(amount: i64) -> Self {
        let mut guard = Self::empty();
        guard.adjust(amount);
        guard
    }

    /// Charge `stats` directly, whatever domain is entered on this thread.
    pub fn attached_to(stats: &Rc<DomainStats>, amount: i64) -> Self {
        let mut guard = Self {
            amount: 0,
            domain: Some(Rc::downgrade(stats)),
        };
        guard.adjust(amount);
        guard
    }

    pub fn empty() -> Self {
        Self {
            amount: 0,
            domain: None,
        }
    }

    /// Adjust the charged amount by `delta` bytes.
    pub fn adjust(&mut self, delta: i64) {
        if delta != 0 {
            self.amount += delta;
            self.charge(delta);
        }
    }

    pub fn set(&mut self, new_amount: i64) {
        self.adjust(new_amount - self.amount);
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    /// True while the charged domain is still alive.
    pub fn is_attached(&self) -> bool {
        self.domain
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    fn charge(&mut self, delta: i64) {
        match &self.domain {
            Some(weak) => {
                if let Some(stats) = weak.upgrade() {
                    stats.apply_charge(delta);
                    log::trace!("Heap charge on {}: {} bytes", stats.id(), delta);
                }
            }
            None => match DomainScope::try_current() {
                Some(stats) => {
                    stats.apply_charge(delta);
                    log::trace!("Heap charge on {}: {} bytes", stats.id(), delta);
                    self.domain = Some(Rc::downgrade(&stats));
                }
                None => defer_charge(delta),
            },
        }
    }
}

impl Drop for HeapChargeGuard {
    fn drop(&mut self) {
        if self.amount != 0 {
            let amount = self.amount;
            self.charge(-amount);
        }
    }
}

impl Default for HeapChargeGuard {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for HeapChargeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapChargeGuard")
            .field("amount", &self.amount)
            .field("attached", &self.is_attached())
            .finish()
    }
}
