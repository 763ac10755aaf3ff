//! Byte cost of values native code keeps alive for a domain.

use std::rc::Rc;

use super::{DomainStats, HeapChargeGuard};

/// Bytes of native memory a value keeps alive beyond its own inline size.
///
/// Script values rooted in the registry on a domain's behalf (pending task
/// contexts, worker payloads) are charged to that domain by this amount.
/// Usually derived: `#[derive(DeriveHeapCost)]` sums every field not marked
/// `#[heap(skip)]`.
pub trait HeapCost {
    fn heap_cost(&self) -> usize;
}

macro_rules! inline_only {
    ($($ty:ty),* $(,)?) => {
        $(
            impl HeapCost for $ty {
                fn heap_cost(&self) -> usize {
                    0
                }
            }
        )*
    };
}

inline_only!(
    (), bool, char, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64
);

impl HeapCost for String {
    fn heap_cost(&self) -> usize {
        self.capacity()
    }
}

impl HeapCost for str {
    fn heap_cost(&self) -> usize {
        self.len()
    }
}

impl HeapCost for bytes::Bytes {
    fn heap_cost(&self) -> usize {
        self.len()
    }
}

impl<T: HeapCost> HeapCost for [T] {
    fn heap_cost(&self) -> usize {
        self.iter().map(HeapCost::heap_cost).sum()
    }
}

impl<T: HeapCost> HeapCost for Vec<T> {
    fn heap_cost(&self) -> usize {
        self.capacity() * size_of::<T>() + self.as_slice().heap_cost()
    }
}

impl<T: HeapCost> HeapCost for Option<T> {
    fn heap_cost(&self) -> usize {
        self.as_ref().map_or(0, HeapCost::heap_cost)
    }
}

impl<T: HeapCost + ?Sized> HeapCost for &T {
    fn heap_cost(&self) -> usize {
        (**self).heap_cost()
    }
}

/// Charge `stats` for `value` until the returned guard is dropped.
pub fn charge_to<T: HeapCost + ?Sized>(stats: &Rc<DomainStats>, value: &T) -> HeapChargeGuard {
    HeapChargeGuard::attached_to(stats, value.heap_cost() as i64)
}
