//! Heap accounting shared between the governor, the containers and native
//! code running on behalf of script.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  DomainStats (per execution domain)                         │
//! │  ├── current / last heap bytes and allocation counts        │
//! │  └── marked for collection / deletion                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  DomainScope (RAII)                                         │
//! │  ├── Thread-local "current domain" while script runs        │
//! │  └── Applies charges parked while no domain was entered     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HeapChargeGuard (RAII) / HeapCost                          │
//! │  ├── Charges native memory to the current domain            │
//! │  └── Releases it on drop, unless the domain is gone         │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HeapValueRegistry (Arc, any thread)                        │
//! │  ├── RootId → value, traced as a root by the engine         │
//! │  └── HeapUsers released before teardown collections         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod cost;
mod guard;
mod registry;
mod scope;
mod stats;

pub use cost::{HeapCost, charge_to};
pub use guard::HeapChargeGuard;
pub use registry::{HeapUser, HeapValueRegistry, RootId, UserKey};
pub use scope::DomainScope;
pub use stats::{DomainStats, DomainStatsSnapshot};
