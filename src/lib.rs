//! Script hosting core for multi-panel applications.
//!
//! Many panels share one managed scripting runtime, each inside its own
//! execution domain. This crate provides:
//!
//! - [`HeapGovernor`]: adaptive scheduling of the shared runtime's garbage
//!   collector from per-domain heap statistics
//! - [`ScriptContainer`]: the per-panel lifecycle state machine and callback
//!   protocol
//! - [`HeapValueRegistry`]: a thread-safe, traced store that keeps managed
//!   values alive for native code
//!
//! The runtime itself is supplied by the host through [`ScriptEngine`].

pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod governor;
pub mod heap;
pub mod host;
pub mod runtime;
pub mod task;

// Core API
pub use config::{GovernorConfig, ResolvedGovernorConfig};
pub use container::{ContainerStatus, ScriptContainer};
pub use engine::{DomainId, RootTracer, ScriptEngine};
pub use error::{ContainerError, EngineError, RegistryError, ScriptError};
pub use governor::{
    Clock, CollectionLevel, GovernorCounters, GovernorState, HeapGovernor, MonotonicClock,
};
pub use heap::{
    DomainScope, DomainStats, HeapChargeGuard, HeapCost, HeapUser, HeapValueRegistry, RootId,
    charge_to,
};
pub use host::{PanelHost, format_failure};
pub use runtime::{ScriptRuntime, ScriptRuntimeBuilder};
pub use task::{PendingTask, TaskId, TaskMessage, TaskPoster};

// Re-export derive macro
pub use panel_heap_derive::HeapCost as DeriveHeapCost;
