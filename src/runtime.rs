//! The long-lived service object shared by every container.
//!
//! A [`ScriptRuntime`] owns the engine, the heap governor, the table of live
//! execution domains and the heap value registry. It is created once at host
//! start, handed to every container as an `Rc`, and torn down with an explicit
//! [`ScriptRuntime::shutdown`].
//!
//! The engine is started lazily by the first container registration. A start
//! failure is remembered: every later registration fails the same way.
//!
//! # Example
//!
//! ```ignore
//! let runtime = ScriptRuntimeBuilder::new()
//!     .config(GovernorConfig::from_env())
//!     .build(|| MyEngine::new());
//!
//! let panel = ScriptContainer::new(runtime.clone(), host);
//! panel.initialize();
//! panel.execute_script(source);
//!
//! // Host polling loop, between script turns
//! if !runtime.maybe_collect() {
//!     tracing::warn!("script heap exhausted");
//! }
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::{GovernorConfig, ResolvedGovernorConfig};
use crate::engine::{DomainId, ScriptEngine};
use crate::error::{ContainerError, EngineError};
use crate::governor::{Clock, HeapGovernor, MonotonicClock};
use crate::heap::{DomainStats, HeapValueRegistry};

type EngineFactory<E> = Box<dyn FnOnce() -> Result<E, EngineError>>;

enum EngineSlot<E> {
    NotStarted(EngineFactory<E>),
    Starting,
    Running(Rc<E>),
    Failed(EngineError),
    ShutDown,
}

/// Builder for a [`ScriptRuntime`].
pub struct ScriptRuntimeBuilder {
    config: Option<ResolvedGovernorConfig>,
    clock: Option<Rc<dyn Clock>>,
}

impl ScriptRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            clock: None,
        }
    }

    /// Governor settings; unset fields are auto-detected.
    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = Some(config.resolve());
        self
    }

    pub fn resolved_config(mut self, config: ResolvedGovernorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Time source for the governor (default: [`MonotonicClock`]).
    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the runtime. `factory` runs on the first container registration.
    pub fn build<E, F>(self, factory: F) -> Rc<ScriptRuntime<E>>
    where
        E: ScriptEngine,
        F: FnOnce() -> Result<E, EngineError> + 'static,
    {
        let config = self
            .config
            .unwrap_or_else(|| GovernorConfig::default().resolve());
        let clock = self
            .clock
            .unwrap_or_else(|| Rc::new(MonotonicClock::new()));

        tracing::info!(
            "Script runtime configured: max heap {} bytes, growth trigger {} bytes",
            config.max_heap_bytes,
            config.heap_growth_trigger
        );

        Rc::new(ScriptRuntime {
            engine: RefCell::new(EngineSlot::NotStarted(Box::new(factory))),
            governor: HeapGovernor::new(config, clock),
            domains: RefCell::new(Vec::new()),
            registry: Arc::new(HeapValueRegistry::new()),
            next_domain: Cell::new(1),
            containers: Cell::new(0),
        })
    }
}

impl Default for ScriptRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ScriptRuntime<E: ScriptEngine> {
    engine: RefCell<EngineSlot<E>>,
    governor: HeapGovernor,
    domains: RefCell<Vec<Rc<DomainStats>>>,
    registry: Arc<HeapValueRegistry<E::Value>>,
    next_domain: Cell<u64>,
    containers: Cell<usize>,
}

impl<E: ScriptEngine> ScriptRuntime<E> {
    pub fn governor(&self) -> &HeapGovernor {
        &self.governor
    }

    pub fn registry(&self) -> &Arc<HeapValueRegistry<E::Value>> {
        &self.registry
    }

    /// The running engine, if it has been started successfully.
    pub fn engine(&self) -> Option<Rc<E>> {
        match &*self.engine.borrow() {
            EngineSlot::Running(engine) => Some(Rc::clone(engine)),
            _ => None,
        }
    }

    /// Containers currently registered.
    pub fn container_count(&self) -> usize {
        self.containers.get()
    }

    /// Live execution domains, including those awaiting reclamation.
    pub fn domain_count(&self) -> usize {
        self.domains.borrow().len()
    }

    /// Baseline total heap bytes the governor compares growth against.
    ///
    /// Refreshed after every collection, and lowered by any check that
    /// observes a smaller heap.
    pub fn total_heap_usage(&self) -> u64 {
        self.governor.state().last_total_heap_bytes
    }

    pub fn max_heap(&self) -> u64 {
        self.governor.config().max_heap_bytes
    }

    /// Register a container, starting the engine if needed.
    pub fn register_container(&self) -> Result<(), EngineError> {
        self.start_engine()?;
        self.containers.set(self.containers.get() + 1);
        Ok(())
    }

    pub fn unregister_container(&self) {
        self.containers.set(self.containers.get().saturating_sub(1));
    }

    fn start_engine(&self) -> Result<Rc<E>, EngineError> {
        let slot = std::mem::replace(&mut *self.engine.borrow_mut(), EngineSlot::Starting);
        let (slot, result) = match slot {
            EngineSlot::NotStarted(factory) => match factory() {
                Ok(engine) => {
                    let engine = Rc::new(engine);
                    self.registry.attach(&*engine);
                    tracing::info!("Script engine started");
                    (EngineSlot::Running(Rc::clone(&engine)), Ok(engine))
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    (EngineSlot::Failed(e.clone()), Err(e))
                }
            },
            EngineSlot::Running(engine) => {
                let result = Ok(Rc::clone(&engine));
                (EngineSlot::Running(engine), result)
            }
            EngineSlot::Failed(e) => (EngineSlot::Failed(e.clone()), Err(e)),
            EngineSlot::ShutDown => (
                EngineSlot::ShutDown,
                Err(EngineError::new("runtime has been shut down")),
            ),
            EngineSlot::Starting => (
                EngineSlot::Starting,
                Err(EngineError::new("engine start re-entered")),
            ),
        };
        *self.engine.borrow_mut() = slot;
        result
    }

    /// Create a fresh execution domain.
    ///
    /// A domain the engine failed to finish creating is torn down again.
    pub fn create_domain(&self) -> Result<Rc<DomainStats>, ContainerError> {
        let engine = self.start_engine()?;

        let id = DomainId(self.next_domain.get());
        self.next_domain.set(id.0 + 1);

        let stats = Rc::new(DomainStats::new(id));
        if let Err(e) = engine.create_domain(id, &stats) {
            engine.destroy_domain(id);
            return Err(e.into());
        }

        self.domains.borrow_mut().push(Rc::clone(&stats));
        tracing::debug!("Created {}", id);
        Ok(stats)
    }

    /// Release a container's domain: its heap users let go of their roots and
    /// the domain is reclaimed after the next completed collection.
    pub fn release_domain(&self, stats: &DomainStats) {
        let id = stats.id();
        self.registry.prepare_for_global_gc(Some(id));
        stats.mark_for_deletion();
        tracing::debug!("Marked {} for deletion", id);
    }

    pub fn on_turn_begin(&self, domain: DomainId) {
        self.governor.on_turn_begin(domain);
    }

    pub fn on_turn_end(&self, domain: DomainId) {
        self.governor.on_turn_end(domain);
    }

    /// Poll the governor. `false` means the heap is over its limit.
    pub fn maybe_collect(&self) -> bool {
        let Some(engine) = self.engine() else {
            return true;
        };
        let domains = self.domains.borrow().clone();
        let within_limit = self.governor.maybe_collect(&*engine, &domains);
        self.reclaim_domains(&engine);
        within_limit
    }

    /// Ask for at least an incremental collection.
    pub fn trigger_collection(&self) -> bool {
        let Some(engine) = self.engine() else {
            return true;
        };
        let domains = self.domains.borrow().clone();
        let within_limit = self.governor.trigger_manual_collection(&*engine, &domains);
        self.reclaim_domains(&engine);
        within_limit
    }

    fn reclaim_domains(&self, engine: &E) {
        let reclaimed: Vec<Rc<DomainStats>> = {
            let mut domains = self.domains.borrow_mut();
            let (gone, live): (Vec<_>, Vec<_>) =
                domains.drain(..).partition(|stats| stats.is_reclaimable());
            *domains = live;
            gone
        };

        for stats in reclaimed {
            engine.destroy_domain(stats.id());
            tracing::debug!("Reclaimed {}", stats.id());
        }
    }

    /// Final collection and engine teardown.
    ///
    /// Registered containers should be finalized first; later registrations
    /// fail with [`EngineError`].
    pub fn shutdown(&self) {
        let slot = std::mem::replace(&mut *self.engine.borrow_mut(), EngineSlot::ShutDown);
        let EngineSlot::Running(engine) = slot else {
            return;
        };

        self.registry.prepare_for_global_gc(None);
        let domains = self.domains.borrow().clone();
        self.governor.on_runtime_shutdown(&*engine, &domains);

        for stats in self.domains.borrow_mut().drain(..) {
            engine.destroy_domain(stats.id());
        }
        self.registry.detach(&*engine);
        tracing::info!("Script runtime shut down");
    }
}

impl<E: ScriptEngine> fmt::Debug for ScriptRuntime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine = match &*self.engine.borrow() {
            EngineSlot::NotStarted(_) => "not started",
            EngineSlot::Starting => "starting",
            EngineSlot::Running(_) => "running",
            EngineSlot::Failed(_) => "failed",
            EngineSlot::ShutDown => "shut down",
        };
        f.debug_struct("ScriptRuntime")
            .field("engine", &engine)
            .field("containers", &self.containers.get())
            .field("domains", &self.domain_count())
            .field("governor", &self.governor)
            .field("registry", &self.registry)
            .finish()
    }
}
