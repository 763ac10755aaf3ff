//! Script Container: the per-panel lifecycle state machine.
//!
//! ```text
//! Uninitialized ──register ok──► Ready ──initialize()──► Working
//!       │                         ▲ ◄────finalize()────────┘ │
//!       │ register failed         │                          │ fail(msg)
//!       ▼                         └──initialize()── Failed ◄─┘
//! EngineFailed (terminal)
//! ```
//!
//! Containers are shared as `Rc<ScriptContainer<E>>`: callbacks take a strong
//! reference for their whole duration so that a callback which tears the
//! panel down cannot free the container under its own feet.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::engine::{DomainId, ScriptEngine};
use crate::error::{ContainerError, ScriptError};
use crate::heap::{DomainScope, DomainStats};
use crate::host::{PanelHost, format_failure};
use crate::runtime::ScriptRuntime;
use crate::task::{TaskId, TaskMailbox, TaskPoster};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerStatus {
    Uninitialized,
    Ready,
    Working,
    Failed,
    EngineFailed,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Failed => "failed",
            Self::EngineFailed => "engine failed",
        };
        f.write_str(name)
    }
}

pub struct ScriptContainer<E: ScriptEngine> {
    runtime: Rc<ScriptRuntime<E>>,
    host: Rc<dyn PanelHost>,
    status: Cell<ContainerStatus>,
    domain: RefCell<Option<Rc<DomainStats>>>,
    is_parsing_script: Cell<bool>,
    nested_depth: Cell<u32>,
    registered: Cell<bool>,
    last_error: RefCell<Option<String>>,
    tasks: TaskMailbox<E::Value>,
}

impl<E: ScriptEngine> ScriptContainer<E> {
    /// Create a container and register it with the runtime.
    ///
    /// If the engine cannot be started the container is `EngineFailed` from
    /// the start and the failure is reported to the host once.
    pub fn new(runtime: Rc<ScriptRuntime<E>>, host: Rc<dyn PanelHost>) -> Rc<Self> {
        let container = Rc::new(Self {
            runtime,
            host,
            status: Cell::new(ContainerStatus::Uninitialized),
            domain: RefCell::new(None),
            is_parsing_script: Cell::new(false),
            nested_depth: Cell::new(0),
            registered: Cell::new(false),
            last_error: RefCell::new(None),
            tasks: TaskMailbox::new(),
        });

        match container.runtime.register_container() {
            Ok(()) => {
                container.registered.set(true);
                container.set_status(ContainerStatus::Ready);
            }
            Err(e) => {
                container.set_status(ContainerStatus::EngineFailed);
                container.report(&e.to_string());
            }
        }

        container
    }

    pub fn status(&self) -> ContainerStatus {
        self.status.get()
    }

    /// The formatted message of the last failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn domain_id(&self) -> Option<DomainId> {
        self.domain.borrow().as_ref().map(|stats| stats.id())
    }

    /// Current heap bytes of this container's domain.
    pub fn heap_usage(&self) -> u64 {
        self.domain
            .borrow()
            .as_ref()
            .map_or(0, |stats| stats.current_heap_bytes())
    }

    /// Depth of nested callback invocations in progress.
    pub fn nested_depth(&self) -> u32 {
        self.nested_depth.get()
    }

    pub fn is_ready_for_callback(&self) -> bool {
        self.status.get() == ContainerStatus::Working && !self.is_parsing_script.get()
    }

    /// Create the execution domain. No-op if already `Working`.
    pub fn initialize(&self) -> bool {
        match self.status.get() {
            ContainerStatus::Working => return true,
            ContainerStatus::EngineFailed | ContainerStatus::Uninitialized => return false,
            ContainerStatus::Failed => {
                self.last_error.borrow_mut().take();
                self.set_status(ContainerStatus::Ready);
            }
            ContainerStatus::Ready => {}
        }

        match self.runtime.create_domain() {
            Ok(stats) => {
                *self.domain.borrow_mut() = Some(stats);
                self.set_status(ContainerStatus::Working);
                true
            }
            Err(e) => {
                self.fail(&e.to_string());
                false
            }
        }
    }

    /// Tear down the domain and everything native that belongs to it.
    ///
    /// `Failed` and `EngineFailed` are kept; `Working` goes back to `Ready`.
    pub fn finalize(&self) {
        match self.status.get() {
            ContainerStatus::Ready | ContainerStatus::Uninitialized => return,
            ContainerStatus::Working => self.set_status(ContainerStatus::Ready),
            ContainerStatus::Failed | ContainerStatus::EngineFailed => {}
        }

        let Some(stats) = self.domain.borrow_mut().take() else {
            return;
        };

        self.tasks.cancel_all(self.runtime.registry());
        self.host.unbind_timers();
        self.runtime.release_domain(&stats);
        drop(stats);

        self.runtime.trigger_collection();
    }

    /// Finalize, then report `message` to the host.
    ///
    /// The message is surfaced once per transition into `Failed`.
    pub fn fail(&self, message: &str) {
        let previous = self.status.get();
        self.finalize();

        if previous == ContainerStatus::EngineFailed {
            return;
        }
        self.set_status(ContainerStatus::Failed);
        if previous != ContainerStatus::Failed {
            self.report(message);
        }
    }

    fn report(&self, message: &str) {
        let text = format_failure(&self.host.build_info(), message);
        tracing::error!("{}", text);
        self.host.report_failure(&text);
        *self.last_error.borrow_mut() = Some(text);
    }

    fn set_status(&self, status: ContainerStatus) {
        let previous = self.status.replace(status);
        if previous != status {
            tracing::debug!("Container {} -> {}", previous, status);
        }
    }

    /// Compile and run top-level script source.
    pub fn execute_script(&self, source: &str) -> bool {
        let result = self.run_top_level(source);
        match result {
            Ok(()) => true,
            Err(ContainerError::InvalidState { status }) => {
                tracing::warn!("execute_script ignored while {}", status);
                false
            }
            Err(e) => {
                self.fail(&e.to_string());
                false
            }
        }
    }

    fn run_top_level(&self, source: &str) -> Result<(), ContainerError> {
        let (engine, stats) = self.working_domain()?;

        let _parsing = ParseGuard::enter(&self.is_parsing_script);
        let _turn = TurnGuard::enter(self, stats.id());
        let _scope = DomainScope::enter(&stats);
        engine.evaluate(stats.id(), source)?;
        Ok(())
    }

    /// Call a global script function by name.
    ///
    /// Returns the function's result on success. Script errors fail the
    /// container and yield `None`, as does calling while not ready.
    pub fn invoke_callback(self: &Rc<Self>, name: &str, args: &[E::Value]) -> Option<E::Value> {
        if !self.is_ready_for_callback() {
            return None;
        }

        let this = Rc::clone(self);
        match this.call(name, args) {
            Ok(value) => value,
            Err(ContainerError::InvalidState { .. }) => None,
            Err(e) => {
                this.fail(&e.to_string());
                None
            }
        }
    }

    fn call(&self, name: &str, args: &[E::Value]) -> Result<Option<E::Value>, ContainerError> {
        let (engine, stats) = self.working_domain()?;

        let _turn = TurnGuard::enter(self, stats.id());
        let _scope = DomainScope::enter(&stats);
        Ok(engine.call_function(stats.id(), name, args)?)
    }

    /// Run posted task continuations, then the engine's job queue.
    pub fn run_pending_jobs(self: &Rc<Self>) {
        if !self.is_ready_for_callback() {
            return;
        }

        let this = Rc::clone(self);
        for task in this.tasks.drain(this.runtime.registry()) {
            if !this.is_ready_for_callback() {
                break;
            }
            this.invoke_callback(&task.callback, &task.args);
        }

        if !this.is_ready_for_callback() {
            return;
        }
        if let Err(e) = this.drain_jobs() {
            this.fail(&e.to_string());
        }
    }

    fn drain_jobs(&self) -> Result<(), ContainerError> {
        let (engine, stats) = self.working_domain()?;

        let _turn = TurnGuard::enter(self, stats.id());
        let _scope = DomainScope::enter(&stats);
        engine.run_pending_jobs(stats.id())?;
        Ok(())
    }

    /// Handle for background workers to post task results.
    pub fn task_poster(&self) -> TaskPoster<E::Value> {
        self.tasks.poster()
    }

    /// Register a continuation: `callback` will be invoked with `context`
    /// followed by the values a worker posts for the returned id.
    ///
    /// The context counts toward this container's heap usage until the
    /// continuation runs or is cancelled.
    pub fn spawn_task(&self, callback: &str, context: E::Value) -> Option<TaskId> {
        let stats = self.domain.borrow().clone()?;
        if self.status.get() != ContainerStatus::Working {
            return None;
        }
        Some(
            self.tasks
                .register(self.runtime.registry(), &stats, callback, context),
        )
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks.pending_count()
    }

    fn working_domain(&self) -> Result<(Rc<E>, Rc<DomainStats>), ContainerError> {
        let status = self.status.get();
        if status != ContainerStatus::Working {
            return Err(ContainerError::InvalidState { status });
        }
        let stats = self
            .domain
            .borrow()
            .clone()
            .ok_or(ContainerError::InvalidState { status })?;
        let engine = self
            .runtime
            .engine()
            .ok_or_else(|| ScriptError::Internal("engine is not running".to_string()))?;
        Ok((engine, stats))
    }
}

impl<E: ScriptEngine> Drop for ScriptContainer<E> {
    fn drop(&mut self) {
        self.finalize();
        if self.registered.replace(false) {
            self.runtime.unregister_container();
        }
    }
}

impl<E: ScriptEngine> fmt::Debug for ScriptContainer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContainer")
            .field("status", &self.status.get())
            .field("domain", &self.domain_id())
            .field("nested_depth", &self.nested_depth.get())
            .field("pending_tasks", &self.tasks.pending_count())
            .finish()
    }
}

/// Counts nested script calls; the outermost one brackets a script turn.
struct TurnGuard<'a, E: ScriptEngine> {
    container: &'a ScriptContainer<E>,
    domain: DomainId,
}

impl<'a, E: ScriptEngine> TurnGuard<'a, E> {
    fn enter(container: &'a ScriptContainer<E>, domain: DomainId) -> Self {
        let depth = container.nested_depth.get();
        if depth == 0 {
            container.runtime.on_turn_begin(domain);
        }
        container.nested_depth.set(depth + 1);
        Self { container, domain }
    }
}

impl<E: ScriptEngine> Drop for TurnGuard<'_, E> {
    fn drop(&mut self) {
        let depth = self.container.nested_depth.get().saturating_sub(1);
        self.container.nested_depth.set(depth);
        if depth == 0 {
            self.container.runtime.on_turn_end(self.domain);
        }
    }
}

/// Sets the parse flag for the duration of top-level execution.
struct ParseGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> ParseGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(true);
        Self { flag, previous }
    }
}

impl Drop for ParseGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}
