//! Shared fixtures: a scripted in-memory engine, a recording host and a
//! manual clock.
//!
//! The fake engine understands a tiny line language:
//!
//! ```text
//! fn <name> = <int | "text" | undefined>   define a function returning a value
//! fn <name> throws <message...>            define a function that throws
//! fn <name> calls <hook>                   define a function that runs a native hook
//! fn <name> allocs <bytes>                 define a function that allocates
//! alloc <bytes>                            allocate at top level
//! call <hook>                              run a native hook at top level
//! throw <message...>                       throw at top level
//! ```
//!
//! Anything else is a compile error.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use panel_script_runtime::{
    Clock, DeriveHeapCost, DomainId, DomainStats, EngineError, GovernorConfig, PanelHost,
    RootTracer, ScriptEngine, ScriptError, ScriptRuntime, ScriptRuntimeBuilder,
};
use tokio::task::LocalSet;

/// Runs an async function inside a LocalSet.
pub async fn run_in_local<F, Fut, T>(f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let local = LocalSet::new();
    local.run_until(f()).await
}

#[derive(Debug, Clone, PartialEq, DeriveHeapCost)]
pub enum Value {
    Undefined,
    Int(i64),
    Text(String),
    Bytes(Bytes),
}

/// Collection primitives the engine was asked to run, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcCall {
    PrepareDomain(DomainId),
    PrepareFull,
    BeginIncremental(Duration),
    ContinueSlice(Duration),
    Finish,
    IncrementalMode(bool),
    Full { shrinking: bool },
}

pub type Hook = Rc<dyn Fn(&[Value]) -> Option<Value>>;

#[derive(Clone)]
enum Body {
    Return(Value),
    Throw(String),
    Hook(String),
    Alloc(u64),
}

struct FakeDomain {
    stats: Rc<DomainStats>,
    functions: HashMap<String, Body>,
}

#[derive(Default)]
pub struct FakeEngine {
    domains: RefCell<HashMap<DomainId, FakeDomain>>,
    destroyed: RefCell<Vec<DomainId>>,
    hooks: RefCell<HashMap<String, Hook>>,
    global_heap: Cell<u64>,
    stat_reads: Cell<u64>,
    incremental: Cell<bool>,
    slices_left: Cell<u32>,
    slices_per_cycle: Cell<u32>,
    reclaim_on_collect: Cell<bool>,
    fail_domain_creation: Cell<bool>,
    jobs_run: Cell<u32>,
    gc_log: RefCell<Vec<GcCall>>,
    tracer: RefCell<Option<Arc<dyn RootTracer<Value>>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&self, name: &str, hook: impl Fn(&[Value]) -> Option<Value> + 'static) {
        self.hooks
            .borrow_mut()
            .insert(name.to_string(), Rc::new(hook));
    }

    pub fn set_global_heap(&self, bytes: u64) {
        self.global_heap.set(bytes);
    }

    /// Incremental cycles need this many slices (begin included) to finish.
    pub fn set_slices_per_cycle(&self, slices: u32) {
        self.slices_per_cycle.set(slices);
    }

    /// Completed collections free every domain's bytes.
    pub fn set_reclaim_on_collect(&self, reclaim: bool) {
        self.reclaim_on_collect.set(reclaim);
    }

    pub fn set_fail_domain_creation(&self, fail: bool) {
        self.fail_domain_creation.set(fail);
    }

    pub fn stat_reads(&self) -> u64 {
        self.stat_reads.get()
    }

    pub fn jobs_run(&self) -> u32 {
        self.jobs_run.get()
    }

    pub fn gc_log(&self) -> Vec<GcCall> {
        self.gc_log.borrow().clone()
    }

    pub fn clear_gc_log(&self) {
        self.gc_log.borrow_mut().clear();
    }

    pub fn live_domains(&self) -> usize {
        self.domains.borrow().len()
    }

    pub fn destroyed_domains(&self) -> Vec<DomainId> {
        self.destroyed.borrow().clone()
    }

    pub fn has_trace_root(&self) -> bool {
        self.tracer.borrow().is_some()
    }

    /// Values the collector would treat as roots right now.
    pub fn trace_roots(&self) -> Vec<Value> {
        let tracer = self.tracer.borrow().clone();
        let mut roots = Vec::new();
        if let Some(tracer) = tracer {
            tracer.trace(&mut |v| roots.push(v.clone()));
        }
        roots
    }

    fn log(&self, call: GcCall) {
        self.gc_log.borrow_mut().push(call);
    }

    fn stats_of(&self, domain: DomainId) -> Result<Rc<DomainStats>, ScriptError> {
        self.domains
            .borrow()
            .get(&domain)
            .map(|d| Rc::clone(&d.stats))
            .ok_or_else(|| ScriptError::Internal(format!("unknown {}", domain)))
    }

    fn run_hook(&self, name: &str, args: &[Value]) -> Result<Option<Value>, ScriptError> {
        let hook = self
            .hooks
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::Runtime(format!("{} is not defined", name)))?;
        Ok(hook(args))
    }

    fn collect(&self) {
        if !self.reclaim_on_collect.get() {
            return;
        }
        let domains: Vec<Rc<DomainStats>> = self
            .domains
            .borrow()
            .values()
            .map(|d| Rc::clone(&d.stats))
            .collect();
        for stats in domains {
            stats.record_release(stats.current_heap_bytes());
        }
        self.global_heap.set(0);
    }
}

fn parse_value(token: &str) -> Result<Value, ScriptError> {
    if token == "undefined" {
        return Ok(Value::Undefined);
    }
    if let Some(text) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Ok(Value::Text(text.to_string()));
    }
    token
        .parse::<i64>()
        .map(Value::Int)
        .map_err(|_| ScriptError::Compile(format!("bad literal `{}`", token)))
}

fn parse_bytes(token: &str) -> Result<u64, ScriptError> {
    token
        .parse::<u64>()
        .map_err(|_| ScriptError::Compile(format!("bad size `{}`", token)))
}

impl ScriptEngine for FakeEngine {
    type Value = Value;

    fn create_domain(&self, id: DomainId, stats: &Rc<DomainStats>) -> Result<(), ScriptError> {
        if self.fail_domain_creation.get() {
            return Err(ScriptError::Internal("global object creation failed".into()));
        }
        self.domains.borrow_mut().insert(
            id,
            FakeDomain {
                stats: Rc::clone(stats),
                functions: HashMap::new(),
            },
        );
        Ok(())
    }

    fn destroy_domain(&self, id: DomainId) {
        self.domains.borrow_mut().remove(&id);
        self.destroyed.borrow_mut().push(id);
    }

    fn evaluate(&self, domain: DomainId, source: &str) -> Result<(), ScriptError> {
        let stats = self.stats_of(domain)?;

        for line in source.lines().map(str::trim) {
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let definition = match tokens.as_slice() {
                ["fn", name, "=", value] => Some((name.to_string(), Body::Return(parse_value(value)?))),
                ["fn", name, "throws", message @ ..] => {
                    Some((name.to_string(), Body::Throw(message.join(" "))))
                }
                ["fn", name, "calls", hook] => Some((name.to_string(), Body::Hook(hook.to_string()))),
                ["fn", name, "allocs", bytes] => {
                    Some((name.to_string(), Body::Alloc(parse_bytes(bytes)?)))
                }
                ["alloc", bytes] => {
                    stats.record_allocation(parse_bytes(bytes)?);
                    None
                }
                ["call", hook] => {
                    self.run_hook(hook, &[])?;
                    None
                }
                ["throw", message @ ..] => return Err(ScriptError::Runtime(message.join(" "))),
                _ => return Err(ScriptError::Compile(format!("unexpected token in `{}`", line))),
            };

            if let Some((name, body)) = definition {
                if let Some(d) = self.domains.borrow_mut().get_mut(&domain) {
                    d.functions.insert(name, body);
                }
            }
        }
        Ok(())
    }

    fn call_function(
        &self,
        domain: DomainId,
        name: &str,
        args: &[Value],
    ) -> Result<Option<Value>, ScriptError> {
        let stats = self.stats_of(domain)?;
        let body = self
            .domains
            .borrow()
            .get(&domain)
            .and_then(|d| d.functions.get(name).cloned());

        match body {
            None => Ok(None),
            Some(Body::Return(value)) => Ok(Some(value)),
            Some(Body::Throw(message)) => Err(ScriptError::Runtime(message)),
            Some(Body::Hook(hook)) => self.run_hook(&hook, args),
            Some(Body::Alloc(bytes)) => {
                stats.record_allocation(bytes);
                Ok(Some(Value::Undefined))
            }
        }
    }

    fn run_pending_jobs(&self, domain: DomainId) -> Result<(), ScriptError> {
        self.stats_of(domain)?;
        self.jobs_run.set(self.jobs_run.get() + 1);
        Ok(())
    }

    fn global_heap_bytes(&self) -> u64 {
        self.stat_reads.set(self.stat_reads.get() + 1);
        self.global_heap.get()
    }

    fn prepare_domain_for_collection(&self, domain: DomainId) {
        self.log(GcCall::PrepareDomain(domain));
    }

    fn prepare_full_collection(&self) {
        self.log(GcCall::PrepareFull);
    }

    fn begin_incremental_collection(&self, slice_budget: Duration) {
        self.log(GcCall::BeginIncremental(slice_budget));
        let left = self.slices_per_cycle.get().saturating_sub(1);
        self.slices_left.set(left);
        self.incremental.set(left > 0);
        if left == 0 {
            self.collect();
        }
    }

    fn continue_incremental_slice(&self, slice_budget: Duration) {
        self.log(GcCall::ContinueSlice(slice_budget));
        let left = self.slices_left.get().saturating_sub(1);
        self.slices_left.set(left);
        if left == 0 {
            self.incremental.set(false);
            self.collect();
        }
    }

    fn is_incremental_collection_in_progress(&self) -> bool {
        self.incremental.get()
    }

    fn finish_incremental_collection(&self) {
        self.log(GcCall::Finish);
        self.slices_left.set(0);
        self.incremental.set(false);
        self.collect();
    }

    fn set_incremental_mode(&self, enabled: bool) {
        self.log(GcCall::IncrementalMode(enabled));
    }

    fn run_full_collection(&self, shrinking: bool) {
        self.log(GcCall::Full { shrinking });
        self.collect();
    }

    fn register_trace_root(&self, tracer: Arc<dyn RootTracer<Value>>) {
        *self.tracer.borrow_mut() = Some(tracer);
    }

    fn unregister_trace_root(&self) {
        self.tracer.borrow_mut().take();
    }
}

/// Panel host that records what the container tells it.
#[derive(Default)]
pub struct RecordingHost {
    failures: RefCell<Vec<String>>,
    timers_unbound: Cell<u32>,
}

impl RecordingHost {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.borrow().clone()
    }

    pub fn timers_unbound(&self) -> u32 {
        self.timers_unbound.get()
    }
}

impl PanelHost for RecordingHost {
    fn build_info(&self) -> String {
        "test build".to_string()
    }

    fn report_failure(&self, message: &str) {
        self.failures.borrow_mut().push(message.to_string());
    }

    fn unbind_timers(&self) {
        self.timers_unbound.set(self.timers_unbound.get() + 1);
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn starting_at(ms: u64) -> Rc<Self> {
        Rc::new(Self { now: Cell::new(ms) })
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

/// Small limits and no check delay.
pub fn test_config(max_heap: u64, growth: u64) -> GovernorConfig {
    GovernorConfig {
        max_heap_bytes: Some(max_heap),
        heap_growth_trigger: Some(growth),
        check_delay_ms: Some(0),
        ..Default::default()
    }
}

pub fn test_runtime(config: GovernorConfig) -> (Rc<ScriptRuntime<FakeEngine>>, Rc<ManualClock>) {
    let clock = ManualClock::starting_at(10_000);
    let runtime = ScriptRuntimeBuilder::new()
        .config(config)
        .clock(clock.clone())
        .build(|| Ok(FakeEngine::new()));
    (runtime, clock)
}

pub fn failing_runtime() -> Rc<ScriptRuntime<FakeEngine>> {
    ScriptRuntimeBuilder::new()
        .config(test_config(1 << 20, 1 << 16))
        .build(|| Err(EngineError::new("out of address space")))
}

pub fn engine_of(runtime: &ScriptRuntime<FakeEngine>) -> Rc<FakeEngine> {
    runtime.engine().expect("engine not started")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
