//! Heap Governor: decides when, and how hard, to collect the shared heap.
//!
//! The runtime's collector is not left to its own devices: the host polls
//! [`HeapGovernor::maybe_collect`] between script turns and the governor
//! picks a [`CollectionLevel`] from the heap readings.
//!
//! ## Level selection (first match wins)
//!
//! ```text
//! heap growth > trigger ──► cur ≤ 75% max ──► Incremental
//!                           cur ≤ 90% max ──► Normal
//!                           otherwise     ──► Full
//! cycle in progress | manual request | alloc growth > trigger ──► Incremental
//! otherwise ──► None
//! ```
//!
//! While collections keep recurring within [`HIGH_FREQUENCY_LIMIT_MS`], the
//! growth trigger and the slice budget are both doubled.
//!
//! All state lives in `Cell`s: the governor is only ever touched from the
//! script thread, and engine calls made from here may re-enter the host.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::ResolvedGovernorConfig;
use crate::engine::{DomainId, ScriptEngine};
use crate::heap::DomainStats;

/// Collections closer together than this are "high frequency".
pub const HIGH_FREQUENCY_LIMIT_MS: u64 = 1000;

const HIGH_FREQUENCY_GROWTH_MULTIPLIER: u64 = 2;
const HIGH_FREQUENCY_BUDGET_MULTIPLIER: u32 = 2;

/// How aggressive a collection pass should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CollectionLevel {
    None,
    Incremental,
    Normal,
    Full,
}

impl fmt::Display for CollectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Incremental => "incremental",
            Self::Normal => "normal",
            Self::Full => "full",
        };
        f.write_str(name)
    }
}

/// Millisecond time source.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// [`Clock`] backed by `Instant`, counting from its creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hysteresis carried from one decision to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GovernorState {
    pub last_total_heap_bytes: u64,
    pub last_total_alloc_count: u64,
    pub last_global_heap_bytes: u64,
    pub last_check_ms: Option<u64>,
    pub last_collection_ms: Option<u64>,
    pub is_high_frequency: bool,
    pub manual_trigger_pending: bool,
}

/// What the governor has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GovernorCounters {
    /// Checks that got past the delay window and read heap statistics.
    pub checks: u64,
    pub incremental: u64,
    pub normal: u64,
    pub full: u64,
    pub turns_begun: u64,
    pub turns_ended: u64,
}

pub struct HeapGovernor {
    config: ResolvedGovernorConfig,
    clock: Rc<dyn Clock>,
    state: Cell<GovernorState>,
    counters: Cell<GovernorCounters>,
    active_turns: Cell<u32>,
}

impl HeapGovernor {
    pub fn new(config: ResolvedGovernorConfig, clock: Rc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Cell::new(GovernorState::default()),
            counters: Cell::new(GovernorCounters::default()),
            active_turns: Cell::new(0),
        }
    }

    pub fn config(&self) -> &ResolvedGovernorConfig {
        &self.config
    }

    pub fn state(&self) -> GovernorState {
        self.state.get()
    }

    pub fn counters(&self) -> GovernorCounters {
        self.counters.get()
    }

    /// Number of containers currently inside a script turn.
    pub fn active_turns(&self) -> u32 {
        self.active_turns.get()
    }

    pub fn on_turn_begin(&self, domain: DomainId) {
        self.active_turns.set(self.active_turns.get() + 1);
        self.bump(|c| c.turns_begun += 1);
        tracing::trace!("Script turn begun in {}", domain);
    }

    pub fn on_turn_end(&self, domain: DomainId) {
        self.active_turns
            .set(self.active_turns.get().saturating_sub(1));
        self.bump(|c| c.turns_ended += 1);
        tracing::trace!("Script turn ended in {}", domain);
    }

    /// Run one governor check.
    ///
    /// Returns `false` when total heap usage is still at or above the maximum
    /// after the check. Skipped checks (turn active, delay window) return
    /// `true`.
    pub fn maybe_collect<E: ScriptEngine>(&self, engine: &E, domains: &[Rc<DomainStats>]) -> bool {
        if self.active_turns.get() > 0 {
            tracing::trace!("Collection check deferred: script turn active");
            return true;
        }

        if !self.is_time_to_check() {
            return true;
        }

        self.bump(|c| c.checks += 1);

        let level = self.required_level(engine, domains);
        if level == CollectionLevel::None {
            return true;
        }

        self.perform(level, engine, domains);
        self.refresh_hysteresis(engine, domains);

        let state = self.state.get();
        let within_limit = state.last_total_heap_bytes < self.config.max_heap_bytes;
        if !within_limit {
            tracing::warn!(
                "Heap usage {} bytes is above the {} byte limit after {} collection",
                state.last_total_heap_bytes,
                self.config.max_heap_bytes,
                level
            );
        }
        within_limit
    }

    /// Request at least an incremental collection, then check.
    pub fn trigger_manual_collection<E: ScriptEngine>(
        &self,
        engine: &E,
        domains: &[Rc<DomainStats>],
    ) -> bool {
        self.update_state(|s| s.manual_trigger_pending = true);
        self.maybe_collect(engine, domains)
    }

    /// Final blocking collection; resets all hysteresis.
    pub fn on_runtime_shutdown<E: ScriptEngine>(&self, engine: &E, domains: &[Rc<DomainStats>]) {
        if engine.is_incremental_collection_in_progress() {
            engine.finish_incremental_collection();
        }

        for stats in domains {
            stats.mark_for_collection();
        }
        engine.prepare_full_collection();
        engine.run_full_collection(false);
        self.notify_collection_done(domains);
        self.bump(|c| c.full += 1);

        self.state.set(GovernorState::default());
        tracing::debug!("Heap governor shut down ({} domains collected)", domains.len());
    }

    fn is_time_to_check(&self) -> bool {
        let now = self.clock.now_ms();
        let state = self.state.get();
        if let Some(last) = state.last_check_ms {
            if now.saturating_sub(last) < self.config.check_delay_ms {
                return false;
            }
        }
        self.update_state(|s| s.last_check_ms = Some(now));
        true
    }

    fn required_level<E: ScriptEngine>(
        &self,
        engine: &E,
        domains: &[Rc<DomainStats>],
    ) -> CollectionLevel {
        let heap_level = self.level_from_heap_size(engine, domains);
        if heap_level != CollectionLevel::None {
            return heap_level;
        }

        if engine.is_incremental_collection_in_progress()
            || self.state.get().manual_trigger_pending
            || self.level_from_alloc_count(domains) != CollectionLevel::None
        {
            self.update_state(|s| s.manual_trigger_pending = false);
            return CollectionLevel::Incremental;
        }

        CollectionLevel::None
    }

    fn level_from_heap_size<E: ScriptEngine>(
        &self,
        engine: &E,
        domains: &[Rc<DomainStats>],
    ) -> CollectionLevel {
        let current = total_heap_bytes(engine, domains);
        let mut state = self.state.get();

        // Baseline follows the heap down, never up
        if state.last_total_heap_bytes == 0 || state.last_total_heap_bytes > current {
            state.last_total_heap_bytes = current;
            self.state.set(state);
        }

        if current <= state.last_total_heap_bytes.saturating_add(self.growth_trigger()) {
            return CollectionLevel::None;
        }

        let level = level_for_fraction(current, self.config.max_heap_bytes);
        tracing::debug!(
            "Heap grew from {} to {} bytes (max {}): {} collection",
            state.last_total_heap_bytes,
            current,
            self.config.max_heap_bytes,
            level
        );
        level
    }

    fn level_from_alloc_count(&self, domains: &[Rc<DomainStats>]) -> CollectionLevel {
        let current = total_alloc_count(domains);
        let mut state = self.state.get();

        if state.last_total_alloc_count == 0 || state.last_total_alloc_count > current {
            state.last_total_alloc_count = current;
            self.state.set(state);
        }

        if current - state.last_total_alloc_count > self.config.alloc_count_trigger {
            tracing::debug!(
                "Allocation count grew from {} to {}: incremental collection",
                state.last_total_alloc_count,
                current
            );
            CollectionLevel::Incremental
        } else {
            CollectionLevel::None
        }
    }

    fn perform<E: ScriptEngine>(
        &self,
        level: CollectionLevel,
        engine: &E,
        domains: &[Rc<DomainStats>],
    ) {
        let in_progress = engine.is_incremental_collection_in_progress();
        if !in_progress {
            self.select_domains(level, engine, domains);
        }

        match level {
            CollectionLevel::None => return,
            CollectionLevel::Incremental => {
                let budget = self.slice_budget();
                if in_progress {
                    engine.continue_incremental_slice(budget);
                } else {
                    let prepared = prepare_marked(engine, domains);
                    if prepared == 0 {
                        engine.prepare_full_collection();
                    }
                    engine.begin_incremental_collection(budget);
                }
                self.bump(|c| c.incremental += 1);
            }
            CollectionLevel::Normal => {
                if in_progress {
                    engine.finish_incremental_collection();
                } else {
                    prepare_marked(engine, domains);
                }
                engine.run_full_collection(false);
                self.bump(|c| c.normal += 1);
            }
            CollectionLevel::Full => {
                if in_progress {
                    engine.finish_incremental_collection();
                }
                engine.set_incremental_mode(false);
                engine.prepare_full_collection();
                engine.run_full_collection(true);
                engine.set_incremental_mode(true);
                self.bump(|c| c.full += 1);
            }
        }

        if !engine.is_incremental_collection_in_progress() {
            self.notify_collection_done(domains);
        }
    }

    /// Mark the domains the coming cycle should cover.
    fn select_domains<E: ScriptEngine>(
        &self,
        level: CollectionLevel,
        engine: &E,
        domains: &[Rc<DomainStats>],
    ) {
        match level {
            CollectionLevel::None => {}
            CollectionLevel::Incremental => {
                let growth_trigger = self.growth_trigger();
                let global = engine.global_heap_bytes();
                let last_global = self.state.get().last_global_heap_bytes;

                // Native allocations are not attributed to domains precisely
                if global > last_global.saturating_add(growth_trigger) {
                    domains.iter().for_each(|stats| stats.mark_for_collection());
                    return;
                }

                let half_growth = growth_trigger / 2;
                let half_alloc = self.config.alloc_count_trigger / 2;
                for stats in domains {
                    let grew = stats.current_heap_bytes()
                        > stats.last_heap_bytes().saturating_add(half_growth);
                    let churned = stats.current_alloc_count()
                        > stats.last_alloc_count().saturating_add(half_alloc);
                    if grew || churned || stats.is_marked_for_deletion() {
                        stats.mark_for_collection();
                    }
                }
            }
            CollectionLevel::Normal | CollectionLevel::Full => {
                domains.iter().for_each(|stats| stats.mark_for_collection());
            }
        }
    }

    fn notify_collection_done(&self, domains: &[Rc<DomainStats>]) {
        for stats in domains.iter().filter(|s| s.is_marked_for_collection()) {
            stats.on_collection_done();
        }
    }

    fn refresh_hysteresis<E: ScriptEngine>(&self, engine: &E, domains: &[Rc<DomainStats>]) {
        if engine.is_incremental_collection_in_progress() {
            return;
        }

        let now = self.clock.now_ms();
        let global = engine.global_heap_bytes();
        let total = total_heap_bytes(engine, domains);
        let allocs = total_alloc_count(domains);

        self.update_state(|s| {
            s.last_global_heap_bytes = global;
            s.last_total_heap_bytes = total;
            s.last_total_alloc_count = allocs;
            s.is_high_frequency = s
                .last_collection_ms
                .is_some_and(|last| now < last + HIGH_FREQUENCY_LIMIT_MS);
            s.last_collection_ms = Some(now);
        });
    }

    fn growth_trigger(&self) -> u64 {
        if self.state.get().is_high_frequency {
            self.config.heap_growth_trigger * HIGH_FREQUENCY_GROWTH_MULTIPLIER
        } else {
            self.config.heap_growth_trigger
        }
    }

    fn slice_budget(&self) -> Duration {
        if self.state.get().is_high_frequency {
            self.config.slice_budget * HIGH_FREQUENCY_BUDGET_MULTIPLIER
        } else {
            self.config.slice_budget
        }
    }

    fn update_state(&self, f: impl FnOnce(&mut GovernorState)) {
        let mut state = self.state.get();
        f(&mut state);
        self.state.set(state);
    }

    fn bump(&self, f: impl FnOnce(&mut GovernorCounters)) {
        let mut counters = self.counters.get();
        f(&mut counters);
        self.counters.set(counters);
    }
}

impl fmt::Debug for HeapGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapGovernor")
            .field("config", &self.config)
            .field("state", &self.state.get())
            .field("active_turns", &self.active_turns.get())
            .finish()
    }
}

/// Level for a heap reading that exceeded the growth trigger.
///
/// Boundary values select the lower level.
pub fn level_for_fraction(current: u64, max: u64) -> CollectionLevel {
    let current = u128::from(current) * 100;
    let max = u128::from(max);
    if current <= max * 75 {
        CollectionLevel::Incremental
    } else if current <= max * 90 {
        CollectionLevel::Normal
    } else {
        CollectionLevel::Full
    }
}

fn total_heap_bytes<E: ScriptEngine>(engine: &E, domains: &[Rc<DomainStats>]) -> u64 {
    domains
        .iter()
        .fold(engine.global_heap_bytes(), |sum, stats| {
            sum.saturating_add(stats.current_heap_bytes())
        })
}

fn total_alloc_count(domains: &[Rc<DomainStats>]) -> u64 {
    domains
        .iter()
        .fold(0, |sum, stats| sum.saturating_add(stats.current_alloc_count()))
}

fn prepare_marked<E: ScriptEngine>(engine: &E, domains: &[Rc<DomainStats>]) -> usize {
    let mut prepared = 0;
    for stats in domains.iter().filter(|s| s.is_marked_for_collection()) {
        engine.prepare_domain_for_collection(stats.id());
        prepared += 1;
    }
    prepared
}
