//! Instrumentation hook
//!
//! [`Tracer`] is the single point of contact with whatever delivers call
//! events: a runtime's profile callback, compiler-inserted instrumentation, or
//! the [`CallGuard`]s created by [`Tracer::enter`]. Each event is handled in
//! O(1) amortized time: one clock read, one stack push or pop, and on exit one
//! table update.
//!
//! # Lifecycle
//!
//! ```text
//! state: AtomicU64 = session << 1 | enabled
//!
//! enable()   state |= 1                         (no-op if already enabled)
//! disable()  state = (session + 1) << 1         (under the table write lock)
//! ```
//!
//! Frames are tagged with the session they were pushed in, and a completed
//! call is recorded only if the state word is unchanged when the table's read
//! lock is held. Because `disable()` swaps the word under the write lock, no
//! call can land in the table once `disable()` has returned. Frames still in
//! flight at that point are dropped without being aggregated: a call that
//! straddles `disable()` is never reported, even if tracing is re-enabled
//! before it returns.

use crate::aggregator::{AggregateRecord, AggregateTable, DurationAggregator};
use crate::clock::{Clock, MonotonicClock};
use crate::config::TracerConfig;
use crate::error::Result;
use crate::fault::{FaultCounts, FaultKind, FaultLog, FaultRecord};
use crate::identity::{FunctionId, ThreadKey};
use crate::stack::{CallStackTracker, CompletedCall, PopOutcome};
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ENABLED: u64 = 1;

/// Predicate deciding whether a completed call is aggregated
pub type RecordFilter = Arc<dyn Fn(&CompletedCall) -> bool + Send + Sync>;

/// What happened to an exit event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Call aggregated
    Recorded(CompletedCall),
    /// Call completed but the record filter rejected it
    Filtered(CompletedCall),
    /// Call completed but tracing was disabled before it could be recorded
    Discarded,
    /// Exit for a frame dropped when its session ended
    Stale,
    /// Consistency fault; nothing was aggregated
    Fault(FaultKind),
    /// Tracer disabled; event not processed
    Ignored,
}

impl ExitOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, ExitOutcome::Recorded(_))
    }
}

/// Point-in-time view of everything the reporter needs
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    #[serde(serialize_with = "serialize_table")]
    pub records: AggregateTable,
    pub faults: FaultCounts,
    /// Completed calls rejected by the record filter
    pub filtered_calls: u64,
}

fn serialize_table<S: serde::Serializer>(
    table: &AggregateTable,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Entry<'a> {
        function: &'a FunctionId,
        #[serde(flatten)]
        record: &'a AggregateRecord,
    }
    serializer.collect_seq(
        table
            .iter()
            .map(|(function, record)| Entry { function, record }),
    )
}

impl Snapshot {
    pub fn get(&self, function: &FunctionId) -> Option<&AggregateRecord> {
        self.records.get(function)
    }

    /// First record whose qualified name equals `name`
    pub fn find(&self, name: &str) -> Option<(&FunctionId, &AggregateRecord)> {
        self.records
            .iter()
            .find(|(function, _)| function.name() == name)
    }

    /// Sum of self time over all functions
    pub fn total_self_time(&self) -> Duration {
        self.records.values().map(|r| r.self_time).sum()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Call-stack latency tracer
pub struct Tracer<C: Clock = MonotonicClock> {
    clock: C,
    state: AtomicU64,
    tracker: CallStackTracker,
    aggregator: DurationAggregator,
    faults: FaultLog,
    filter: Option<RecordFilter>,
    filtered: AtomicU64,
}

impl Tracer<MonotonicClock> {
    /// Build a tracer on the system monotonic clock
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or no monotonic clock is
    /// available.
    pub fn new(config: TracerConfig) -> Result<Self> {
        Self::with_clock(config, MonotonicClock::new()?)
    }
}

impl<C: Clock> Tracer<C> {
    /// Build a tracer on an explicit clock
    pub fn with_clock(config: TracerConfig, clock: C) -> Result<Self> {
        config.validate()?;

        let filter = config.min_latency().map(|threshold| {
            Arc::new(move |call: &CompletedCall| call.elapsed >= threshold) as RecordFilter
        });
        let state = if config.start_enabled { ENABLED } else { 0 };

        tracing::debug!(?config, "tracer created");
        Ok(Self {
            clock,
            state: AtomicU64::new(state),
            tracker: CallStackTracker::new(config.stack_capacity),
            aggregator: DurationAggregator::new(),
            faults: FaultLog::new(config.fault_log_capacity),
            filter,
            filtered: AtomicU64::new(0),
        })
    }

    /// Replace the record filter with an arbitrary predicate
    ///
    /// Rejected calls are counted in [`Snapshot::filtered_calls`] and leave
    /// the table untouched; their time still counts toward the caller's
    /// child time.
    pub fn with_record_filter(
        mut self,
        filter: impl Fn(&CompletedCall) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn is_enabled(&self) -> bool {
        self.state.load(Ordering::Acquire) & ENABLED != 0
    }

    /// Start receiving events; returns false if already enabled
    pub fn enable(&self) -> bool {
        let previous = self.state.fetch_or(ENABLED, Ordering::SeqCst);
        let changed = previous & ENABLED == 0;
        if changed {
            tracing::info!(session = previous >> 1, "call tracing enabled");
        }
        changed
    }

    /// Stop receiving events; returns false if already disabled
    ///
    /// Takes effect for every thread before it returns. Frames pushed but not
    /// yet popped are discarded without being aggregated.
    pub fn disable(&self) -> bool {
        let swapped = self.aggregator.exclusive(|| {
            self.state
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                    (state & ENABLED != 0).then(|| ((state >> 1) + 1) << 1)
                })
        });
        match swapped {
            Ok(previous) => {
                tracing::info!(session = previous >> 1, "call tracing disabled");
                true
            }
            Err(_) => false,
        }
    }

    /// Start a fresh measurement window
    ///
    /// Clears aggregate records, fault counters and the filtered-call count.
    /// Active frames are kept, so calls in progress are recorded when they
    /// return.
    pub fn reset(&self) {
        self.aggregator.reset();
        self.faults.clear();
        self.filtered.store(0, Ordering::Relaxed);
        tracing::info!("call tracing statistics reset");
    }

    /// Call-enter event; returns whether a frame was pushed
    #[inline]
    pub fn notify_call_enter(&self, thread: ThreadKey, function: FunctionId) -> bool {
        let state = self.state.load(Ordering::Acquire);
        if state & ENABLED == 0 {
            return false;
        }
        let now = self.clock.now();
        self.tracker.on_enter(thread, function, now, state >> 1);
        true
    }

    /// Call-exit event (normal return or unwind)
    #[inline]
    pub fn notify_call_exit(&self, thread: ThreadKey, function: &FunctionId) -> ExitOutcome {
        let now = self.clock.now();
        let state = self.state.load(Ordering::Acquire);
        if state & ENABLED == 0 {
            self.tracker.on_ignored_exit(thread, function, state >> 1);
            return ExitOutcome::Ignored;
        }

        let outcome = self.tracker.on_exit(thread, function, now, state >> 1);
        for kind in outcome.faults() {
            let top_of_stack = match (&outcome, kind) {
                (_, FaultKind::NegativeDuration) | (PopOutcome::Stale, _) => None,
                (PopOutcome::Completed { resynced_from, .. }, _) => resynced_from.clone(),
                (PopOutcome::Rejected { top_of_stack, .. }, _) => top_of_stack.clone(),
            };
            self.faults.report(FaultRecord {
                kind,
                thread,
                function: function.clone(),
                top_of_stack,
                at: now,
            });
        }

        match outcome {
            PopOutcome::Completed { call, .. } => self.record(call, state),
            PopOutcome::Stale => ExitOutcome::Stale,
            PopOutcome::Rejected { kind, .. } => ExitOutcome::Fault(kind),
        }
    }

    fn record(&self, call: CompletedCall, state: u64) -> ExitOutcome {
        let live = || self.state.load(Ordering::SeqCst) == state;

        if self.filter.as_ref().is_some_and(|filter| !filter(&call)) {
            // Counted under the same gate as records, so nothing moves after disable()
            let counted = self.aggregator.shared(|| {
                let counted = live();
                if counted {
                    self.filtered.fetch_add(1, Ordering::Relaxed);
                }
                counted
            });
            return if counted {
                ExitOutcome::Filtered(call)
            } else {
                ExitOutcome::Discarded
            };
        }

        let recorded = self.aggregator.record_gated(&call, live);
        if recorded {
            ExitOutcome::Recorded(call)
        } else {
            ExitOutcome::Discarded
        }
    }

    /// Open a scoped call on the current thread
    ///
    /// The exit event is delivered when the guard drops, including during
    /// panic unwinding.
    pub fn enter(&self, function: FunctionId) -> CallGuard<'_, C> {
        let thread = ThreadKey::current();
        let function = self
            .notify_call_enter(thread, function.clone())
            .then_some(function);
        CallGuard {
            tracer: self,
            thread,
            function,
            _not_send: PhantomData,
        }
    }

    /// Run `f` as a traced call
    pub fn trace<R>(&self, function: FunctionId, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter(function);
        f()
    }

    /// Immutable copy of the aggregate table and fault counters
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            records: self.aggregator.snapshot(),
            faults: self.faults.counts(),
            filtered_calls: self.filtered.load(Ordering::Relaxed),
        }
    }

    /// Remove and return recently logged consistency faults
    pub fn drain_faults(&self) -> Vec<FaultRecord> {
        self.faults.drain()
    }

    /// Active frames on `thread` in the current session
    pub fn depth(&self, thread: ThreadKey) -> usize {
        let session = self.state.load(Ordering::Acquire) >> 1;
        self.tracker.depth(thread, session)
    }

    /// Number of threads holding a call stack
    pub fn thread_count(&self) -> usize {
        self.tracker.thread_count()
    }

    /// Drop the stack of a terminated thread
    ///
    /// Only needed for host-supplied keys; stacks of threads keyed by
    /// [`ThreadKey::current`] are dropped when the thread exits.
    pub fn release_thread(&self, thread: ThreadKey) -> usize {
        let dropped = self.tracker.release_thread(thread);
        if dropped > 0 {
            tracing::debug!(%thread, dropped, "released thread with active frames");
        }
        dropped
    }
}

impl<C: Clock> fmt::Debug for Tracer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("Tracer")
            .field("clock", &self.clock)
            .field("enabled", &(state & ENABLED != 0))
            .field("session", &(state >> 1))
            .field("functions", &self.aggregator.len())
            .field("threads", &self.tracker.thread_count())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Scoped call on the current thread
///
/// Dropping the guard delivers the exit event, so early returns, `?` and
/// panics all close the frame exactly once. A guard created while the tracer
/// was disabled is inert.
#[must_use = "dropping the guard immediately ends the traced call"]
pub struct CallGuard<'a, C: Clock = MonotonicClock> {
    tracer: &'a Tracer<C>,
    thread: ThreadKey,
    function: Option<FunctionId>,
    // Exit must be delivered on the thread that entered
    _not_send: PhantomData<*const ()>,
}

impl<C: Clock> CallGuard<'_, C> {
    /// Whether the enter event was accepted
    pub fn is_active(&self) -> bool {
        self.function.is_some()
    }
}

impl<C: Clock> Drop for CallGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(function) = self.function.take() {
            self.tracer.notify_call_exit(self.thread, &function);
        }
    }
}

impl<C: Clock> fmt::Debug for CallGuard<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGuard")
            .field("thread", &self.thread)
            .field("function", &self.function)
            .finish()
    }
}
