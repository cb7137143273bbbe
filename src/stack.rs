//! Per-thread call stacks
//!
//! Each thread that delivers events gets its own [`ThreadStack`], created
//! lazily on its first call-enter. Stacks are never shared: the mutex around
//! each one is only taken by events for that thread (and by
//! [`CallStackTracker::release_thread`]), so it is always uncontended on the
//! hot path. The registry itself is read-locked per event and write-locked
//! only when a new thread shows up.
//!
//! Frames carry the session they were pushed in. When the hook starts a new
//! session, a stack still holding frames from the old one drops them on its
//! next access and remembers which functions it dropped, so the late exit of
//! each of those calls is absorbed once instead of being reported as a fault.
//! That memory only lasts until the following session change.
//!
//! Stacks keyed by [`ThreadKey::current`] are removed when their thread
//! exits. Host-supplied keys stay until [`CallStackTracker::release_thread`].

use crate::clock::Timestamp;
use crate::fault::FaultKind;
use crate::identity::{FunctionId, ThreadKey};
use fnv::FnvHashMap;
use std::cell::RefCell;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

type StackMap = FnvHashMap<ThreadKey, Arc<Mutex<ThreadStack>>>;

/// One active invocation
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub function: FunctionId,
    pub start: Timestamp,
    /// Total elapsed time of completed callees
    pub child_time: Duration,
    pub thread: ThreadKey,
}

/// A finished invocation, ready for aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCall {
    pub function: FunctionId,
    /// Wall time from enter to exit, callees included
    pub elapsed: Duration,
    /// `elapsed` minus time spent in callees
    pub self_time: Duration,
    pub thread: ThreadKey,
}

/// Result of delivering an exit event to a thread's stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome {
    /// A frame for the exiting function was popped
    Completed {
        call: CompletedCall,
        /// Top of stack when the exiting function was found below it;
        /// the frames above it were discarded
        resynced_from: Option<FunctionId>,
        /// A negative duration was clamped to zero
        clamped: bool,
    },
    /// Exit for a frame dropped by a session change
    Stale,
    /// Consistency fault; the stack was left untouched
    Rejected {
        kind: FaultKind,
        top_of_stack: Option<FunctionId>,
    },
}

impl PopOutcome {
    /// Faults to report for this outcome
    ///
    /// A resynced pop can also clamp, in which case both are reported.
    pub fn faults(&self) -> Vec<FaultKind> {
        match self {
            PopOutcome::Completed {
                resynced_from,
                clamped,
                ..
            } => {
                let mut faults = Vec::new();
                if resynced_from.is_some() {
                    faults.push(FaultKind::Mismatch);
                }
                if *clamped {
                    faults.push(FaultKind::NegativeDuration);
                }
                faults
            }
            PopOutcome::Stale => Vec::new(),
            PopOutcome::Rejected { kind, .. } => vec![*kind],
        }
    }
}

/// LIFO stack of the active frames on one thread
#[derive(Debug)]
pub struct ThreadStack {
    frames: Vec<CallFrame>,
    session: u64,
    /// Functions whose frames the last session change dropped
    stale: Vec<FunctionId>,
}

impl ThreadStack {
    pub fn new(capacity: usize, session: u64) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            session,
            stale: Vec::new(),
        }
    }

    /// Drop frames left over from an earlier session
    ///
    /// Exits still owed from the session before that are forgotten: only the
    /// frames dropped here can absorb a late exit.
    pub fn sync_session(&mut self, session: u64) {
        if self.session != session {
            self.stale.clear();
            self.stale.extend(self.frames.drain(..).map(|frame| frame.function));
            self.session = session;
        }
    }

    /// Consume the late exit of a dropped frame, if `function` owes one
    pub fn absorb_stale(&mut self, function: &FunctionId) -> bool {
        match self.stale.iter().rposition(|f| f == function) {
            Some(pos) => {
                self.stale.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, frame: CallFrame) {
        self.frames.push(frame);
    }

    /// Pop the frame for `function`, computing its elapsed and self time
    ///
    /// The common case (exiting function on top) is O(1). If the exiting
    /// function sits deeper, the callees above it never reported their exit:
    /// they are discarded without aggregation and the matching frame
    /// completes normally. If it is not on the stack at all the event is a
    /// no-op.
    pub fn pop_matching(&mut self, function: &FunctionId, now: Timestamp) -> PopOutcome {
        let Some(pos) = self.frames.iter().rposition(|f| &f.function == function) else {
            if self.absorb_stale(function) {
                return PopOutcome::Stale;
            }
            let kind = if self.frames.is_empty() {
                FaultKind::EmptyStack
            } else {
                FaultKind::Mismatch
            };
            return PopOutcome::Rejected {
                kind,
                top_of_stack: self.top().map(|f| f.function.clone()),
            };
        };

        let resynced_from = if pos + 1 < self.frames.len() {
            let top = self.top().map(|f| f.function.clone());
            self.frames.truncate(pos + 1);
            top
        } else {
            None
        };

        let Some(frame) = self.frames.pop() else {
            return PopOutcome::Rejected {
                kind: FaultKind::EmptyStack,
                top_of_stack: None,
            };
        };

        let mut clamped = false;
        let elapsed = now.checked_duration_since(frame.start).unwrap_or_else(|| {
            clamped = true;
            Duration::ZERO
        });
        let self_time = elapsed.checked_sub(frame.child_time).unwrap_or_else(|| {
            clamped = true;
            Duration::ZERO
        });

        // The whole child call counts as time-in-callees for the parent
        if let Some(parent) = self.frames.last_mut() {
            parent.child_time += elapsed;
        }

        PopOutcome::Completed {
            call: CompletedCall {
                function: frame.function,
                elapsed,
                self_time,
                thread: frame.thread,
            },
            resynced_from,
            clamped,
        }
    }

    pub fn top(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn lock(stack: &Mutex<ThreadStack>) -> MutexGuard<'_, ThreadStack> {
    stack.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registries holding a stack for the current thread, cleaned up on exit
#[derive(Default)]
struct ThreadExit {
    thread: Option<ThreadKey>,
    registries: Vec<Weak<RwLock<StackMap>>>,
}

impl ThreadExit {
    fn register(&mut self, thread: ThreadKey, registry: Weak<RwLock<StackMap>>) {
        self.thread = Some(thread);
        self.registries.retain(|r| r.strong_count() > 0);
        if !self.registries.iter().any(|r| r.ptr_eq(&registry)) {
            self.registries.push(registry);
        }
    }
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        let Some(thread) = self.thread else {
            return;
        };
        for registry in self.registries.drain(..) {
            if let Some(stacks) = registry.upgrade() {
                stacks
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&thread);
                tracing::trace!(%thread, "released call stack on thread exit");
            }
        }
    }
}

thread_local! {
    static THREAD_EXIT: RefCell<ThreadExit> = RefCell::new(ThreadExit::default());
}

/// Registry of per-thread stacks
#[derive(Debug, Default)]
pub struct CallStackTracker {
    stacks: Arc<RwLock<StackMap>>,
    stack_capacity: usize,
}

impl CallStackTracker {
    /// Create a tracker whose stacks preallocate `stack_capacity` frames
    pub fn new(stack_capacity: usize) -> Self {
        Self {
            stacks: Arc::new(RwLock::new(FnvHashMap::default())),
            stack_capacity,
        }
    }

    /// Push a frame for `function` on `thread`'s stack
    pub fn on_enter(&self, thread: ThreadKey, function: FunctionId, now: Timestamp, session: u64) {
        let frame = CallFrame {
            function,
            start: now,
            child_time: Duration::ZERO,
            thread,
        };
        self.with_stack(thread, session, |stack| stack.push(frame));
    }

    /// Pop the frame for `function` from `thread`'s stack
    pub fn on_exit(
        &self,
        thread: ThreadKey,
        function: &FunctionId,
        now: Timestamp,
        session: u64,
    ) -> PopOutcome {
        self.with_existing(thread, session, |stack| stack.pop_matching(function, now))
            .unwrap_or(PopOutcome::Rejected {
                kind: FaultKind::EmptyStack,
                top_of_stack: None,
            })
    }

    /// Account for an exit delivered while tracing is off
    ///
    /// Nothing is measured, but if the exit belongs to a frame dropped when
    /// `session` began, that frame no longer owes a late exit.
    pub fn on_ignored_exit(&self, thread: ThreadKey, function: &FunctionId, session: u64) {
        self.with_existing(thread, session, |stack| stack.absorb_stale(function));
    }

    /// Number of active frames on `thread` in `session`
    pub fn depth(&self, thread: ThreadKey, session: u64) -> usize {
        self.with_existing(thread, session, |stack| stack.depth())
            .unwrap_or(0)
    }

    /// Number of threads with a stack
    pub fn thread_count(&self) -> usize {
        self.stacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forget a terminated thread, returning how many frames were dropped
    pub fn release_thread(&self, thread: ThreadKey) -> usize {
        let removed = self
            .stacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&thread);
        removed.map_or(0, |stack| lock(&stack).depth())
    }

    fn with_stack<R>(
        &self,
        thread: ThreadKey,
        session: u64,
        f: impl FnOnce(&mut ThreadStack) -> R,
    ) -> R {
        {
            let stacks = self.stacks.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(stack) = stacks.get(&thread) {
                let mut stack = lock(stack);
                stack.sync_session(session);
                return f(&mut stack);
            }
        }

        let mut stacks = self.stacks.write().unwrap_or_else(PoisonError::into_inner);
        let stack = stacks.entry(thread).or_insert_with(|| {
            tracing::trace!(%thread, "creating call stack");
            self.release_on_exit(thread);
            Arc::new(Mutex::new(ThreadStack::new(self.stack_capacity, session)))
        });
        let mut stack = lock(stack);
        stack.sync_session(session);
        f(&mut stack)
    }

    /// Drop `thread`'s stack when it exits, if `thread` is the caller
    fn release_on_exit(&self, thread: ThreadKey) {
        if ThreadKey::assigned() != Some(thread) {
            return;
        }
        let registry = Arc::downgrade(&self.stacks);
        // Fails only while the thread is already tearing down
        let _ = THREAD_EXIT.try_with(|exit| exit.borrow_mut().register(thread, registry));
    }

    fn with_existing<R>(
        &self,
        thread: ThreadKey,
        session: u64,
        f: impl FnOnce(&mut ThreadStack) -> R,
    ) -> Option<R> {
        let stacks = self.stacks.read().unwrap_or_else(PoisonError::into_inner);
        let stack = stacks.get(&thread)?;
        let mut stack = lock(stack);
        stack.sync_session(session);
        Some(f(&mut stack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: ThreadKey = ThreadKey::from_raw(1);
    const T2: ThreadKey = ThreadKey::from_raw(2);

    fn id(name: &str) -> FunctionId {
        FunctionId::new(name, "src/stack.rs", 1)
    }

    fn ms(n: u64) -> Timestamp {
        Timestamp::from_nanos(n * 1_000_000)
    }

    fn completed(outcome: PopOutcome) -> CompletedCall {
        match outcome {
            PopOutcome::Completed { call, .. } => call,
            other => panic!("expected completed call, got {:?}", other),
        }
    }

    #[test]
    fn test_enter_exit_computes_elapsed() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);
        assert_eq!(tracker.depth(T1, 0), 1);

        let call = completed(tracker.on_exit(T1, &id("f"), ms(7), 0));
        assert_eq!(call.elapsed, Duration::from_millis(7));
        assert_eq!(call.self_time, Duration::from_millis(7));
        assert_eq!(call.thread, T1);
        assert_eq!(tracker.depth(T1, 0), 0);
    }

    #[test]
    fn test_child_elapsed_attributed_to_parent() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);
        tracker.on_enter(T1, id("g"), ms(5), 0);

        let g = completed(tracker.on_exit(T1, &id("g"), ms(15), 0));
        assert_eq!(g.elapsed, Duration::from_millis(10));

        let f = completed(tracker.on_exit(T1, &id("f"), ms(30), 0));
        assert_eq!(f.elapsed, Duration::from_millis(30));
        assert_eq!(f.self_time, Duration::from_millis(20));
    }

    #[test]
    fn test_recursive_activations_are_distinct_frames() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("r"), ms(0), 0);
        tracker.on_enter(T1, id("r"), ms(1), 0);
        tracker.on_enter(T1, id("r"), ms(2), 0);
        assert_eq!(tracker.depth(T1, 0), 3);

        let inner = completed(tracker.on_exit(T1, &id("r"), ms(3), 0));
        let middle = completed(tracker.on_exit(T1, &id("r"), ms(5), 0));
        let outer = completed(tracker.on_exit(T1, &id("r"), ms(9), 0));

        assert_eq!(inner.elapsed, Duration::from_millis(1));
        assert_eq!(middle.elapsed, Duration::from_millis(4));
        assert_eq!(middle.self_time, Duration::from_millis(3));
        assert_eq!(outer.self_time, Duration::from_millis(5));
        let self_sum = inner.self_time + middle.self_time + outer.self_time;
        assert_eq!(self_sum, outer.elapsed);
    }

    #[test]
    fn test_exit_on_empty_stack_is_rejected() {
        let tracker = CallStackTracker::new(4);
        let outcome = tracker.on_exit(T1, &id("f"), ms(1), 0);
        assert_eq!(
            outcome,
            PopOutcome::Rejected {
                kind: FaultKind::EmptyStack,
                top_of_stack: None
            }
        );
        assert_eq!(outcome.faults(), [FaultKind::EmptyStack]);
    }

    #[test]
    fn test_unknown_exit_leaves_stack_untouched() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);

        let outcome = tracker.on_exit(T1, &id("h"), ms(1), 0);
        assert_eq!(
            outcome,
            PopOutcome::Rejected {
                kind: FaultKind::Mismatch,
                top_of_stack: Some(id("f"))
            }
        );
        assert_eq!(tracker.depth(T1, 0), 1);

        // f still closes normally afterwards
        let f = completed(tracker.on_exit(T1, &id("f"), ms(4), 0));
        assert_eq!(f.elapsed, Duration::from_millis(4));
    }

    #[test]
    fn test_exit_below_top_discards_missed_callees() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);
        tracker.on_enter(T1, id("g"), ms(1), 0);
        tracker.on_enter(T1, id("h"), ms(2), 0);

        let outcome = tracker.on_exit(T1, &id("f"), ms(10), 0);
        assert_eq!(outcome.faults(), [FaultKind::Mismatch]);
        match outcome {
            PopOutcome::Completed {
                call,
                resynced_from,
                ..
            } => {
                assert_eq!(call.function, id("f"));
                assert_eq!(call.elapsed, Duration::from_millis(10));
                assert_eq!(call.self_time, Duration::from_millis(10));
                assert_eq!(resynced_from, Some(id("h")));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(tracker.depth(T1, 0), 0);
    }

    #[test]
    fn test_backwards_clock_is_clamped() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(10), 0);

        let outcome = tracker.on_exit(T1, &id("f"), ms(4), 0);
        assert_eq!(outcome.faults(), [FaultKind::NegativeDuration]);
        let call = completed(outcome);
        assert_eq!(call.elapsed, Duration::ZERO);
        assert_eq!(call.self_time, Duration::ZERO);
    }

    #[test]
    fn test_threads_have_independent_stacks() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);
        tracker.on_enter(T2, id("g"), ms(1), 0);
        assert_eq!(tracker.thread_count(), 2);

        // g is not on T1's stack
        let outcome = tracker.on_exit(T1, &id("g"), ms(2), 0);
        assert_eq!(outcome.faults(), [FaultKind::Mismatch]);

        let g = completed(tracker.on_exit(T2, &id("g"), ms(3), 0));
        assert_eq!(g.elapsed, Duration::from_millis(2));
        assert_eq!(tracker.depth(T1, 0), 1);
    }

    #[test]
    fn test_session_change_drops_frames_and_absorbs_late_exits() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);
        tracker.on_enter(T1, id("g"), ms(1), 0);

        // New session: both frames are gone
        assert_eq!(tracker.depth(T1, 1), 0);
        tracker.on_enter(T1, id("k"), ms(2), 1);
        let k = completed(tracker.on_exit(T1, &id("k"), ms(3), 1));
        assert_eq!(k.elapsed, Duration::from_millis(1));

        assert_eq!(tracker.on_exit(T1, &id("g"), ms(4), 1), PopOutcome::Stale);
        assert_eq!(tracker.on_exit(T1, &id("f"), ms(5), 1), PopOutcome::Stale);
        // Stale budget exhausted; further unmatched exits are faults again
        assert_eq!(
            tracker.on_exit(T1, &id("f"), ms(6), 1).faults(),
            [FaultKind::EmptyStack]
        );
    }

    #[test]
    fn test_stale_exits_only_absorb_dropped_functions() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);

        // h never had a frame, so it is a fault even with f's exit still owed
        assert_eq!(
            tracker.on_exit(T1, &id("h"), ms(1), 1).faults(),
            [FaultKind::EmptyStack]
        );
        assert_eq!(tracker.on_exit(T1, &id("f"), ms(2), 1), PopOutcome::Stale);
    }

    #[test]
    fn test_ignored_exit_settles_dropped_frame() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);

        // f returns while tracing is off
        tracker.on_ignored_exit(T1, &id("f"), 1);
        assert_eq!(
            tracker.on_exit(T1, &id("f"), ms(2), 1).faults(),
            [FaultKind::EmptyStack]
        );
    }

    #[test]
    fn test_owed_exits_expire_at_next_session() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);
        assert_eq!(tracker.depth(T1, 1), 0);

        assert_eq!(
            tracker.on_exit(T1, &id("f"), ms(1), 2).faults(),
            [FaultKind::EmptyStack]
        );
    }

    #[test]
    fn test_resync_and_clamp_both_reported() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(10), 0);
        tracker.on_enter(T1, id("g"), ms(11), 0);

        let outcome = tracker.on_exit(T1, &id("f"), ms(5), 0);
        assert_eq!(
            outcome.faults(),
            [FaultKind::Mismatch, FaultKind::NegativeDuration]
        );
        assert_eq!(completed(outcome).elapsed, Duration::ZERO);
    }

    #[test]
    fn test_exited_threads_release_their_stacks() {
        let tracker = Arc::new(CallStackTracker::new(4));
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let thread = ThreadKey::current();
                    tracker.on_enter(thread, id("worker"), ms(i), 0);
                    tracker.on_exit(thread, &id("worker"), ms(i + 1), 0);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.thread_count(), 0);
    }

    #[test]
    fn test_raw_keys_kept_until_released() {
        let tracker = Arc::new(CallStackTracker::new(4));
        let worker = Arc::clone(&tracker);
        std::thread::spawn(move || worker.on_enter(T2, id("host"), ms(0), 0))
            .join()
            .unwrap();
        assert_eq!(tracker.thread_count(), 1);
        assert_eq!(tracker.release_thread(T2), 1);
    }

    #[test]
    fn test_release_thread() {
        let tracker = CallStackTracker::new(4);
        tracker.on_enter(T1, id("f"), ms(0), 0);
        tracker.on_enter(T1, id("g"), ms(0), 0);
        assert_eq!(tracker.release_thread(T1), 2);
        assert_eq!(tracker.thread_count(), 0);
        assert_eq!(tracker.release_thread(T1), 0);
    }

    #[test]
    fn test_deep_recursion_memory_is_linear_in_depth() {
        let tracker = CallStackTracker::new(0);
        for depth in 0..10_000u64 {
            tracker.on_enter(T1, id("deep"), Timestamp::from_nanos(depth), 0);
        }
        assert_eq!(tracker.depth(T1, 0), 10_000);
        for depth in (0..10_000u64).rev() {
            let now = Timestamp::from_nanos(20_000 - depth);
            let outcome = tracker.on_exit(T1, &id("deep"), now, 0);
            assert!(outcome.faults().is_empty());
        }
        assert_eq!(tracker.depth(T1, 0), 0);
    }
}
