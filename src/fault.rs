//! Consistency fault accounting
//!
//! A profiler must never alter the behavior of the program it observes, so
//! stack/frame mismatches and negative durations are not errors. Each one
//! bumps a counter and lands in a bounded log of recent faults that the
//! reporter can drain. When the log is full the oldest entry is overwritten,
//! so reporting a fault never blocks the traced thread.

use crate::clock::Timestamp;
use crate::identity::{FunctionId, ThreadKey};
use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of consistency fault detected on an exit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Exit event delivered for a thread with no active frames
    EmptyStack,
    /// Exiting function does not match the top of the stack
    Mismatch,
    /// Clock went backwards, or callee time exceeded the caller's elapsed time
    NegativeDuration,
}

impl FaultKind {
    pub const ALL: [FaultKind; 3] = [
        FaultKind::EmptyStack,
        FaultKind::Mismatch,
        FaultKind::NegativeDuration,
    ];

    fn index(self) -> usize {
        match self {
            FaultKind::EmptyStack => 0,
            FaultKind::Mismatch => 1,
            FaultKind::NegativeDuration => 2,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::EmptyStack => "empty stack",
            FaultKind::Mismatch => "frame mismatch",
            FaultKind::NegativeDuration => "negative duration",
        };
        f.write_str(name)
    }
}

/// One logged consistency fault
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub thread: ThreadKey,
    /// Function named by the exit event
    pub function: FunctionId,
    /// Function on top of the stack when the fault was detected
    pub top_of_stack: Option<FunctionId>,
    pub at: Timestamp,
}

/// Point-in-time fault counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultCounts {
    pub empty_stack: u64,
    pub mismatch: u64,
    pub negative_duration: u64,
}

impl FaultCounts {
    pub fn total(&self) -> u64 {
        self.empty_stack + self.mismatch + self.negative_duration
    }

    pub fn get(&self, kind: FaultKind) -> u64 {
        match kind {
            FaultKind::EmptyStack => self.empty_stack,
            FaultKind::Mismatch => self.mismatch,
            FaultKind::NegativeDuration => self.negative_duration,
        }
    }
}

/// Lock-free fault counters plus a bounded log of recent faults
#[derive(Debug)]
pub struct FaultLog {
    counts: [AtomicU64; 3],
    recent: ArrayQueue<FaultRecord>,
}

impl FaultLog {
    /// Create a log keeping at most `capacity` recent records
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0. [`crate::config::TracerConfig::validate`]
    /// rejects that value before a log is ever built.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Fault log capacity must be > 0");
        Self {
            counts: Default::default(),
            recent: ArrayQueue::new(capacity),
        }
    }

    /// Count and log a fault
    pub fn report(&self, record: FaultRecord) {
        let previous = self.counts[record.kind.index()].fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            tracing::warn!(
                kind = %record.kind,
                thread = %record.thread,
                function = %record.function,
                "call tracing consistency fault; frame discarded"
            );
        } else {
            tracing::debug!(
                kind = %record.kind,
                thread = %record.thread,
                function = %record.function,
                "call tracing consistency fault"
            );
        }
        self.recent.force_push(record);
    }

    pub fn counts(&self) -> FaultCounts {
        FaultCounts {
            empty_stack: self.count(FaultKind::EmptyStack),
            mismatch: self.count(FaultKind::Mismatch),
            negative_duration: self.count(FaultKind::NegativeDuration),
        }
    }

    pub fn count(&self, kind: FaultKind) -> u64 {
        self.counts[kind.index()].load(Ordering::Relaxed)
    }

    /// Remove and return the logged records, oldest first
    pub fn drain(&self) -> Vec<FaultRecord> {
        let mut records = Vec::with_capacity(self.recent.len());
        while let Some(record) = self.recent.pop() {
            records.push(record);
        }
        records
    }

    /// Zero the counters and empty the log
    pub fn clear(&self) {
        for counter in &self.counts {
            counter.store(0, Ordering::Relaxed);
        }
        while self.recent.pop().is_some() {}
    }
}
