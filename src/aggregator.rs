//! Per-function duration aggregation
//!
//! The process-wide table every thread records into. The map sits behind a
//! `RwLock` that is only write-locked to insert a function seen for the first
//! time, to reset, or to fence a lifecycle change. Each record has its own
//! cache-padded mutex, so two threads finishing calls to different functions
//! never touch the same cache line, and a record's four fields always change
//! together.

use crate::identity::FunctionId;
use crate::stack::CompletedCall;
use crossbeam::utils::CachePadded;
use fnv::FnvHashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

/// Timing statistics for a single function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateRecord {
    /// Number of completed activations
    pub calls: u64,
    /// Sum of enter-to-exit wall time, callees included
    pub total_time: Duration,
    /// Sum of time not spent in callees
    pub self_time: Duration,
    /// Slowest single activation
    pub max_time: Duration,
}

impl AggregateRecord {
    fn add(&mut self, elapsed: Duration, self_time: Duration) {
        self.calls += 1;
        self.total_time += elapsed;
        self.self_time += self_time;
        self.max_time = self.max_time.max(elapsed);
    }

    /// Mean latency per call
    pub fn avg_time(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        // Division on nanoseconds keeps sub-microsecond precision
        Duration::from_nanos((self.total_time.as_nanos() / u128::from(self.calls)) as u64)
    }
}

/// Immutable point-in-time copy of the aggregate table
pub type AggregateTable = HashMap<FunctionId, AggregateRecord>;

type Cell = CachePadded<Mutex<AggregateRecord>>;

/// Thread-safe table of per-function statistics
#[derive(Debug, Default)]
pub struct DurationAggregator {
    table: RwLock<FnvHashMap<FunctionId, Cell>>,
}

impl DurationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a completed call to its function's record
    pub fn record(&self, call: &CompletedCall) {
        self.record_gated(call, || true);
    }

    /// Run `f` under the table read lock
    ///
    /// Like a gated record, `f` cannot interleave with
    /// [`DurationAggregator::exclusive`].
    pub fn shared<R>(&self, f: impl FnOnce() -> R) -> R {
        let _table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Add a completed call if `gate` holds while the table is read-locked
    ///
    /// [`DurationAggregator::exclusive`] cannot run between the gate check and
    /// the update, which is what makes a lifecycle change atomic with respect
    /// to recording. Returns whether the call was recorded.
    pub fn record_gated(&self, call: &CompletedCall, gate: impl Fn() -> bool) -> bool {
        {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            if !gate() {
                return false;
            }
            if let Some(cell) = table.get(&call.function) {
                cell.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .add(call.elapsed, call.self_time);
                return true;
            }
        }

        // First sighting of this function
        let mut table = self.write();
        if !gate() {
            return false;
        }
        table
            .entry(call.function.clone())
            .or_default()
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .add(call.elapsed, call.self_time);
        true
    }

    /// Run `f` while no record can be added
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _table = self.write();
        f()
    }

    /// Copy every record
    ///
    /// Only the table read lock is held, so threads recording into existing
    /// functions keep going; each record is copied under its own lock and is
    /// therefore never observed mid-update.
    pub fn snapshot(&self) -> AggregateTable {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .iter()
            .map(|(function, cell)| {
                let record = *cell.lock().unwrap_or_else(PoisonError::into_inner);
                (function.clone(), record)
            })
            .collect()
    }

    /// Current record for `function`, if it has completed at least once
    pub fn get(&self, function: &FunctionId) -> Option<AggregateRecord> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get(function)
            .map(|cell| *cell.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Clear all records
    pub fn reset(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> RwLockWriteGuard<'_, FnvHashMap<FunctionId, Cell>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}
