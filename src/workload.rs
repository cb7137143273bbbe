//! Built-in workloads for the `latencywatch` binary
//!
//! Small programs instrumented with [`crate::trace_scope!`] so the tracer can
//! be demonstrated (and smoke-tested end to end) without a host runtime.

use crate::trace_scope;
use clap::ValueEnum;
use std::thread;
use std::time::Duration;

/// Workload selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Naive recursive Fibonacci
    Fib,
    /// A caller that sleeps around one sleeping callee
    Nested,
    /// Several threads calling the same function concurrently
    Threads,
}

/// Parameters shared by all workloads
#[derive(Debug, Clone, Copy)]
pub struct WorkloadParams {
    /// Fibonacci argument, or calls per thread
    pub size: u64,
    /// Thread count for [`Workload::Threads`]
    pub threads: usize,
    /// Sleep unit for [`Workload::Nested`]
    pub unit: Duration,
}

impl Default for WorkloadParams {
    fn default() -> Self {
        Self {
            size: 15,
            threads: 4,
            unit: Duration::from_millis(5),
        }
    }
}

/// Run `workload` against the global tracer
pub fn run(workload: Workload, params: WorkloadParams) {
    tracing::debug!(?workload, ?params, "running workload");
    match workload {
        Workload::Fib => {
            let value = fib(params.size);
            tracing::debug!(n = params.size, value, "fib finished");
        }
        Workload::Nested => outer(params.unit),
        Workload::Threads => run_threads(params.threads, params.size),
    }
}

/// Naive recursive Fibonacci; fib(n) makes 2*fib(n+1)-1 activations
pub fn fib(n: u64) -> u64 {
    trace_scope!("fib");
    if n < 2 {
        n
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

fn outer(unit: Duration) {
    trace_scope!("outer");
    thread::sleep(unit);
    inner(unit * 2);
    thread::sleep(unit);
}

fn inner(duration: Duration) {
    trace_scope!("inner");
    thread::sleep(duration);
}

fn worker_step(i: u64) -> u64 {
    trace_scope!("worker_step");
    (0..=i % 64).sum()
}

fn run_threads(threads: usize, calls: u64) {
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            thread::spawn(move || {
                let mut acc = 0u64;
                for i in 0..calls {
                    acc = acc.wrapping_add(worker_step(i));
                }
                acc
            })
        })
        .collect();
    for handle in handles {
        if handle.join().is_err() {
            tracing::warn!("workload thread panicked");
        }
    }
}
