//! latencywatch - lightweight call-stack latency tracer
//!
//! Hooks into a program's call-enter/call-exit events, measures the wall-clock
//! duration of each call on a per-thread stack, and aggregates per-function
//! call count, total time, self time and maximum latency into a process-wide
//! table that can be snapshotted at any time.
//!
//! ```
//! use latencywatch::config::TracerConfig;
//! use latencywatch::hook::Tracer;
//! use latencywatch::identity::{FunctionId, ThreadKey};
//!
//! let tracer = Tracer::new(TracerConfig::default().enabled()).unwrap();
//! let thread = ThreadKey::from_raw(1);
//! let handler = FunctionId::new("server::handle", "src/server.rs", 12);
//!
//! tracer.notify_call_enter(thread, handler.clone());
//! tracer.notify_call_exit(thread, &handler);
//!
//! assert_eq!(tracer.snapshot().get(&handler).unwrap().calls, 1);
//! ```

pub mod aggregator;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod fault;
pub mod global;
pub mod hook;
pub mod identity;
pub mod report;
pub mod stack;
pub mod workload;

pub use error::{Result, TracerError};
pub use hook::{CallGuard, ExitOutcome, Snapshot, Tracer};
pub use identity::{FunctionId, ThreadKey};
