//! Clock source for call timing
//!
//! Every frame is stamped with a [`Timestamp`] from a [`Clock`]. The default
//! [`MonotonicClock`] is anchored on [`Instant`], so NTP slews and manual
//! changes to the system clock never reach duration math. There is no
//! fallback to wall-clock time: if the monotonic source misbehaves during the
//! startup probe, construction fails and the tracer is never built.
//!
//! [`ManualClock`] is advanced explicitly. It drives replays of recorded event
//! streams and keeps timing assertions in tests exact.

use crate::error::{Result, TracerError};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Nanoseconds elapsed since the origin of the clock that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Timestamp at the clock origin
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time from `earlier` to `self`, or `None` if `earlier` is later
    pub fn checked_duration_since(self, earlier: Timestamp) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_nanos)
    }
}

/// Source of monotonic timestamps
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time; never smaller than a previous reading
    fn now(&self) -> Timestamp;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Monotonic clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Anchor a new clock at the current instant
    ///
    /// # Errors
    ///
    /// Returns [`TracerError::ClockUnavailable`] if two consecutive readings
    /// go backwards.
    pub fn new() -> Result<Self> {
        let origin = Instant::now();
        let probe = Instant::now();
        if probe.checked_duration_since(origin).is_none() {
            return Err(TracerError::ClockUnavailable(
                "Instant went backwards during startup probe".to_string(),
            ));
        }
        tracing::debug!("monotonic clock anchored");
        Ok(Self { origin })
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Timestamp {
        // u64 nanoseconds cover ~584 years of uptime
        Timestamp(self.origin.elapsed().as_nanos() as u64)
    }
}

/// Explicitly driven clock
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute reading
    ///
    /// Setting an earlier value simulates a clock anomaly; the tracer clamps
    /// the resulting negative durations to zero and reports a fault.
    pub fn set(&self, at: Timestamp) {
        self.nanos.store(at.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::SeqCst))
    }
}
