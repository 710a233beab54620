//! Monotonic time primitives.
//!
//! The kernel never reads the wall clock directly for ordering or deadline
//! decisions — every component accepts a [`MonotonicTimePoint`] supplied by
//! the caller (transport events already carry `runtime_ts_ms`/`wall_ms`) or
//! obtained from an injected [`Clock`]. This keeps replay deterministic: a
//! replayed trace can be driven entirely from recorded timestamps without a
//! real clock in the loop.

use std::sync::Arc;
use std::time::Duration;

/// A single monotonic instant, expressed as milliseconds since an
/// unspecified epoch chosen by the clock implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonotonicTimePoint(u64);

impl MonotonicTimePoint {
    pub const ZERO: MonotonicTimePoint = MonotonicTimePoint(0);

    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn saturating_sub(&self, other: MonotonicTimePoint) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

/// Source of monotonic time points, injected so that tests and replay can
/// supply a deterministic sequence instead of `Instant::now()`.
pub trait Clock: Send + Sync {
    fn now(&self) -> MonotonicTimePoint;
}

/// Wall-clock backed [`Clock`], anchored at construction time.
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonotonicTimePoint {
        MonotonicTimePoint::from_millis(self.origin.elapsed().as_millis() as u64)
    }
}

/// Deterministic clock for tests and replay: advances only when told to.
pub struct ManualClock {
    now: std::sync::atomic::AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(start_ms),
        }
    }

    pub fn shared(start_ms: u64) -> Arc<Self> {
        Arc::new(Self::new(start_ms))
    }

    pub fn advance(&self, d: Duration) {
        self.now
            .fetch_add(d.as_millis() as u64, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonotonicTimePoint {
        MonotonicTimePoint::from_millis(self.now.load(std::sync::atomic::Ordering::SeqCst))
    }
}
