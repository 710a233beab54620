//! Cross-cutting call-scoped primitives: cancellation, deadlines, and the
//! [`CallContext`] that threads them through every component.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::ids::CorrelationId;
use crate::time::MonotonicTimePoint;

/// Cooperative cancellation token. Cancellation is latched: once set, it
/// stays set, and `cancel()` reports whether this call was the one that
/// first flipped it (first-writer-wins, matching the cancel fence's
/// at-most-once semantics in C8).
#[derive(Clone, Debug)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns `true` if this call transitioned the token from uncancelled
    /// to cancelled; `false` if it was already cancelled.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn child(&self) -> Self {
        self.clone()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute deadline expressed against the same monotonic clock as the
/// caller. `Deadline::none()` means "no caller-imposed timeout" — per-attempt
/// and per-invocation deadlines (spec §5) are layered on top by the provider
/// invocation controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<MonotonicTimePoint>,
}

impl Deadline {
    pub const fn none() -> Self {
        Self { instant: None }
    }

    pub fn at(instant: MonotonicTimePoint) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    pub fn with_timeout(now: MonotonicTimePoint, timeout: Duration) -> Self {
        Self::at(now.saturating_add(timeout))
    }

    pub fn instant(&self) -> Option<MonotonicTimePoint> {
        self.instant
    }

    pub fn is_expired(&self, now: MonotonicTimePoint) -> bool {
        match self.instant {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::none()
    }
}

struct CallContextInner {
    cancellation: Cancellation,
    deadline: Deadline,
    correlation: Option<CorrelationId>,
}

/// Call-scoped context threaded through guard/bundle/plan/provider/streaming
/// operations. Cheap to clone (`Arc`-backed); components read it for
/// cancellation and deadline checks without owning the cancellation source.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<CallContextInner>,
}

impl CallContext {
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.inner.cancellation
    }

    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    pub fn correlation(&self) -> Option<&CorrelationId> {
        self.inner.correlation.as_ref()
    }
}

#[derive(Default)]
pub struct CallContextBuilder {
    cancellation: Option<Cancellation>,
    deadline: Deadline,
    correlation: Option<CorrelationId>,
}

impl CallContextBuilder {
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationId) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn build(self) -> CallContext {
        CallContext {
            inner: Arc::new(CallContextInner {
                cancellation: self.cancellation.unwrap_or_default(),
                deadline: self.deadline,
                correlation: self.correlation,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_first_writer_wins() {
        let c = Cancellation::new();
        assert!(c.cancel());
        assert!(!c.cancel());
        assert!(c.is_cancelled());
    }

    #[test]
    fn deadline_expiry() {
        let now = MonotonicTimePoint::from_millis(100);
        let d = Deadline::with_timeout(now, Duration::from_millis(50));
        assert!(!d.is_expired(MonotonicTimePoint::from_millis(140)));
        assert!(d.is_expired(MonotonicTimePoint::from_millis(150)));
    }
}
