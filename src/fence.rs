//! C8 — Output cancellation fence.
//!
//! A per-turn single-writer barrier: once `cancel_accepted` is observed, it
//! is latched, and every subsequent output attempt — even one that arrived
//! with an earlier `transport_sequence` — is rejected with
//! `playback_cancelled` (spec §4.8 / invariant 6 / testable property 5).

use std::sync::atomic::{AtomicBool, Ordering};

use crate::event::ControlSignalKind;

/// One output attempt's input to the fence.
#[derive(Clone, Copy, Debug)]
pub struct OutputAttempt {
    pub cancel_accepted: bool,
    pub transport_sequence: u64,
}

/// The fence's verdict for one output attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceDecision {
    pub accepted: bool,
    pub signal: ControlSignalKind,
}

/// Single-writer, per-turn cancellation latch.
pub struct CancellationFence {
    latched: AtomicBool,
}

impl CancellationFence {
    pub fn new() -> Self {
        Self {
            latched: AtomicBool::new(false),
        }
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// Evaluates one output attempt (spec §4.8). Latching happens before any
    /// further output path is consulted, so a concurrent attempt observed
    /// after this call returns is guaranteed to see the latch.
    pub fn evaluate_output(&self, attempt: OutputAttempt) -> FenceDecision {
        if attempt.cancel_accepted {
            self.latched.store(true, Ordering::Release);
        }
        if self.latched.load(Ordering::Acquire) {
            return FenceDecision {
                accepted: false,
                signal: ControlSignalKind::PlaybackCancelled,
            };
        }
        FenceDecision {
            accepted: true,
            signal: ControlSignalKind::OutputAccepted,
        }
    }
}

impl Default for CancellationFence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_cancel_fence_rejects_late_output() {
        let fence = CancellationFence::new();

        let accepted = fence.evaluate_output(OutputAttempt {
            cancel_accepted: false,
            transport_sequence: 1,
        });
        assert!(accepted.accepted);

        let cancel = fence.evaluate_output(OutputAttempt {
            cancel_accepted: true,
            transport_sequence: 2,
        });
        assert!(!cancel.accepted);
        assert_eq!(cancel.signal, ControlSignalKind::PlaybackCancelled);

        let late = fence.evaluate_output(OutputAttempt {
            cancel_accepted: false,
            transport_sequence: 0,
        });
        assert!(!late.accepted);
        assert_eq!(late.signal, ControlSignalKind::PlaybackCancelled);
    }

    #[test]
    fn property_5_all_subsequent_outputs_rejected_after_cancel() {
        let fence = CancellationFence::new();
        fence.evaluate_output(OutputAttempt {
            cancel_accepted: true,
            transport_sequence: 5,
        });
        for seq in 0..10 {
            let decision = fence.evaluate_output(OutputAttempt {
                cancel_accepted: false,
                transport_sequence: seq,
            });
            assert!(!decision.accepted);
        }
    }
}
