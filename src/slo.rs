//! C12 — SLO gate evaluator.
//!
//! Computes p95 latencies and correctness ratios over a batch of per-turn
//! metrics and reports a pass/fail gate with a structured violation list
//! (spec §4.12).

use crate::config::SloThresholds;

/// One turn's worth of metrics, as assembled by the session orchestrator
/// from the arbiter's lifecycle events and the recorder's baseline entry
/// (spec §4.12 `TurnMetrics`).
#[derive(Clone, Debug)]
pub struct TurnMetrics {
    pub accepted: bool,
    pub happy_path: bool,
    pub turn_open_proposed_ms: Option<u64>,
    pub turn_open_ms: Option<u64>,
    pub first_output_ms: Option<u64>,
    pub cancel_accepted_ms: Option<u64>,
    pub cancel_fence_applied_ms: Option<u64>,
    pub baseline_complete: bool,
    pub accepted_stale_epoch_output: bool,
    /// The turn's terminal lifecycle sequence, e.g. `["turn_open", "abort",
    /// "close"]`, used to check terminal correctness.
    pub terminal_events: Vec<String>,
}

/// One threshold breach surfaced by [`evaluate_slo_gate`].
#[derive(Clone, Debug, PartialEq)]
pub enum SloViolation {
    TurnOpenP95 { observed_ms: u64, threshold_ms: u64 },
    FirstOutputP95 { observed_ms: u64, threshold_ms: u64 },
    CancelFenceP95 { observed_ms: u64, threshold_ms: u64 },
    BaselineCompleteness { observed: f64, threshold: f64 },
    TerminalCorrectness { observed: f64, threshold: f64 },
    StaleAcceptedOutput { count: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SloGateResult {
    pub passed: bool,
    pub violations: Vec<SloViolation>,
    pub turn_open_p95_ms: Option<u64>,
    pub first_output_p95_ms: Option<u64>,
    pub cancel_fence_p95_ms: Option<u64>,
    pub baseline_completeness_ratio: f64,
    pub terminal_correctness_ratio: f64,
    pub stale_accepted_output_count: usize,
}

/// Nearest-rank p95 over a batch of non-negative sample deltas. Returns
/// `None` for an empty sample set (no SLO claim can be made with no data).
fn p95(mut samples: Vec<u64>) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let rank = ((samples.len() as f64) * 0.95).ceil() as usize;
    let idx = rank.saturating_sub(1).min(samples.len() - 1);
    Some(samples[idx])
}

fn is_terminal_correct(events: &[String]) -> bool {
    if events.is_empty() {
        return false;
    }
    if events.last().map(String::as_str) != Some("close") {
        return false;
    }
    let terminals: Vec<&String> = events
        .iter()
        .filter(|e| e.as_str() == "commit" || e.as_str() == "abort")
        .collect();
    terminals.len() == 1
}

/// Computes p95s and correctness ratios over `turns` and gates them against
/// `thresholds` (spec §4.12).
pub fn evaluate_slo_gate(turns: &[TurnMetrics], thresholds: &SloThresholds) -> SloGateResult {
    let turn_open_samples: Vec<u64> = turns
        .iter()
        .filter_map(|t| match (t.turn_open_proposed_ms, t.turn_open_ms) {
            (Some(proposed), Some(opened)) if opened >= proposed => Some(opened - proposed),
            _ => None,
        })
        .collect();
    let first_output_samples: Vec<u64> = turns
        .iter()
        .filter_map(|t| match (t.turn_open_ms, t.first_output_ms) {
            (Some(opened), Some(first)) if first >= opened => Some(first - opened),
            _ => None,
        })
        .collect();
    let cancel_fence_samples: Vec<u64> = turns
        .iter()
        .filter_map(|t| match (t.cancel_accepted_ms, t.cancel_fence_applied_ms) {
            (Some(accepted), Some(applied)) if applied >= accepted => Some(applied - accepted),
            _ => None,
        })
        .collect();

    let turn_open_p95 = p95(turn_open_samples);
    let first_output_p95 = p95(first_output_samples);
    let cancel_fence_p95 = p95(cancel_fence_samples);

    let accepted_turns: Vec<&TurnMetrics> = turns.iter().filter(|t| t.accepted).collect();
    let baseline_completeness_ratio = if accepted_turns.is_empty() {
        1.0
    } else {
        accepted_turns.iter().filter(|t| t.baseline_complete).count() as f64 / accepted_turns.len() as f64
    };

    let terminal_correctness_ratio = if turns.is_empty() {
        1.0
    } else {
        turns.iter().filter(|t| is_terminal_correct(&t.terminal_events)).count() as f64 / turns.len() as f64
    };

    let stale_accepted_output_count = turns.iter().filter(|t| t.accepted_stale_epoch_output).count();

    let mut violations = Vec::new();
    if let Some(observed) = turn_open_p95 {
        if observed > thresholds.turn_open_p95_ms {
            violations.push(SloViolation::TurnOpenP95 {
                observed_ms: observed,
                threshold_ms: thresholds.turn_open_p95_ms,
            });
        }
    }
    if let Some(observed) = first_output_p95 {
        if observed > thresholds.first_output_p95_ms {
            violations.push(SloViolation::FirstOutputP95 {
                observed_ms: observed,
                threshold_ms: thresholds.first_output_p95_ms,
            });
        }
    }
    if let Some(observed) = cancel_fence_p95 {
        if observed > thresholds.cancel_fence_p95_ms {
            violations.push(SloViolation::CancelFenceP95 {
                observed_ms: observed,
                threshold_ms: thresholds.cancel_fence_p95_ms,
            });
        }
    }
    if baseline_completeness_ratio < thresholds.baseline_completeness_min {
        violations.push(SloViolation::BaselineCompleteness {
            observed: baseline_completeness_ratio,
            threshold: thresholds.baseline_completeness_min,
        });
    }
    if terminal_correctness_ratio < thresholds.terminal_correctness_min {
        violations.push(SloViolation::TerminalCorrectness {
            observed: terminal_correctness_ratio,
            threshold: thresholds.terminal_correctness_min,
        });
    }
    if stale_accepted_output_count > 0 {
        violations.push(SloViolation::StaleAcceptedOutput {
            count: stale_accepted_output_count,
        });
    }

    SloGateResult {
        passed: violations.is_empty(),
        violations,
        turn_open_p95_ms: turn_open_p95,
        first_output_p95_ms: first_output_p95,
        cancel_fence_p95_ms: cancel_fence_p95,
        baseline_completeness_ratio,
        terminal_correctness_ratio,
        stale_accepted_output_count,
    }
}
