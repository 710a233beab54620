//! C3 — Authority/admission guard.
//!
//! Evaluates pre-turn gating in a fixed check order (spec §4.3): snapshot
//! validity, authority epoch, authorization, then the admission backend.
//! Every branch produces a [`GuardDecision`] carrying a
//! [`crate::arbiter::DecisionOutcome`] — pre-turn rejections never raise a
//! [`crate::error::CoreError`] and never emit a lifecycle event.

use crate::arbiter::{DecisionOutcome, DecisionPhase, DecisionScope, OutcomeKind};
use crate::config::PlanFailurePolicy;
use crate::control_plane::backends::AdmissionOutcome;
use crate::ids::EventId;
use crate::time::MonotonicTimePoint;

/// Inputs the caller (the turn arbiter, C5) gathers before invoking the
/// guard for one `turn_open_proposed` event.
#[derive(Clone, Debug)]
pub struct PreTurnInput {
    pub event_id: EventId,
    pub runtime_ts_ms: MonotonicTimePoint,
    pub wall_ms: MonotonicTimePoint,
    pub snapshot_valid: bool,
    pub authority_epoch_valid: bool,
    pub authority_authorized: bool,
    pub authority_epoch: u64,
    pub admission: AdmissionOutcome,
}

/// The guard's verdict: either the turn may proceed to bundle resolution, or
/// pre-turn gating already produced a terminal (for this proposal)
/// [`DecisionOutcome`].
#[derive(Clone, Debug)]
pub enum GuardDecision {
    Proceed,
    Decided(DecisionOutcome),
}

const EMITTED_BY_SNAPSHOT_GATE: &str = "guard.snapshot";
const EMITTED_BY_AUTHORITY_MODULE: &str = "session.authority";
const EMITTED_BY_AUTHORIZATION_GATE: &str = "guard.authorization";
const EMITTED_BY_ADMISSION_BACKEND: &str = "guard.admission";

/// Evaluates the fixed-order pre-turn checks (spec §4.3).
///
/// 1. `snapshot_valid == false` → `Defer` or `Reject` per `plan_failure_policy`.
/// 2. `authority_epoch_valid == false` → `StaleEpochReject`.
/// 3. `authority_authorized == false` → `Deauthorized` (`deauthorized_drain`).
/// 4. Otherwise, the admission backend's outcome is surfaced as-is.
pub fn evaluate(input: &PreTurnInput, plan_failure_policy: PlanFailurePolicy) -> GuardDecision {
    if !input.snapshot_valid {
        let kind = match plan_failure_policy {
            PlanFailurePolicy::Defer => OutcomeKind::Defer,
            PlanFailurePolicy::Reject => OutcomeKind::Reject,
        };
        return GuardDecision::Decided(DecisionOutcome {
            outcome_kind: kind,
            phase: DecisionPhase::PreTurn,
            scope: DecisionScope::Turn,
            event_id: input.event_id.clone(),
            runtime_ts_ms: input.runtime_ts_ms,
            wall_ms: input.wall_ms,
            emitted_by: EMITTED_BY_SNAPSHOT_GATE.to_string(),
            reason: "snapshot invalid at turn-open".to_string(),
            authority_epoch: Some(input.authority_epoch),
        });
    }

    if !input.authority_epoch_valid {
        return GuardDecision::Decided(DecisionOutcome {
            outcome_kind: OutcomeKind::StaleEpochReject,
            phase: DecisionPhase::PreTurn,
            scope: DecisionScope::Turn,
            event_id: input.event_id.clone(),
            runtime_ts_ms: input.runtime_ts_ms,
            wall_ms: input.wall_ms,
            emitted_by: EMITTED_BY_AUTHORITY_MODULE.to_string(),
            reason: "authority epoch below session's current epoch".to_string(),
            authority_epoch: Some(input.authority_epoch),
        });
    }

    if !input.authority_authorized {
        return GuardDecision::Decided(DecisionOutcome {
            outcome_kind: OutcomeKind::Deauthorized,
            phase: DecisionPhase::PreTurn,
            scope: DecisionScope::Turn,
            event_id: input.event_id.clone(),
            runtime_ts_ms: input.runtime_ts_ms,
            wall_ms: input.wall_ms,
            emitted_by: EMITTED_BY_AUTHORIZATION_GATE.to_string(),
            reason: "deauthorized_drain".to_string(),
            authority_epoch: Some(input.authority_epoch),
        });
    }

    let kind = match input.admission {
        AdmissionOutcome::Admit => OutcomeKind::Admit,
        AdmissionOutcome::Defer => OutcomeKind::Defer,
        AdmissionOutcome::Reject => OutcomeKind::Reject,
        AdmissionOutcome::Shed => OutcomeKind::Shed,
    };
    if kind == OutcomeKind::Admit {
        return GuardDecision::Proceed;
    }
    GuardDecision::Decided(DecisionOutcome {
        outcome_kind: kind,
        phase: DecisionPhase::PreTurn,
        scope: DecisionScope::Turn,
        event_id: input.event_id.clone(),
        runtime_ts_ms: input.runtime_ts_ms,
        wall_ms: input.wall_ms,
        emitted_by: EMITTED_BY_ADMISSION_BACKEND.to_string(),
        reason: "admission backend declined turn".to_string(),
        authority_epoch: Some(input.authority_epoch),
    })
}
