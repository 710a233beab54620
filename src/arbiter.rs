//! C5 — Turn arbiter.
//!
//! Drives one turn through `Idle -> Active -> Closed` with deterministic,
//! exactly-once terminalization (spec §4.5). The arbiter owns the turn for
//! its full lifetime (spec §5: "a turn's arbiter, fence, and recorder are
//! owned by a single scheduler worker"); cross-turn concerns live in the
//! session orchestrator (C13).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::control_plane::backends::{AdmissionOutcome, ControlPlaneBackends};
use crate::control_plane::bundle::{resolve_turn_start_bundle, BundleResolutionFailure};
use crate::error::{CoreError, ErrorKind, codes};
use crate::event::ControlSignalKind;
use crate::guard::{self, GuardDecision, PreTurnInput};
use crate::ids::{EventId, SessionId, TurnId};
use crate::plan::{resolve_turn_plan, ResolvedTurnPlan};
use crate::recorder::{
    BaselineEvidence, BaselineRecorder, RedactionDecision, TerminalOutcome, TimingMarkers,
};
use crate::config::{KernelConfig, PlanFailurePolicy};
use crate::time::MonotonicTimePoint;

/// The closed set of pre-turn/in-turn decision kinds (spec §3 `DecisionOutcome`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeKind {
    Admit,
    Defer,
    Reject,
    StaleEpochReject,
    Deauthorized,
    Shed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Admit => "admit",
            OutcomeKind::Defer => "defer",
            OutcomeKind::Reject => "reject",
            OutcomeKind::StaleEpochReject => "stale_epoch_reject",
            OutcomeKind::Deauthorized => "deauthorized",
            OutcomeKind::Shed => "shed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionPhase {
    PreTurn,
    InTurn,
}

impl DecisionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionPhase::PreTurn => "pre_turn",
            DecisionPhase::InTurn => "in_turn",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionScope {
    Session,
    Turn,
}

impl DecisionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionScope::Session => "session",
            DecisionScope::Turn => "turn",
        }
    }
}

/// A single decision surfaced by the guard, admission, arbiter, or
/// scheduler (spec §3 `DecisionOutcome`).
#[derive(Clone, Debug)]
pub struct DecisionOutcome {
    pub outcome_kind: OutcomeKind,
    pub phase: DecisionPhase,
    pub scope: DecisionScope,
    pub event_id: EventId,
    pub runtime_ts_ms: MonotonicTimePoint,
    pub wall_ms: MonotonicTimePoint,
    pub emitted_by: String,
    pub reason: String,
    pub authority_epoch: Option<u64>,
}

/// The closed set of turn lifecycle events (spec §4.5): `turn_open`,
/// `abort(reason)`, `close`.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    TurnOpen,
    Abort { reason: String },
    Commit,
    Close,
}

/// A turn's state, matching spec §3: `Idle` (initial) -> `Active` -> `Closed`
/// (terminal, immutable thereafter).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Active,
    Closed,
}

/// Input to [`TurnArbiter::handle_turn_open_proposed`]: the pre-turn guard
/// facts plus the requested pipeline version for bundle resolution.
#[derive(Clone, Debug)]
pub struct TurnOpenProposed {
    pub event_id: EventId,
    pub runtime_sequence: u64,
    pub runtime_ts_ms: MonotonicTimePoint,
    pub wall_ms: MonotonicTimePoint,
    pub snapshot_valid: bool,
    pub authority_epoch_valid: bool,
    pub authority_authorized: bool,
    pub authority_epoch: u64,
    pub admission: AdmissionOutcome,
    pub requested_pipeline_version: Option<String>,
}

/// Input to [`TurnArbiter::handle_active`]: the in-turn facts the session
/// orchestrator has gathered since the turn opened (spec §4.5).
#[derive(Clone, Debug, Default)]
pub struct ActiveInput {
    pub cancel_accepted: bool,
    pub cancel_accepted_at_ms: Option<u64>,
    pub authority_revoked: bool,
    pub terminal_success_ready: bool,
    pub runtime_ts_ms: u64,
    pub invocation_outcomes: Vec<crate::recorder::InvocationOutcome>,
    pub first_output_ms: Option<u64>,
}

/// What [`TurnArbiter::handle_active`] produced: the state transition (if
/// any), the lifecycle events emitted in order, and any control signals
/// (e.g. `deauthorized_drain`) raised alongside them.
#[derive(Clone, Debug)]
pub struct ActiveResult {
    pub lifecycle_events: Vec<LifecycleEvent>,
    pub control_signals: Vec<ControlSignalKind>,
    pub new_state: TurnState,
}

struct ArbiterState {
    turn_state: TurnState,
    plan: Option<ResolvedTurnPlan>,
    authority_epoch_at_open: Option<u64>,
    decision_outcomes: Vec<DecisionOutcome>,
    turn_open_proposed_ms: Option<u64>,
    turn_open_ms: Option<u64>,
    terminal_emitted: bool,
}

/// C5's state machine for a single turn. Owned exclusively by the worker
/// driving that turn (spec §5); never shared across turns.
pub struct TurnArbiter {
    session_id: SessionId,
    turn_id: TurnId,
    config: Arc<KernelConfig>,
    recorder: Arc<BaselineRecorder>,
    state: Mutex<ArbiterState>,
}

impl TurnArbiter {
    pub fn new(
        session_id: SessionId,
        turn_id: TurnId,
        config: Arc<KernelConfig>,
        recorder: Arc<BaselineRecorder>,
    ) -> Self {
        Self {
            session_id,
            turn_id,
            config,
            recorder,
            state: Mutex::new(ArbiterState {
                turn_state: TurnState::Idle,
                plan: None,
                authority_epoch_at_open: None,
                decision_outcomes: Vec::new(),
                turn_open_proposed_ms: None,
                turn_open_ms: None,
                terminal_emitted: false,
            }),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state.lock().turn_state
    }

    pub fn resolved_plan(&self) -> Option<ResolvedTurnPlan> {
        self.state.lock().plan.clone()
    }

    /// Runs the guard (C3), bundle resolver (C2), and plan resolver (C4) in
    /// that fixed order for one `turn_open_proposed` event (spec §4.5:
    /// "Idle only"). On `Admit` the turn transitions to `Active` and emits
    /// `turn_open`; any other outcome leaves the turn in `Idle` with no
    /// lifecycle events.
    pub async fn handle_turn_open_proposed(
        &self,
        backends: &ControlPlaneBackends,
        input: TurnOpenProposed,
    ) -> Result<(Option<LifecycleEvent>, DecisionOutcome), CoreError> {
        {
            let mut state = self.state.lock();
            if state.turn_state != TurnState::Idle {
                return Err(CoreError::new(
                    ErrorKind::InvalidInput,
                    codes::NOT_IDLE,
                    "turn_open_proposed may only be handled while the turn is Idle",
                ));
            }
            state.turn_open_proposed_ms = Some(input.runtime_ts_ms.as_millis());
        }

        let pre_turn = PreTurnInput {
            event_id: input.event_id.clone(),
            runtime_ts_ms: input.runtime_ts_ms,
            wall_ms: input.wall_ms,
            snapshot_valid: input.snapshot_valid,
            authority_epoch_valid: input.authority_epoch_valid,
            authority_authorized: input.authority_authorized,
            authority_epoch: input.authority_epoch,
            admission: input.admission,
        };

        match guard::evaluate(&pre_turn, self.config.plan_failure_policy) {
            GuardDecision::Decided(decision) => {
                self.state.lock().decision_outcomes.push(decision.clone());
                return Ok((None, decision));
            }
            GuardDecision::Proceed => {}
        }

        let bundle = match resolve_turn_start_bundle(
            backends,
            &self.session_id,
            input.requested_pipeline_version.clone(),
        )
        .await
        {
            Ok(bundle) => bundle,
            Err(failure) => {
                let kind = match failure {
                    BundleResolutionFailure::StaleSnapshot => OutcomeKind::Defer,
                    BundleResolutionFailure::ResolutionFailed(_) => match self.config.plan_failure_policy {
                        PlanFailurePolicy::Defer => OutcomeKind::Defer,
                        PlanFailurePolicy::Reject => OutcomeKind::Reject,
                    },
                };
                let decision = DecisionOutcome {
                    outcome_kind: kind,
                    phase: DecisionPhase::PreTurn,
                    scope: DecisionScope::Turn,
                    event_id: input.event_id.clone(),
                    runtime_ts_ms: input.runtime_ts_ms,
                    wall_ms: input.wall_ms,
                    emitted_by: "control_plane.bundle_resolver".to_string(),
                    reason: "turn start bundle resolution failed".to_string(),
                    authority_epoch: Some(input.authority_epoch),
                };
                self.state.lock().decision_outcomes.push(decision.clone());
                return Ok((None, decision));
            }
        };

        let plan = resolve_turn_plan(&bundle, &self.turn_id, input.runtime_sequence, Vec::new())?;

        let admit_decision = DecisionOutcome {
            outcome_kind: OutcomeKind::Admit,
            phase: DecisionPhase::PreTurn,
            scope: DecisionScope::Turn,
            event_id: input.event_id.clone(),
            runtime_ts_ms: input.runtime_ts_ms,
            wall_ms: input.wall_ms,
            emitted_by: "arbiter".to_string(),
            reason: "turn admitted".to_string(),
            authority_epoch: Some(input.authority_epoch),
        };

        {
            let mut state = self.state.lock();
            state.turn_state = TurnState::Active;
            state.plan = Some(plan);
            state.authority_epoch_at_open = Some(input.authority_epoch);
            state.turn_open_ms = Some(input.runtime_ts_ms.as_millis());
            state.decision_outcomes.push(admit_decision.clone());
        }

        Ok((Some(LifecycleEvent::TurnOpen), admit_decision))
    }

    /// Evaluates one in-turn tick (spec §4.5: "Active only"). A `Closed`
    /// turn rejects further calls with `TerminalAlreadyEmitted`
    /// (exactly-once terminalization).
    pub fn handle_active(&self, input: ActiveInput) -> Result<ActiveResult, CoreError> {
        let mut state = self.state.lock();
        match state.turn_state {
            TurnState::Idle => {
                return Err(CoreError::new(
                    ErrorKind::InvalidInput,
                    codes::NOT_ACTIVE,
                    "handle_active may only be called once the turn is Active",
                ));
            }
            TurnState::Closed => {
                return Err(CoreError::new(
                    ErrorKind::TerminalAlreadyEmitted,
                    codes::TERMINAL_ALREADY_EMITTED,
                    "turn has already terminalized",
                ));
            }
            TurnState::Active => {}
        }

        let mut events = Vec::new();
        let mut control_signals = Vec::new();
        let terminal_outcome;
        let terminal_reason;

        if input.cancel_accepted {
            events.push(LifecycleEvent::Abort {
                reason: "cancelled".to_string(),
            });
            events.push(LifecycleEvent::Close);
            terminal_outcome = TerminalOutcome::Abort;
            terminal_reason = Some("cancelled".to_string());
        } else if input.authority_revoked {
            control_signals.push(deauthorized_drain_signal());
            events.push(LifecycleEvent::Abort {
                reason: "deauthorized".to_string(),
            });
            events.push(LifecycleEvent::Close);
            terminal_outcome = TerminalOutcome::Abort;
            terminal_reason = Some("deauthorized".to_string());
        } else if input.terminal_success_ready {
            events.push(LifecycleEvent::Commit);
            events.push(LifecycleEvent::Close);
            terminal_outcome = TerminalOutcome::Commit;
            terminal_reason = None;
        } else {
            return Ok(ActiveResult {
                lifecycle_events: Vec::new(),
                control_signals: Vec::new(),
                new_state: TurnState::Active,
            });
        }

        state.turn_state = TurnState::Closed;
        state.terminal_emitted = true;

        let plan = state
            .plan
            .clone()
            .expect("a turn reaching Active always has a resolved plan");
        let decision_outcomes = state.decision_outcomes.clone();
        let turn_open_proposed_ms = state.turn_open_proposed_ms;
        let turn_open_ms = state.turn_open_ms;
        let authority_epoch = state.authority_epoch_at_open.unwrap_or(0);
        drop(state);

        let evidence = BaselineEvidence {
            session_id: self.session_id.clone(),
            turn_id: self.turn_id.clone(),
            pipeline_version: plan.pipeline_version.clone(),
            event_id: self.turn_id.as_str().to_string(),
            envelope_snapshot: String::new(),
            payload_tags: vec!["turn".to_string()],
            redaction_decisions: vec![RedactionDecision {
                payload_tag: "turn".to_string(),
                redacted: false,
            }],
            plan_hash: plan.plan_hash.clone(),
            snapshot_provenance: plan.snapshot_provenance.clone(),
            decision_outcomes,
            invocation_outcomes: input.invocation_outcomes,
            determinism_seed: plan.determinism_seed,
            ordering_markers: plan.ordering_markers.clone(),
            merge_rule_id: plan.merge_rule_id.clone(),
            merge_rule_version: plan.merge_rule_version,
            authority_epoch,
            terminal_outcome,
            terminal_reason,
            close_emitted: true,
            timing: TimingMarkers {
                turn_open_proposed_ms,
                turn_open_ms,
                first_output_ms: input.first_output_ms,
                cancel_sent_ms: None,
                cancel_accepted_ms: input.cancel_accepted_at_ms,
                cancel_fence_applied_ms: input.cancel_accepted_at_ms,
            },
        };

        self.recorder.append_baseline(evidence)?;

        Ok(ActiveResult {
            lifecycle_events: events,
            control_signals,
            new_state: TurnState::Closed,
        })
    }
}

/// Emits a deauthorization drain control signal alongside the `abort` the
/// arbiter produces for `authority_revoked == true` (spec §4.5). Kept as a
/// free function because it is a fixed, stateless mapping the session
/// orchestrator can call without touching arbiter internals.
pub fn deauthorized_drain_signal() -> ControlSignalKind {
    ControlSignalKind::DeauthorizedDrain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageAConfig;
    use crate::control_plane::backends::{PipelineRecord, Registry};
    use async_trait::async_trait;

    struct AlwaysRegistry;
    #[async_trait]
    impl Registry for AlwaysRegistry {
        async fn resolve_pipeline_record(&self, version: &str) -> Result<PipelineRecord, CoreError> {
            Ok(PipelineRecord {
                pipeline_version: if version.is_empty() { "v1".into() } else { version.into() },
                default_execution_profile: "simple".into(),
                graph_definition_ref: "graph/v1".into(),
            })
        }
    }

    fn backends() -> ControlPlaneBackends {
        ControlPlaneBackends {
            rollout: None,
            registry: Arc::new(AlwaysRegistry),
            routing_view: None,
            policy: None,
            provider_health: None,
        }
    }

    fn arbiter() -> TurnArbiter {
        TurnArbiter::new(
            SessionId::parse("s-1").unwrap(),
            TurnId::parse("t-1").unwrap(),
            Arc::new(KernelConfig::default()),
            Arc::new(BaselineRecorder::new(StageAConfig::default(), None)),
        )
    }

    fn open_request(authority_epoch_valid: bool, authority_epoch: u64) -> TurnOpenProposed {
        TurnOpenProposed {
            event_id: EventId::parse("e-1").unwrap(),
            runtime_sequence: 1,
            runtime_ts_ms: MonotonicTimePoint::from_millis(1),
            wall_ms: MonotonicTimePoint::from_millis(1),
            snapshot_valid: true,
            authority_epoch_valid,
            authority_authorized: true,
            authority_epoch,
            admission: AdmissionOutcome::Admit,
            requested_pipeline_version: None,
        }
    }

    #[tokio::test]
    async fn s1_pre_turn_stale_epoch_leaves_turn_idle() {
        let arbiter = arbiter();
        let (event, decision) = arbiter
            .handle_turn_open_proposed(&backends(), open_request(false, 9))
            .await
            .unwrap();
        assert!(event.is_none());
        assert_eq!(decision.outcome_kind, OutcomeKind::StaleEpochReject);
        assert_eq!(arbiter.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn s2_happy_path_with_cancel() {
        let arbiter = arbiter();
        let (event, decision) = arbiter
            .handle_turn_open_proposed(&backends(), open_request(true, 11))
            .await
            .unwrap();
        assert_eq!(event, Some(LifecycleEvent::TurnOpen));
        assert_eq!(decision.outcome_kind, OutcomeKind::Admit);
        assert_eq!(arbiter.state(), TurnState::Active);

        let result = arbiter
            .handle_active(ActiveInput {
                cancel_accepted: true,
                cancel_accepted_at_ms: Some(150),
                runtime_ts_ms: 150,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            result.lifecycle_events,
            vec![
                LifecycleEvent::Abort {
                    reason: "cancelled".to_string()
                },
                LifecycleEvent::Close
            ]
        );
        assert_eq!(arbiter.state(), TurnState::Closed);

        let entries = arbiter.recorder.baseline_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].terminal_outcome, TerminalOutcome::Abort);
        assert_eq!(entries[0].terminal_reason.as_deref(), Some("cancelled"));
        assert_eq!(entries[0].timing.cancel_accepted_ms, Some(150));
        assert!(entries[0].close_emitted);
    }

    #[tokio::test]
    async fn terminalization_is_exactly_once() {
        let arbiter = arbiter();
        arbiter
            .handle_turn_open_proposed(&backends(), open_request(true, 11))
            .await
            .unwrap();
        arbiter
            .handle_active(ActiveInput {
                terminal_success_ready: true,
                ..Default::default()
            })
            .unwrap();
        let err = arbiter
            .handle_active(ActiveInput {
                terminal_success_ready: true,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TerminalAlreadyEmitted);
    }

    #[tokio::test]
    async fn deauthorized_mid_turn_emits_abort_reason_deauthorized() {
        let arbiter = arbiter();
        arbiter
            .handle_turn_open_proposed(&backends(), open_request(true, 11))
            .await
            .unwrap();
        let result = arbiter
            .handle_active(ActiveInput {
                authority_revoked: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            result.lifecycle_events,
            vec![
                LifecycleEvent::Abort {
                    reason: "deauthorized".to_string()
                },
                LifecycleEvent::Close
            ]
        );
        assert_eq!(result.control_signals, vec![ControlSignalKind::DeauthorizedDrain]);
    }

    #[tokio::test]
    async fn no_transition_when_nothing_is_ready() {
        let arbiter = arbiter();
        arbiter
            .handle_turn_open_proposed(&backends(), open_request(true, 11))
            .await
            .unwrap();
        let result = arbiter.handle_active(ActiveInput::default()).unwrap();
        assert!(result.lifecycle_events.is_empty());
        assert_eq!(arbiter.state(), TurnState::Active);
    }
}
