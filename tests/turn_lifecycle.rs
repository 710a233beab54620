//! Cross-module integration tests: session -> arbiter -> recorder -> replay,
//! and the SLO gate fed from baseline evidence across several turns.

use std::sync::Arc;

use async_trait::async_trait;

use turn_kernel::arbiter::{ActiveInput, LifecycleEvent, TurnOpenProposed};
use turn_kernel::config::KernelConfig;
use turn_kernel::control_plane::backends::{
    AdmissionOutcome, ControlPlaneBackends, PipelineRecord, Registry,
};
use turn_kernel::error::{CoreError, ErrorKind};
use turn_kernel::ids::{EventId, IdempotencyKey, SessionId, TurnId};
use turn_kernel::config::StageAConfig;
use turn_kernel::recorder::BaselineRecorder;
use turn_kernel::replay::{compare_trace_artifacts, evaluate_divergences, TraceArtifact, TraceValue};
use turn_kernel::session::Session;
use turn_kernel::slo::{evaluate_slo_gate, TurnMetrics};
use turn_kernel::time::MonotonicTimePoint;

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

fn open_request(event_id: &str, authority_epoch: u64, runtime_ts_ms: u64) -> TurnOpenProposed {
    TurnOpenProposed {
        event_id: EventId::parse(event_id).unwrap(),
        runtime_sequence: 1,
        runtime_ts_ms: MonotonicTimePoint::from_millis(runtime_ts_ms),
        wall_ms: MonotonicTimePoint::from_millis(runtime_ts_ms),
        snapshot_valid: true,
        authority_epoch_valid: true,
        authority_authorized: true,
        authority_epoch,
        admission: AdmissionOutcome::Admit,
        requested_pipeline_version: None,
    }
}

/// A turn admitted through the session facade, driven to a committed
/// close, should leave exactly one complete baseline entry behind whose
/// plan-derived fields round-trip cleanly through the replay comparator.
#[tokio::test]
async fn committed_turn_round_trips_through_recorder_and_replay() {
    let recorder = Arc::new(BaselineRecorder::new(StageAConfig::default(), None));
    let session = Session::new(
        SessionId::parse("session-1").unwrap(),
        Arc::new(KernelConfig::default()),
        recorder.clone(),
    );

    let turn_id = TurnId::parse("turn-1").unwrap();
    let arbiter = session.open_turn(turn_id.clone()).unwrap();

    let (event, decision) = arbiter
        .handle_turn_open_proposed(&backends(), open_request("e-1", 1, 10))
        .await
        .unwrap();
    assert_eq!(event, Some(LifecycleEvent::TurnOpen));
    assert_eq!(decision.outcome_kind, turn_kernel::arbiter::OutcomeKind::Admit);

    let result = arbiter
        .handle_active(ActiveInput {
            terminal_success_ready: true,
            runtime_ts_ms: 50,
            first_output_ms: Some(30),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(result.lifecycle_events, vec![LifecycleEvent::Commit, LifecycleEvent::Close]);

    session.retire_turn(&turn_id);
    assert_eq!(session.in_flight_turn_count(), 0);

    let entries = recorder.baseline_entries();
    assert_eq!(entries.len(), 1);
    let evidence = &entries[0];
    assert!(evidence.close_emitted);
    assert_eq!(evidence.plan_hash.len(), 64);

    // Replaying with the exact same recorded plan hash produces no
    // divergence; perturbing it surfaces as a `Plan`-class failure.
    let baseline_trace =
        TraceArtifact::new().with_scope("plan_hash", TraceValue::Text(evidence.plan_hash.clone()));
    let clean_replay = baseline_trace.clone();
    assert!(compare_trace_artifacts(&baseline_trace, &clean_replay).is_empty());

    let diverged_replay =
        TraceArtifact::new().with_scope("plan_hash", TraceValue::Text("0".repeat(64)));
    let divergences = compare_trace_artifacts(&baseline_trace, &diverged_replay);
    let gate = evaluate_divergences(&divergences, &turn_kernel::config::DivergencePolicy::default());
    assert!(!gate.passed());
    assert_eq!(gate.failing[0].class, turn_kernel::replay::DivergenceClass::Plan);
}

/// A turn that never sees `authority_epoch_valid == true` never reaches the
/// recorder at all — the guard's pre-turn rejection short-circuits before
/// bundle resolution or plan freezing.
#[tokio::test]
async fn stale_epoch_turn_leaves_no_baseline_entry() {
    let recorder = Arc::new(BaselineRecorder::new(StageAConfig::default(), None));
    let session = Session::new(
        SessionId::parse("session-1").unwrap(),
        Arc::new(KernelConfig::default()),
        recorder.clone(),
    );
    let turn_id = TurnId::parse("turn-1").unwrap();
    let arbiter = session.open_turn(turn_id).unwrap();

    let mut request = open_request("e-1", 1, 10);
    request.authority_epoch_valid = false;
    let (event, decision) = arbiter.handle_turn_open_proposed(&backends(), request).await.unwrap();
    assert!(event.is_none());
    assert_eq!(decision.outcome_kind, turn_kernel::arbiter::OutcomeKind::StaleEpochReject);
    assert!(recorder.baseline_entries().is_empty());
}

/// The session's idempotency ledger and authority epoch interact exactly as
/// the turn-open path expects: a key registered under the session's current
/// epoch cannot be replayed, and an epoch that has since moved on rejects
/// registration attempts trailing it with `StaleAuthority` — the same error
/// kind the guard surfaces for a stale `turn_open_proposed`.
#[tokio::test]
async fn idempotency_and_authority_epoch_share_one_failure_mode() {
    let recorder = Arc::new(BaselineRecorder::new(StageAConfig::default(), None));
    let session = Session::new(
        SessionId::parse("session-1").unwrap(),
        Arc::new(KernelConfig::default()),
        recorder,
    );
    session.advance_authority_epoch(3).unwrap();

    let key = IdempotencyKey::parse("provider-invocation-7").unwrap();
    assert!(session.register_idempotency_key(&key, 3).unwrap());
    assert!(!session.register_idempotency_key(&key, 3).unwrap());

    let err = session.register_idempotency_key(&key, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StaleAuthority);
}

/// Several turns' worth of metrics, assembled the way a session would from
/// arbiter/recorder timing, gate cleanly when every turn stays within
/// threshold and trip `TerminalCorrectness` when one turn's lifecycle is
/// malformed.
#[test]
fn slo_gate_reports_terminal_correctness_violation_across_a_batch() {
    let good = TurnMetrics {
        accepted: true,
        happy_path: true,
        turn_open_proposed_ms: Some(0),
        turn_open_ms: Some(40),
        first_output_ms: Some(200),
        cancel_accepted_ms: None,
        cancel_fence_applied_ms: None,
        baseline_complete: true,
        accepted_stale_epoch_output: false,
        terminal_events: vec!["turn_open".into(), "commit".into(), "close".into()],
    };
    let malformed = TurnMetrics {
        terminal_events: vec!["turn_open".into(), "close".into()],
        ..good.clone()
    };

    let result = evaluate_slo_gate(&[good, malformed], &turn_kernel::config::SloThresholds::default());
    assert!(!result.passed);
    assert!(result
        .violations
        .iter()
        .any(|v| matches!(v, turn_kernel::slo::SloViolation::TerminalCorrectness { .. })));
}

/// Once a session requests shutdown, a brand new turn is rejected even
/// though an already-open turn may still legally reach its terminal state
/// (SPEC_FULL.md A.5's drain contract, exercised end to end through the
/// session facade rather than the arbiter alone).
#[tokio::test]
async fn shutdown_rejects_new_turns_but_not_in_flight_ones() {
    let recorder = Arc::new(BaselineRecorder::new(StageAConfig::default(), None));
    let session = Session::new(
        SessionId::parse("session-1").unwrap(),
        Arc::new(KernelConfig::default()),
        recorder,
    );

    let in_flight = session.open_turn(TurnId::parse("turn-1").unwrap()).unwrap();
    in_flight
        .handle_turn_open_proposed(&backends(), open_request("e-1", 1, 10))
        .await
        .unwrap();

    session.request_shutdown();

    let rejected = session.open_turn(TurnId::parse("turn-2").unwrap());
    assert!(rejected.is_err());

    let result = in_flight
        .handle_active(ActiveInput {
            terminal_success_ready: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(result.lifecycle_events, vec![LifecycleEvent::Commit, LifecycleEvent::Close]);
}
