//! C10 — Baseline recorder ("OR-02" baseline).
//!
//! A per-session, bounded, append-only store of replay-critical evidence.
//! Capacities are enforced under a recorder-local lock (spec §5); snapshot
//! reads return stable copies rather than live references so a concurrent
//! append never invalidates a reader's view.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::StageAConfig;
use crate::error::{CoreError, ErrorKind, codes};
use crate::ids::{ProviderInvocationId, SessionId, TurnId};
use crate::provider::invocation::ProviderAttemptEvidence;
use crate::streaming::HandoffEdge;

/// Timing markers optionally recorded on [`BaselineEvidence`] (spec §3).
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TimingMarkers {
    pub turn_open_proposed_ms: Option<u64>,
    pub turn_open_ms: Option<u64>,
    pub first_output_ms: Option<u64>,
    pub cancel_sent_ms: Option<u64>,
    pub cancel_accepted_ms: Option<u64>,
    pub cancel_fence_applied_ms: Option<u64>,
}

/// Terminal classification of a closed turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TerminalOutcome {
    Commit,
    Abort,
}

/// One `(payload_tag, redaction_decision)` pair; spec §3 requires exactly one
/// redaction decision per payload tag, with no duplicate tags.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RedactionDecision {
    pub payload_tag: String,
    pub redacted: bool,
}

/// The replay-critical evidence record for one turn (spec §3 `BaselineEvidence`).
#[derive(Clone, Debug)]
pub struct BaselineEvidence {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub pipeline_version: String,
    pub event_id: String,
    pub envelope_snapshot: String,
    pub payload_tags: Vec<String>,
    pub redaction_decisions: Vec<RedactionDecision>,
    pub plan_hash: String,
    pub snapshot_provenance: crate::control_plane::bundle::SnapshotProvenance,
    pub decision_outcomes: Vec<crate::arbiter::DecisionOutcome>,
    pub invocation_outcomes: Vec<InvocationOutcome>,
    pub determinism_seed: i64,
    pub ordering_markers: Vec<String>,
    pub merge_rule_id: String,
    pub merge_rule_version: u32,
    pub authority_epoch: u64,
    pub terminal_outcome: TerminalOutcome,
    pub terminal_reason: Option<String>,
    pub close_emitted: bool,
    pub timing: TimingMarkers,
}

/// Normalized per-invocation outcome derived from its attempts (spec §4.10).
#[derive(Clone, Debug)]
pub struct InvocationOutcome {
    pub provider_invocation_id: ProviderInvocationId,
    pub terminal_outcome_class: crate::provider::OutcomeClass,
    pub attempt_count: u32,
    pub total_latency_ms: u64,
}

/// Whether the turn this evidence describes is "accepted" (spec §3: a turn
/// is accepted iff `turn_open_at_ms` — here, `timing.turn_open_ms` — is
/// present).
pub fn is_accepted(ev: &BaselineEvidence) -> bool {
    ev.timing.turn_open_ms.is_some()
}

/// Validates completeness of an accepted turn's evidence (spec invariant 5).
/// Non-accepted turns vacuously pass — the recorder never requires
/// completeness from a turn that was never admitted.
pub fn validate_completeness(ev: &BaselineEvidence) -> Result<(), CoreError> {
    if !is_accepted(ev) {
        return Ok(());
    }
    let mut problems: Vec<&'static str> = Vec::new();
    if ev.payload_tags.is_empty() {
        problems.push("payload_tags must be non-empty");
    }
    let mut seen_tags = HashSet::new();
    for decision in &ev.redaction_decisions {
        if !seen_tags.insert(decision.payload_tag.as_str()) {
            problems.push("redaction_decisions must not contain a duplicate payload_tag");
        }
    }
    if ev.redaction_decisions.len() != ev.payload_tags.len() {
        problems.push("redaction_decisions must carry exactly one entry per payload_tag");
    }
    if ev.decision_outcomes.is_empty() {
        problems.push("decision_outcomes must be non-empty");
    }
    if ev.ordering_markers.is_empty() {
        problems.push("ordering_markers must be non-empty");
    }
    let unique_markers: HashSet<&String> = ev.ordering_markers.iter().collect();
    if unique_markers.len() != ev.ordering_markers.len() {
        problems.push("ordering_markers must be unique");
    }
    if !ev.close_emitted {
        problems.push("close_emitted must be true");
    }
    if ev.terminal_outcome == TerminalOutcome::Abort && ev.terminal_reason.is_none() {
        problems.push("terminal_reason is required when terminal_outcome is abort");
    }
    if ev.plan_hash.len() != 64 || !ev.plan_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        problems.push("plan_hash must be 64 hex characters");
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(CoreError::new(
            ErrorKind::InvalidInput,
            codes::COMPLETENESS_FAILED,
            format!("baseline completeness failed: {}", problems.join("; ")),
        ))
    }
}

/// A record offered to the durable exporter after a successful in-memory
/// append (spec §4.10 / §6 `Enqueue(Record) -> accepted:bool`).
#[derive(Clone, Debug)]
pub struct Record {
    pub kind: &'static str,
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub payload: Arc<BaselineEvidence>,
}

/// Non-blocking durable sink. Backpressure (returning `false`) must not fail
/// the recorder's local append (spec §4.10).
pub trait DurableExporter: Send + Sync {
    fn enqueue(&self, record: Record) -> bool;
}

/// A synthetic control signal the recorder raises itself, distinct from the
/// lifecycle/arbiter-originated signals in [`crate::event::ControlSignalKind`]
/// — `recording_level_downgraded` fires at most once per `(session_id,
/// turn_id)` when detail recording first overflows.
#[derive(Clone, Debug)]
pub struct RecordingLevelDowngraded {
    pub session_id: SessionId,
    pub turn_id: TurnId,
}

struct SessionState {
    baselines: Vec<BaselineEvidence>,
    detail_count: usize,
    attempts: Vec<ProviderAttemptEvidence>,
    handoffs: Vec<HandoffEdge>,
    downgraded_turns: HashSet<TurnId>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            baselines: Vec::new(),
            detail_count: 0,
            attempts: Vec::new(),
            handoffs: Vec::new(),
            downgraded_turns: HashSet::new(),
        }
    }
}

/// Bounded, per-session Stage-A append store (spec §4.10).
pub struct BaselineRecorder {
    config: StageAConfig,
    exporter: Option<Arc<dyn DurableExporter>>,
    state: Mutex<SessionState>,
}

impl BaselineRecorder {
    pub fn new(config: StageAConfig, exporter: Option<Arc<dyn DurableExporter>>) -> Self {
        Self {
            config,
            exporter,
            state: Mutex::new(SessionState::new()),
        }
    }

    /// Appends one turn's baseline evidence. Validates completeness first;
    /// a full recorder returns `CapacityExhausted` and never overwrites an
    /// existing entry.
    pub fn append_baseline(&self, ev: BaselineEvidence) -> Result<(), CoreError> {
        validate_completeness(&ev)?;
        let mut state = self.state.lock();
        if state.baselines.len() >= self.config.baseline_capacity {
            return Err(CoreError::new(
                ErrorKind::CapacityExhausted,
                codes::CAPACITY_EXHAUSTED,
                "baseline capacity exhausted",
            ));
        }
        let session_id = ev.session_id.clone();
        let turn_id = ev.turn_id.clone();
        let payload = Arc::new(ev);
        state.baselines.push((*payload).clone());
        drop(state);

        if let Some(exporter) = &self.exporter {
            let _accepted = exporter.enqueue(Record {
                kind: "baseline",
                session_id,
                turn_id,
                payload,
            });
            // Backpressure from the exporter is observed only; the local
            // append above already succeeded and is never rolled back.
        }
        Ok(())
    }

    /// Best-effort append of a non-replay-critical detail event. On
    /// overflow the event is dropped and, exactly once per
    /// `(session_id, turn_id)`, `Some` is returned carrying the synthetic
    /// `recording_level_downgraded` signal.
    pub fn append_detail(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
    ) -> Option<RecordingLevelDowngraded> {
        let mut state = self.state.lock();
        if state.detail_count < self.config.detail_capacity {
            state.detail_count += 1;
            return None;
        }
        if state.downgraded_turns.insert(turn_id.clone()) {
            Some(RecordingLevelDowngraded {
                session_id: session_id.clone(),
                turn_id: turn_id.clone(),
            })
        } else {
            None
        }
    }

    /// Atomically appends a batch of provider attempt evidence: the whole
    /// batch fails on capacity or validation, with nothing partially
    /// appended.
    pub fn append_provider_invocation_attempts(
        &self,
        batch: Vec<ProviderAttemptEvidence>,
    ) -> Result<(), CoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.attempts.len() + batch.len() > self.config.attempt_capacity {
            return Err(CoreError::new(
                ErrorKind::CapacityExhausted,
                codes::CAPACITY_EXHAUSTED,
                "attempt capacity exhausted",
            ));
        }
        state.attempts.extend(batch);
        Ok(())
    }

    /// Appends handoff edge evidence, subject to `HandoffCapacity`.
    pub fn append_handoff_edge(&self, edge: HandoffEdge) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if state.handoffs.len() >= self.config.handoff_capacity {
            return Err(CoreError::new(
                ErrorKind::CapacityExhausted,
                codes::CAPACITY_EXHAUSTED,
                "handoff capacity exhausted",
            ));
        }
        state.handoffs.push(edge);
        Ok(())
    }

    /// Stable-copy snapshot of every baseline entry appended so far.
    pub fn baseline_entries(&self) -> Vec<BaselineEvidence> {
        self.state.lock().baselines.clone()
    }

    pub fn handoff_entries(&self) -> Vec<HandoffEdge> {
        self.state.lock().handoffs.clone()
    }

    pub fn attempt_entries(&self) -> Vec<ProviderAttemptEvidence> {
        self.state.lock().attempts.clone()
    }
}

/// Derives the deterministic per-invocation outcome list from a (possibly
/// reordered) batch of attempt evidence (spec §4.10 / testable property 8):
/// grouped by `provider_invocation_id`, groups ordered by id, attempts within
/// a group ordered by `(runtime_ts, wall_ts, runtime_seq, transport_seq,
/// attempt, provider_id, event_id)`; the final attempt in order supplies the
/// normalized terminal outcome class.
pub fn invocation_outcomes_from_provider_attempts(
    attempts: &[ProviderAttemptEvidence],
) -> Vec<InvocationOutcome> {
    use std::collections::BTreeMap;

    let mut groups: BTreeMap<String, Vec<&ProviderAttemptEvidence>> = BTreeMap::new();
    for a in attempts {
        groups
            .entry(a.provider_invocation_id.as_str().to_string())
            .or_default()
            .push(a);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_id, mut group) in groups {
        group.sort_by(|a, b| {
            (
                a.runtime_ts_ms,
                a.wall_ms,
                a.runtime_sequence,
                a.transport_sequence,
                a.attempt,
                a.provider_id.as_str(),
                a.event_id.as_str(),
            )
                .cmp(&(
                    b.runtime_ts_ms,
                    b.wall_ms,
                    b.runtime_sequence,
                    b.transport_sequence,
                    b.attempt,
                    b.provider_id.as_str(),
                    b.event_id.as_str(),
                ))
        });
        let last = group.last().expect("group is non-empty by construction");
        let total_latency_ms: u64 = group.iter().map(|a| a.latency_ms).sum();
        out.push(InvocationOutcome {
            provider_invocation_id: last.provider_invocation_id.clone(),
            terminal_outcome_class: last.outcome_class,
            attempt_count: group.len() as u32,
            total_latency_ms,
        });
    }
    out
}

/// Persisted evidence stream format consumed by replay (spec §6): rejects
/// an empty `entries` list on read.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BaselineArtifact {
    pub schema_version: String,
    pub generated_at_utc: String,
    pub entries: Vec<SerializableBaselineEvidence>,
}

/// Serializable projection of [`crate::arbiter::DecisionOutcome`]; the
/// in-memory type embeds a non-serializable `EventId` newtype and
/// [`crate::time::MonotonicTimePoint`], so the artifact format carries their
/// plain-scalar form.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SerializableDecisionOutcome {
    pub outcome_kind: String,
    pub phase: String,
    pub scope: String,
    pub event_id: String,
    pub runtime_ts_ms: u64,
    pub wall_ms: u64,
    pub emitted_by: String,
    pub reason: String,
    pub authority_epoch: Option<u64>,
}

impl From<&crate::arbiter::DecisionOutcome> for SerializableDecisionOutcome {
    fn from(d: &crate::arbiter::DecisionOutcome) -> Self {
        Self {
            outcome_kind: d.outcome_kind.as_str().to_string(),
            phase: d.phase.as_str().to_string(),
            scope: d.scope.as_str().to_string(),
            event_id: d.event_id.as_str().to_string(),
            runtime_ts_ms: d.runtime_ts_ms.as_millis(),
            wall_ms: d.wall_ms.as_millis(),
            emitted_by: d.emitted_by.clone(),
            reason: d.reason.clone(),
            authority_epoch: d.authority_epoch,
        }
    }
}

/// Serializable projection of [`InvocationOutcome`]; carries
/// `provider_invocation_id`/`terminal_outcome_class` as strings rather than
/// the in-memory newtype/enum.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SerializableInvocationOutcome {
    pub provider_invocation_id: String,
    pub terminal_outcome_class: String,
    pub attempt_count: u32,
    pub total_latency_ms: u64,
}

impl From<&InvocationOutcome> for SerializableInvocationOutcome {
    fn from(o: &InvocationOutcome) -> Self {
        Self {
            provider_invocation_id: o.provider_invocation_id.as_str().to_string(),
            terminal_outcome_class: o.terminal_outcome_class.as_str().to_string(),
            attempt_count: o.attempt_count,
            total_latency_ms: o.total_latency_ms,
        }
    }
}

/// Serializable projection of [`BaselineEvidence`] used for artifact
/// round-trips; the in-memory type embeds non-serializable newtypes
/// (`SessionId`/`TurnId`), so the artifact format carries their string form.
/// Carries every field of `BaselineEvidence` — the replay comparator (C11)
/// compares against all of them, so a lossy projection would silently break
/// replay for whichever field it dropped.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SerializableBaselineEvidence {
    pub session_id: String,
    pub turn_id: String,
    pub pipeline_version: String,
    pub event_id: String,
    pub envelope_snapshot: String,
    pub payload_tags: Vec<String>,
    pub redaction_decisions: Vec<RedactionDecision>,
    pub plan_hash: String,
    pub snapshot_provenance: crate::control_plane::bundle::SnapshotProvenance,
    pub decision_outcomes: Vec<SerializableDecisionOutcome>,
    pub invocation_outcomes: Vec<SerializableInvocationOutcome>,
    pub determinism_seed: i64,
    pub ordering_markers: Vec<String>,
    pub merge_rule_id: String,
    pub merge_rule_version: u32,
    pub authority_epoch: u64,
    pub terminal_outcome: TerminalOutcome,
    pub terminal_reason: Option<String>,
    pub close_emitted: bool,
    pub timing: TimingMarkers,
}

impl From<&BaselineEvidence> for SerializableBaselineEvidence {
    fn from(ev: &BaselineEvidence) -> Self {
        Self {
            session_id: ev.session_id.as_str().to_string(),
            turn_id: ev.turn_id.as_str().to_string(),
            pipeline_version: ev.pipeline_version.clone(),
            event_id: ev.event_id.clone(),
            envelope_snapshot: ev.envelope_snapshot.clone(),
            payload_tags: ev.payload_tags.clone(),
            redaction_decisions: ev.redaction_decisions.clone(),
            plan_hash: ev.plan_hash.clone(),
            snapshot_provenance: ev.snapshot_provenance.clone(),
            decision_outcomes: ev.decision_outcomes.iter().map(SerializableDecisionOutcome::from).collect(),
            invocation_outcomes: ev.invocation_outcomes.iter().map(SerializableInvocationOutcome::from).collect(),
            determinism_seed: ev.determinism_seed,
            ordering_markers: ev.ordering_markers.clone(),
            merge_rule_id: ev.merge_rule_id.clone(),
            merge_rule_version: ev.merge_rule_version,
            authority_epoch: ev.authority_epoch,
            terminal_outcome: ev.terminal_outcome,
            terminal_reason: ev.terminal_reason.clone(),
            close_emitted: ev.close_emitted,
            timing: ev.timing,
        }
    }
}

pub fn write_baseline_artifact(entries: &[BaselineEvidence]) -> BaselineArtifact {
    BaselineArtifact {
        schema_version: "v1".to_string(),
        generated_at_utc: String::new(),
        entries: entries.iter().map(SerializableBaselineEvidence::from).collect(),
    }
}

pub fn read_baseline_artifact(artifact: &BaselineArtifact) -> Result<&[SerializableBaselineEvidence], CoreError> {
    if artifact.entries.is_empty() {
        return Err(CoreError::new(
            ErrorKind::InvalidInput,
            "baseline_artifact.empty",
            "baseline artifact must not have an empty entries list",
        ));
    }
    Ok(&artifact.entries)
}
