//! C7 — Streaming handoff scheduler.
//!
//! Overlaps STT -> LLM -> TTS, recording handoff edges and emitting
//! backpressure signals as downstream stages saturate and recover (spec
//! §4.7). When disabled, the chain degenerates to sequential execution with
//! no [`HandoffEdge`] records.

use crate::config::StreamingHandoffPolicy;
use crate::event::ControlSignalKind;
use crate::ids::CorrelationId;
use crate::telemetry::{Correlation, Emission, ObservabilityFacade};

/// Which of the two handoff points an edge record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffPoint {
    SttToLlm,
    LlmToTts,
}

/// What the scheduler did with an upstream partial at a handoff point (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffAction {
    Forward,
    Coalesce,
    Supersede,
    FinalFallback,
}

/// One recorded handoff (spec §3 `HandoffEdge`).
#[derive(Clone, Debug)]
pub struct HandoffEdge {
    pub handoff_id: String,
    pub edge: HandoffPoint,
    pub upstream_revision: u64,
    pub action: HandoffAction,
    pub partial_accepted_at_ms: u64,
    pub downstream_started_at_ms: u64,
    pub handoff_latency_ms: u64,
    pub queue_depth: usize,
    pub watermark_high: bool,
}

/// One partial emitted by an upstream stage, driving the handoff decision.
#[derive(Clone, Debug)]
pub struct UpstreamPartial {
    pub revision: u64,
    pub accumulated_len: usize,
    pub emitted_at_ms: u64,
    pub is_final: bool,
}

/// Per-edge overlap state: whether a downstream stage has already been
/// started for this segment, and the revisions still pending.
struct EdgeState {
    started: bool,
    started_revision: Option<u64>,
    pending_revisions: Vec<u64>,
    saturated: bool,
}

impl EdgeState {
    fn new() -> Self {
        Self {
            started: false,
            started_revision: None,
            pending_revisions: Vec::new(),
            saturated: false,
        }
    }
}

/// Latency report assembled across the whole chain (spec §4.7).
#[derive(Clone, Debug, Default)]
pub struct StreamingChainLatencyReport {
    pub stt_first_partial_ms: Option<u64>,
    pub stt_to_llm_start_ms: Option<u64>,
    pub llm_first_partial_ms: Option<u64>,
    pub llm_to_tts_start_ms: Option<u64>,
    pub tts_first_audio_ms: Option<u64>,
    pub first_assistant_audio_e2e_ms: Option<u64>,
    pub turn_completion_e2e_ms: Option<u64>,
}

/// One partial a stage produces, timed relative to when that stage started.
/// STT starts at the chain's own start time; LLM/TTS start when their
/// upstream handoff fires, so their partials' absolute times are computed by
/// the scheduler rather than supplied in advance. `ExecuteStreamingChain`
/// (spec §4.7) schedules handoffs and records edges/latency from these
/// timelines; it does not invoke providers itself — provider protocol
/// execution is out of scope (spec §1 Non-goals), so a stage's timeline is
/// supplied by the host's own STT/LLM/TTS execution layer.
#[derive(Clone, Debug)]
pub struct StagePartial {
    pub revision: u64,
    pub accumulated_len: usize,
    pub offset_ms: u64,
    pub is_final: bool,
}

/// A stage's ordered partial timeline (spec §4.7's `sttPlan`/`llmPlan`/`ttsPlan`).
#[derive(Clone, Debug, Default)]
pub struct StagePlan {
    pub partials: Vec<StagePartial>,
}

fn stage_partial_at(start_ms: u64, p: &StagePartial) -> UpstreamPartial {
    UpstreamPartial {
        revision: p.revision,
        accumulated_len: p.accumulated_len,
        emitted_at_ms: start_ms.saturating_add(p.offset_ms),
        is_final: p.is_final,
    }
}

/// The outcome of driving one full chain (spec §4.7 `StreamingChainResult`).
#[derive(Clone, Debug, Default)]
pub struct StreamingChainResult {
    pub edges: Vec<HandoffEdge>,
    pub signals: Vec<ControlSignalKind>,
    pub latency_report: StreamingChainLatencyReport,
}

struct EdgeDrive {
    downstream_start_ms: u64,
    completed_ms: u64,
    first_partial_ms: u64,
}

/// A single overlap decision at a handoff point, with the edge record and an
/// optional control signal to emit.
#[derive(Clone, Debug)]
pub struct HandoffDecision {
    pub edge: HandoffEdge,
    pub signal: Option<ControlSignalKind>,
    pub cancels_in_flight_downstream: bool,
}

/// Drives one handoff point's overlap decision for a newly observed upstream
/// partial (spec §4.7): starts the downstream stage once accumulated text
/// reaches `min_partial_chars`; subsequent partials before the downstream
/// stage's own completion either `coalesce` (latest-kept) or `supersede`
/// (cancel in-flight downstream work), bounded by `max_pending_revisions`.
fn handle_upstream_partial(
    state: &mut EdgeState,
    edge_point: HandoffPoint,
    handoff_id: &str,
    partial: &UpstreamPartial,
    policy: &StreamingHandoffPolicy,
) -> Option<HandoffDecision> {
    if !state.started {
        if partial.accumulated_len < policy.min_partial_chars && !partial.is_final {
            return None;
        }
        state.started = true;
        state.started_revision = Some(partial.revision);
        return Some(HandoffDecision {
            edge: HandoffEdge {
                handoff_id: handoff_id.to_string(),
                edge: edge_point,
                upstream_revision: partial.revision,
                action: HandoffAction::Forward,
                partial_accepted_at_ms: partial.emitted_at_ms,
                downstream_started_at_ms: partial.emitted_at_ms,
                handoff_latency_ms: 0,
                queue_depth: state.pending_revisions.len(),
                watermark_high: false,
            },
            signal: None,
            cancels_in_flight_downstream: false,
        });
    }

    // The upstream's own final partial always forces a definitive handoff,
    // overriding coalesce/supersede — there is no later partial left to
    // correct a merely-coalesced guess.
    if partial.is_final {
        state.pending_revisions.clear();
        state.started_revision = Some(partial.revision);
        return Some(HandoffDecision {
            edge: HandoffEdge {
                handoff_id: handoff_id.to_string(),
                edge: edge_point,
                upstream_revision: partial.revision,
                action: HandoffAction::FinalFallback,
                partial_accepted_at_ms: partial.emitted_at_ms,
                downstream_started_at_ms: partial.emitted_at_ms,
                handoff_latency_ms: 0,
                queue_depth: 0,
                watermark_high: false,
            },
            signal: None,
            cancels_in_flight_downstream: true,
        });
    }

    // Downstream already started for this segment: later partials either
    // coalesce (keep only the latest pending revision) or supersede
    // (cancel in-flight downstream work and restart on the new revision).
    if state.pending_revisions.len() >= policy.max_pending_revisions {
        state.pending_revisions.remove(0);
    }
    state.pending_revisions.push(partial.revision);

    let action = if policy.coalesce_latest_only {
        HandoffAction::Coalesce
    } else {
        HandoffAction::Supersede
    };
    let cancels = action == HandoffAction::Supersede;
    if cancels {
        state.started_revision = Some(partial.revision);
    }

    Some(HandoffDecision {
        edge: HandoffEdge {
            handoff_id: handoff_id.to_string(),
            edge: edge_point,
            upstream_revision: partial.revision,
            action,
            partial_accepted_at_ms: partial.emitted_at_ms,
            downstream_started_at_ms: partial.emitted_at_ms,
            handoff_latency_ms: 0,
            queue_depth: state.pending_revisions.len(),
            watermark_high: false,
        },
        signal: None,
        cancels_in_flight_downstream: cancels,
    })
}

/// Emits `flow_xoff`/`flow_xon` for a saturation transition, suppressing
/// duplicate signals for repeated saturate/recover observations at the same
/// state (spec §4.7).
fn handle_saturation(state: &mut EdgeState, saturated: bool) -> Option<ControlSignalKind> {
    if saturated == state.saturated {
        return None;
    }
    state.saturated = saturated;
    Some(if saturated {
        ControlSignalKind::FlowXoff
    } else {
        ControlSignalKind::FlowXon
    })
}

/// One stage's overlap tracker, covering both handoff edges of the chain.
pub struct StreamingChainScheduler {
    policy: StreamingHandoffPolicy,
    stt_to_llm: EdgeState,
    llm_to_tts: EdgeState,
}

impl StreamingChainScheduler {
    pub fn new(policy: StreamingHandoffPolicy) -> Self {
        Self {
            policy,
            stt_to_llm: EdgeState::new(),
            llm_to_tts: EdgeState::new(),
        }
    }

    pub fn stt_to_llm_enabled(&self) -> bool {
        self.policy.enabled && self.policy.stt_to_llm_enabled
    }

    pub fn llm_to_tts_enabled(&self) -> bool {
        self.policy.enabled && self.policy.llm_to_tts_enabled
    }

    pub fn handle_stt_partial(
        &mut self,
        correlation: &CorrelationId,
        partial: &UpstreamPartial,
    ) -> Option<HandoffDecision> {
        if !self.stt_to_llm_enabled() {
            return None;
        }
        handle_upstream_partial(
            &mut self.stt_to_llm,
            HandoffPoint::SttToLlm,
            correlation.as_str(),
            partial,
            &self.policy,
        )
    }

    pub fn handle_llm_partial(
        &mut self,
        correlation: &CorrelationId,
        partial: &UpstreamPartial,
    ) -> Option<HandoffDecision> {
        if !self.llm_to_tts_enabled() {
            return None;
        }
        handle_upstream_partial(
            &mut self.llm_to_tts,
            HandoffPoint::LlmToTts,
            correlation.as_str(),
            partial,
            &self.policy,
        )
    }

    pub fn handle_stt_to_llm_saturation(&mut self, saturated: bool) -> Option<ControlSignalKind> {
        handle_saturation(&mut self.stt_to_llm, saturated)
    }

    pub fn handle_llm_to_tts_saturation(&mut self, saturated: bool) -> Option<ControlSignalKind> {
        handle_saturation(&mut self.llm_to_tts, saturated)
    }

    fn drive_edge(
        state: &mut EdgeState,
        edge_point: HandoffPoint,
        handoff_id: &str,
        enabled: bool,
        start_ms: u64,
        plan: &StagePlan,
        policy: &StreamingHandoffPolicy,
        facade: &dyn ObservabilityFacade,
        correlation: &Correlation,
        result: &mut StreamingChainResult,
    ) -> EdgeDrive {
        let mut downstream_start_ms = None;
        let mut completed_ms = start_ms;
        let mut first_partial_ms = None;

        for p in &plan.partials {
            let upstream = stage_partial_at(start_ms, p);
            completed_ms = completed_ms.max(upstream.emitted_at_ms);
            if first_partial_ms.is_none() {
                first_partial_ms = Some(upstream.emitted_at_ms);
            }
            if !enabled {
                continue;
            }
            if let Some(decision) = handle_upstream_partial(state, edge_point, handoff_id, &upstream, policy) {
                if downstream_start_ms.is_none() {
                    downstream_start_ms = Some(decision.edge.downstream_started_at_ms);
                }
                if let Some(signal) = decision.signal {
                    result.signals.push(signal);
                }
                facade.emit(Emission::Metric {
                    name: "edge_latency_ms",
                    value: decision.edge.handoff_latency_ms as f64,
                    correlation: correlation.clone(),
                    attributes: std::collections::BTreeMap::from([
                        ("edge".to_string(), edge_name(edge_point).to_string()),
                        ("action".to_string(), format!("{:?}", decision.edge.action)),
                    ]),
                });
                result.edges.push(decision.edge);
            }
        }

        EdgeDrive {
            downstream_start_ms: downstream_start_ms.unwrap_or(completed_ms),
            completed_ms,
            first_partial_ms: first_partial_ms.unwrap_or(start_ms),
        }
    }

    /// Drives STT -> LLM -> TTS for one turn (spec §4.7 `ExecuteStreamingChain`):
    /// when an edge is enabled, overlaps stages per the handoff policy,
    /// recording `HandoffEdge`s and `edge_latency_ms` telemetry; when
    /// disabled, the edge executes sequentially (downstream starts only once
    /// upstream reaches its own terminal partial) with no edge records.
    pub fn execute_chain(
        &mut self,
        handoff_id: &str,
        start_ms: u64,
        stt: &StagePlan,
        llm: &StagePlan,
        tts: &StagePlan,
        facade: &dyn ObservabilityFacade,
        mut correlation: Correlation,
    ) -> StreamingChainResult {
        correlation.edge_id = CorrelationId::parse(handoff_id).ok();
        let mut result = StreamingChainResult::default();

        let stt_to_llm_enabled = self.stt_to_llm_enabled();
        let stt_drive = Self::drive_edge(
            &mut self.stt_to_llm,
            HandoffPoint::SttToLlm,
            handoff_id,
            stt_to_llm_enabled,
            start_ms,
            stt,
            &self.policy,
            facade,
            &correlation,
            &mut result,
        );

        let llm_to_tts_enabled = self.llm_to_tts_enabled();
        let llm_drive = Self::drive_edge(
            &mut self.llm_to_tts,
            HandoffPoint::LlmToTts,
            handoff_id,
            llm_to_tts_enabled,
            stt_drive.downstream_start_ms,
            llm,
            &self.policy,
            facade,
            &correlation,
            &mut result,
        );

        let mut tts_completed_ms = llm_drive.downstream_start_ms;
        let mut tts_first_audio_ms = None;
        for p in &tts.partials {
            let at = llm_drive.downstream_start_ms.saturating_add(p.offset_ms);
            tts_completed_ms = tts_completed_ms.max(at);
            if tts_first_audio_ms.is_none() {
                tts_first_audio_ms = Some(at);
            }
        }
        let tts_first_audio_ms = tts_first_audio_ms.unwrap_or(llm_drive.downstream_start_ms);

        result.latency_report = StreamingChainLatencyReport {
            stt_first_partial_ms: Some(stt_drive.first_partial_ms),
            stt_to_llm_start_ms: Some(stt_drive.downstream_start_ms),
            llm_first_partial_ms: Some(llm_drive.first_partial_ms),
            llm_to_tts_start_ms: Some(llm_drive.downstream_start_ms),
            tts_first_audio_ms: Some(tts_first_audio_ms),
            first_assistant_audio_e2e_ms: Some(tts_first_audio_ms.saturating_sub(start_ms)),
            turn_completion_e2e_ms: Some(tts_completed_ms.saturating_sub(start_ms)),
        };
        result
    }
}

fn edge_name(point: HandoffPoint) -> &'static str {
    match point {
        HandoffPoint::SttToLlm => "stt_to_llm",
        HandoffPoint::LlmToTts => "llm_to_tts",
    }
}
