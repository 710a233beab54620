//! Provider invocation controller: deterministic candidate selection, the
//! attempt loop (retry / provider_switch / fallback), and the streaming
//! chunk lifecycle (spec §4.6).

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::{InvocationControllerConfig, IoCapture, IoCaptureMode};
use crate::control_plane::backends::AdaptiveAction;
use crate::error::{CoreError, ErrorKind, codes};
use crate::event::ControlSignalKind;
use crate::ids::ProviderInvocationId;
use crate::provider::registry::ProviderRegistry;
use crate::provider::{Modality, OutcomeClass, RetryDecision};
use crate::time::Clock;

/// Normalized outcome of one provider call (spec §6 `Adapter::Invoke`).
#[derive(Clone, Debug)]
pub struct Outcome {
    pub class: OutcomeClass,
    pub retryable: bool,
    pub circuit_open: bool,
    pub backoff_ms: u64,
    pub reason: Option<String>,
    pub status_code: Option<u16>,
}

/// Opaque request payload handed to an adapter; the kernel never interprets
/// its contents (Non-goal: no provider protocol execution).
#[derive(Clone, Debug, Default)]
pub struct InvocationRequest {
    pub payload_ref: Option<String>,
    pub streaming_requested: bool,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn provider_id(&self) -> &str;
    fn modality(&self) -> Modality;
    async fn invoke(&self, req: &InvocationRequest) -> (Outcome, Option<String>);

    /// Downcast to the streaming extension, for adapters that implement it.
    /// Most adapters leave this at its default (`None`); a `StreamingAdapter`
    /// impl overrides it to return `Some(self)`.
    fn as_streaming(&self) -> Option<&dyn StreamingAdapter> {
        None
    }
}

/// One kind of streamed unit within a single attempt (spec §3 `StreamChunk`).
#[derive(Clone, Debug)]
pub enum StreamChunk {
    Start,
    TextDelta { sequence: u64, text_delta: String },
    AudioBytes { sequence: u64, audio_bytes: usize },
    Final { sequence: u64, text_final: Option<String> },
    Error { sequence: u64, error_reason: String },
}

impl StreamChunk {
    fn sequence(&self) -> Option<u64> {
        match self {
            StreamChunk::Start => None,
            StreamChunk::TextDelta { sequence, .. }
            | StreamChunk::AudioBytes { sequence, .. }
            | StreamChunk::Final { sequence, .. }
            | StreamChunk::Error { sequence, .. } => Some(*sequence),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Final { .. } | StreamChunk::Error { .. })
    }
}

/// Observer callback surface (spec §6): exactly one `OnStart`, zero or more
/// chunk callbacks, at most one terminal callback, monotonic `sequence`.
/// [`StreamLifecycleValidator`] wraps a caller-supplied observer and enforces
/// these invariants before forwarding.
pub trait StreamObserver: Send {
    fn on_start(&mut self);
    fn on_chunk(&mut self, chunk: &StreamChunk);
    fn on_complete(&mut self, chunk: &StreamChunk);
    fn on_error(&mut self, chunk: &StreamChunk);
}

/// Adapters that support streaming additionally implement this trait; the
/// controller drives `observer` as chunks arrive, live, over the course of
/// the call — the adapter calls `observer.on_start()`/`on_chunk()`/
/// `on_complete()`/`on_error()` itself as its underlying transport produces
/// chunks, rather than handing back a pre-built chunk list.
#[async_trait]
pub trait StreamingAdapter: Adapter {
    async fn invoke_stream(
        &self,
        req: &InvocationRequest,
        observer: &mut dyn StreamObserver,
    ) -> (Outcome, Option<String>);
}

/// Wraps a [`StreamObserver`] and enforces the stream lifecycle invariants
/// (spec §4.6 / testable property 4): start-before-anything, strictly
/// monotonic sequence, exactly one terminal, no chunks after it. A
/// violation is reported as [`ErrorKind::StreamLifecycleViolation`] and maps
/// the attempt outcome to `infrastructure_failure`.
pub struct StreamLifecycleValidator<'a> {
    observer: &'a mut dyn StreamObserver,
    started: bool,
    terminated: bool,
    last_sequence: Option<u64>,
    violation: Option<CoreError>,
}

impl<'a> StreamLifecycleValidator<'a> {
    pub fn new(observer: &'a mut dyn StreamObserver) -> Self {
        Self {
            observer,
            started: false,
            terminated: false,
            last_sequence: None,
            violation: None,
        }
    }

    pub fn drive(mut self, chunks: &[StreamChunk]) -> Result<(), CoreError> {
        for chunk in chunks {
            self.feed(chunk)?;
        }
        Ok(())
    }

    /// Consumes the validator, returning the first lifecycle violation
    /// observed while it was driven live as a [`StreamObserver`] (used by
    /// [`invoke_streaming_attempt`], which cannot propagate a `Result` from
    /// the trait's `&mut self` callback methods).
    pub fn into_violation(self) -> Option<CoreError> {
        self.violation
    }

    fn feed(&mut self, chunk: &StreamChunk) -> Result<(), CoreError> {
        if self.terminated {
            return Err(violation("chunk observed after stream terminal"));
        }
        match chunk {
            StreamChunk::Start => {
                if self.started {
                    return Err(violation("duplicate Start chunk"));
                }
                self.started = true;
                self.observer.on_start();
            }
            other => {
                if !self.started {
                    return Err(violation("chunk observed before Start"));
                }
                let seq = other.sequence().expect("non-Start chunk carries a sequence");
                if let Some(last) = self.last_sequence {
                    if seq <= last {
                        return Err(violation("stream chunk sequence is not strictly increasing"));
                    }
                } else if seq != 0 {
                    // Per spec §8 property 4, the first chunk after Start
                    // need not literally be sequence 0 in this controller's
                    // model (Start itself occupies sequence 0); only
                    // monotonicity thereafter is enforced structurally.
                }
                self.last_sequence = Some(seq);
                if other.is_terminal() {
                    self.terminated = true;
                    match other {
                        StreamChunk::Final { .. } => self.observer.on_complete(other),
                        StreamChunk::Error { .. } => self.observer.on_error(other),
                        _ => unreachable!(),
                    }
                } else {
                    self.observer.on_chunk(other);
                }
            }
        }
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl<'a> StreamLifecycleValidator<'a> {
    fn feed_if_clean(&mut self, chunk: &StreamChunk) {
        if self.violation.is_some() {
            return;
        }
        if let Err(e) = self.feed(chunk) {
            self.violation = Some(e);
        }
    }
}

impl<'a> StreamObserver for StreamLifecycleValidator<'a> {
    fn on_start(&mut self) {
        self.feed_if_clean(&StreamChunk::Start);
    }

    fn on_chunk(&mut self, chunk: &StreamChunk) {
        self.feed_if_clean(chunk);
    }

    fn on_complete(&mut self, chunk: &StreamChunk) {
        self.feed_if_clean(chunk);
    }

    fn on_error(&mut self, chunk: &StreamChunk) {
        self.feed_if_clean(chunk);
    }
}

fn violation(message: &'static str) -> CoreError {
    CoreError::new(ErrorKind::StreamLifecycleViolation, codes::STREAM_LIFECYCLE_VIOLATION, message)
}

/// Bounded I/O capture recorded on every attempt (spec §6 `IOCapture`).
#[derive(Clone, Debug)]
pub struct CapturedPayload {
    pub mode: IoCaptureMode,
    pub data: String,
}

fn capture(payload: Option<&str>, capture_cfg: &IoCapture) -> Option<CapturedPayload> {
    let payload = payload?;
    let data = match capture_cfg.mode {
        IoCaptureMode::Redacted => "<redacted>".to_string(),
        IoCaptureMode::Hash => {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(payload.as_bytes()))
        }
        IoCaptureMode::Full => {
            let mut s = payload.to_string();
            s.truncate(capture_cfg.max_bytes);
            s
        }
    };
    Some(CapturedPayload {
        mode: capture_cfg.mode,
        data,
    })
}

/// One recorded attempt, written to the Stage-A recorder via
/// `AppendProviderInvocationAttempts` (spec §3 `ProviderAttempt` + §4.6).
#[derive(Clone, Debug)]
pub struct ProviderAttemptEvidence {
    pub provider_invocation_id: ProviderInvocationId,
    pub attempt: u32,
    pub provider_id: String,
    pub outcome_class: OutcomeClass,
    pub retryable: bool,
    pub retry_decision: RetryDecision,
    pub latency_ms: u64,
    pub backoff_ms: u64,
    pub streaming_used: bool,
    pub chunk_count: u32,
    pub bytes_out: u64,
    pub first_chunk_latency_ms: u64,
    pub event_id: String,
    pub runtime_ts_ms: u64,
    pub wall_ms: u64,
    pub runtime_sequence: u64,
    pub transport_sequence: u64,
    pub io_capture: Option<CapturedPayload>,
}

/// Control signal raised when the controller switches providers (spec
/// §4.6): fallback is distinguished only by `retry_decision` — the emitted
/// signal name stays `provider_switch` for both (spec §9 open question 2).
#[derive(Clone, Debug)]
pub struct ProviderSwitchSignal {
    pub kind: ControlSignalKind,
    pub from_provider: String,
    pub to_provider: String,
    pub reason: String,
}

/// Outcome of the full attempt loop across candidates (spec §4.6
/// `InvocationResult`).
#[derive(Clone, Debug)]
pub struct InvocationResult {
    pub provider_invocation_id: ProviderInvocationId,
    pub selected_provider: String,
    pub terminal_outcome_class: OutcomeClass,
    pub retry_decision: RetryDecision,
    pub attempts: Vec<ProviderAttemptEvidence>,
    pub switch_signals: Vec<ProviderSwitchSignal>,
}

/// Per-invocation knobs not carried by the shared [`InvocationControllerConfig`]:
/// the preferred provider (if any) and the adaptive actions this turn's plan
/// allows.
#[derive(Clone, Debug, Default)]
pub struct InvocationContext {
    pub preferred_provider: Option<String>,
    pub allowed_adaptive_actions: Vec<AdaptiveAction>,
    pub streaming_enabled: bool,
}

fn allows(ctx: &InvocationContext, action: AdaptiveAction) -> bool {
    ctx.allowed_adaptive_actions.contains(&action)
}

/// A `timeout` outcome, non-retryable by construction (spec §5: a deadline
/// expiry is a terminal signal for the attempt that hit it, not a transient
/// failure the attempt loop should retry on its own).
fn timeout_outcome(reason: &'static str) -> Outcome {
    Outcome {
        class: OutcomeClass::Timeout,
        retryable: false,
        circuit_open: false,
        backoff_ms: 0,
        reason: Some(reason.to_string()),
        status_code: None,
    }
}

fn invocation_deadline_outcome() -> Outcome {
    timeout_outcome("invocation_timeout_ms exceeded before attempt could start")
}

/// Runs one adapter call under a per-attempt deadline (spec §5
/// `attempt_timeout_ms`). An elapsed deadline is reported as a `timeout`
/// outcome rather than propagated as an error — the attempt loop treats it
/// like any other terminal-for-this-attempt outcome.
async fn invoke_with_attempt_deadline(
    adapter: &dyn Adapter,
    req: &InvocationRequest,
    attempt_deadline: Duration,
) -> Outcome {
    match tokio::time::timeout(attempt_deadline, adapter.invoke(req)).await {
        Ok((outcome, _raw)) => outcome,
        Err(_elapsed) => timeout_outcome("attempt_timeout_ms exceeded"),
    }
}

/// A [`StreamObserver`] that counts chunks/bytes and times the first chunk
/// relative to `on_start` (spec §3 `ProviderAttempt.{chunk_count, bytes_out,
/// first_chunk_latency_ms}`).
struct MetricsObserver {
    chunk_count: u32,
    bytes_out: u64,
    started_at: Option<Instant>,
    first_chunk_at: Option<Instant>,
}

impl MetricsObserver {
    fn new() -> Self {
        Self {
            chunk_count: 0,
            bytes_out: 0,
            started_at: None,
            first_chunk_at: None,
        }
    }

    fn first_chunk_latency_ms(&self) -> u64 {
        match (self.started_at, self.first_chunk_at) {
            (Some(start), Some(first)) => first.saturating_duration_since(start).as_millis() as u64,
            _ => 0,
        }
    }

    fn record_chunk(&mut self, bytes: u64) {
        self.chunk_count += 1;
        self.bytes_out += bytes;
        if self.first_chunk_at.is_none() {
            self.first_chunk_at = Some(Instant::now());
        }
    }
}

impl StreamObserver for MetricsObserver {
    fn on_start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    fn on_chunk(&mut self, chunk: &StreamChunk) {
        let bytes = match chunk {
            StreamChunk::TextDelta { text_delta, .. } => text_delta.len() as u64,
            StreamChunk::AudioBytes { audio_bytes, .. } => *audio_bytes as u64,
            _ => 0,
        };
        self.record_chunk(bytes);
    }

    fn on_complete(&mut self, chunk: &StreamChunk) {
        let bytes = match chunk {
            StreamChunk::Final { text_final: Some(text), .. } => text.len() as u64,
            _ => 0,
        };
        self.record_chunk(bytes);
    }

    fn on_error(&mut self, _chunk: &StreamChunk) {
        self.record_chunk(0);
    }
}

/// Outcome of one streaming attempt, carrying the metrics the attempt
/// recorder needs alongside the normalized [`Outcome`] (spec §4.6 streaming
/// path).
struct StreamingAttemptResult {
    outcome: Outcome,
    chunk_count: u32,
    bytes_out: u64,
    first_chunk_latency_ms: u64,
}

/// Runs one streaming adapter call under a per-attempt deadline, driving a
/// [`StreamLifecycleValidator`]-wrapped [`MetricsObserver`] (spec §4.6: "when
/// the adapter supports it and streaming is enabled, the controller drives
/// an observer receiving `Start`, zero-or-more chunks, and one terminal").
/// A lifecycle violation maps the attempt to `infrastructure_failure`,
/// matching the non-streaming deadline path's "expiry is a terminal signal,
/// not an error" treatment.
async fn invoke_streaming_attempt(
    adapter: &dyn StreamingAdapter,
    req: &InvocationRequest,
    attempt_deadline: Duration,
) -> StreamingAttemptResult {
    let mut metrics = MetricsObserver::new();
    let mut validator = StreamLifecycleValidator::new(&mut metrics);

    let outcome = match tokio::time::timeout(attempt_deadline, adapter.invoke_stream(req, &mut validator)).await {
        Ok((outcome, _raw)) => match validator.into_violation() {
            Some(err) => Outcome {
                class: OutcomeClass::InfrastructureFailure,
                retryable: false,
                circuit_open: false,
                backoff_ms: 0,
                reason: Some(err.message().to_string()),
                status_code: None,
            },
            None => outcome,
        },
        Err(_elapsed) => {
            drop(validator);
            timeout_outcome("attempt_timeout_ms exceeded")
        }
    };

    StreamingAttemptResult {
        outcome,
        chunk_count: metrics.chunk_count,
        bytes_out: metrics.bytes_out,
        first_chunk_latency_ms: metrics.first_chunk_latency_ms(),
    }
}

/// Drives the attempt loop for one [`ProviderInvocationId`] across the
/// registry's deterministic candidate list (spec §4.6).
///
/// Candidate/attempt selection:
/// - up to `MaxAttemptsPerProvider` attempts per provider;
/// - `retryable && !circuit_open` -> retry same provider;
/// - `circuit_open || !retryable`, `provider_switch` allowed, candidates
///   remain -> next candidate, attempt index resets to 1;
/// - `fallback` allowed and candidates exhausted -> last candidate attempted
///   once more, tagged `retry_decision = Fallback`;
/// - otherwise terminal with the last attempt's outcome class.
pub async fn invoke(
    registry: &ProviderRegistry,
    modality: Modality,
    invocation_id: ProviderInvocationId,
    req: &InvocationRequest,
    ctx: &InvocationContext,
    config: &InvocationControllerConfig,
    io_capture: &IoCapture,
    clock: &dyn Clock,
) -> Result<InvocationResult, CoreError> {
    let candidates = registry.candidates(
        modality,
        ctx.preferred_provider.as_deref(),
        config.max_candidate_providers as usize,
    );
    if candidates.is_empty() {
        return Err(CoreError::new(
            ErrorKind::ProviderExhausted,
            codes::PROVIDER_EXHAUSTED,
            "no candidate providers available for modality",
        ));
    }

    let mut attempts: Vec<ProviderAttemptEvidence> = Vec::new();
    let mut switch_signals: Vec<ProviderSwitchSignal> = Vec::new();
    let mut candidate_idx = 0usize;
    let mut fallback_used = false;
    let invocation_started = Instant::now();
    let invocation_deadline = Duration::from_millis(config.invocation_timeout_ms);

    loop {
        let candidate = &candidates[candidate_idx];
        let mut attempt_no = 1u32;
        loop {
            let attempt_deadline = Duration::from_millis(config.attempt_timeout_ms);
            let attempt_start = clock.now();
            let wall_start = Instant::now();
            let streaming_adapter =
                if ctx.streaming_enabled && req.streaming_requested { candidate.adapter.as_streaming() } else { None };

            let (outcome, streaming_used, chunk_count, bytes_out, first_chunk_latency_ms) =
                if invocation_started.elapsed() >= invocation_deadline {
                    (invocation_deadline_outcome(), false, 0, 0, 0)
                } else if let Some(streaming_adapter) = streaming_adapter {
                    let result = invoke_streaming_attempt(streaming_adapter, req, attempt_deadline).await;
                    (result.outcome, true, result.chunk_count, result.bytes_out, result.first_chunk_latency_ms)
                } else {
                    let outcome = invoke_with_attempt_deadline(candidate.adapter.as_ref(), req, attempt_deadline).await;
                    (outcome, false, 0, 0, 0)
                };
            let latency_ms = wall_start.elapsed().as_millis() as u64;

            let retry_decision_for_this_attempt = if fallback_used {
                RetryDecision::Fallback
            } else {
                RetryDecision::None
            };
            let evidence = ProviderAttemptEvidence {
                provider_invocation_id: invocation_id.clone(),
                attempt: attempt_no,
                provider_id: candidate.provider_id.clone(),
                outcome_class: outcome.class,
                retryable: outcome.retryable,
                retry_decision: retry_decision_for_this_attempt,
                latency_ms,
                backoff_ms: outcome.backoff_ms,
                streaming_used,
                chunk_count,
                bytes_out,
                first_chunk_latency_ms,
                event_id: format!("{}-{}-{}", invocation_id, candidate.provider_id, attempt_no),
                runtime_ts_ms: attempt_start.as_millis(),
                wall_ms: attempt_start.as_millis(),
                runtime_sequence: attempts.len() as u64,
                transport_sequence: attempts.len() as u64,
                io_capture: capture(req.payload_ref.as_deref(), io_capture),
            };
            attempts.push(evidence);

            if outcome.class == OutcomeClass::Success {
                return Ok(InvocationResult {
                    provider_invocation_id: invocation_id,
                    selected_provider: candidate.provider_id.clone(),
                    terminal_outcome_class: OutcomeClass::Success,
                    retry_decision: retry_decision_for_this_attempt,
                    attempts,
                    switch_signals,
                });
            }

            let can_retry_same_provider =
                outcome.retryable && !outcome.circuit_open && attempt_no < config.max_attempts_per_provider;
            if can_retry_same_provider {
                attempt_no += 1;
                attempts.last_mut().unwrap().retry_decision = RetryDecision::Retry;
                continue;
            }

            let has_more_candidates = candidate_idx + 1 < candidates.len();
            let should_switch = (outcome.circuit_open || !outcome.retryable) && allows(ctx, AdaptiveAction::ProviderSwitch);
            if should_switch && has_more_candidates {
                attempts.last_mut().unwrap().retry_decision = RetryDecision::ProviderSwitch;
                switch_signals.push(ProviderSwitchSignal {
                    kind: ControlSignalKind::ProviderSwitch,
                    from_provider: candidate.provider_id.clone(),
                    to_provider: candidates[candidate_idx + 1].provider_id.clone(),
                    reason: outcome.reason.clone().unwrap_or_else(|| "provider_switch".to_string()),
                });
                candidate_idx += 1;
                break;
            }

            let exhausted = !has_more_candidates;
            if exhausted && !fallback_used && allows(ctx, AdaptiveAction::Fallback) {
                attempts.last_mut().unwrap().retry_decision = RetryDecision::Fallback;
                switch_signals.push(ProviderSwitchSignal {
                    kind: ControlSignalKind::ProviderSwitch,
                    from_provider: candidate.provider_id.clone(),
                    to_provider: candidates[candidate_idx].provider_id.clone(),
                    reason: "fallback".to_string(),
                });
                fallback_used = true;
                attempt_no = 1;
                continue;
            }

            return Ok(InvocationResult {
                provider_invocation_id: invocation_id,
                selected_provider: candidate.provider_id.clone(),
                terminal_outcome_class: outcome.class,
                retry_decision: attempts.last().unwrap().retry_decision,
                attempts,
                switch_signals,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::registry::ProviderEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedAdapter {
        id: String,
        script: Vec<Outcome>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Adapter for ScriptedAdapter {
        fn provider_id(&self) -> &str {
            &self.id
        }
        fn modality(&self) -> Modality {
            Modality::Stt
        }
        async fn invoke(&self, _req: &InvocationRequest) -> (Outcome, Option<String>) {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self.script.get(idx).cloned().unwrap_or_else(|| self.script.last().unwrap().clone());
            (outcome, None)
        }
    }

    fn success() -> Outcome {
        Outcome {
            class: OutcomeClass::Success,
            retryable: false,
            circuit_open: false,
            backoff_ms: 0,
            reason: None,
            status_code: None,
        }
    }

    fn overload_circuit_open() -> Outcome {
        Outcome {
            class: OutcomeClass::Overload,
            retryable: false,
            circuit_open: true,
            backoff_ms: 50,
            reason: Some("circuit open".into()),
            status_code: Some(503),
        }
    }

    fn registry_with(entries: Vec<(&str, Vec<Outcome>)>) -> ProviderRegistry {
        let mut out = Vec::new();
        for (i, (id, script)) in entries.into_iter().enumerate() {
            out.push(ProviderEntry {
                provider_id: id.to_string(),
                modality: Modality::Stt,
                adapter: Arc::new(ScriptedAdapter {
                    id: id.to_string(),
                    script,
                    calls: AtomicUsize::new(0),
                }),
                catalog_rank: i as u32,
            });
        }
        ProviderRegistry::new(out)
    }

    #[tokio::test]
    async fn provider_switch_then_success_s3() {
        let registry = registry_with(vec![
            ("stt-a", vec![overload_circuit_open()]),
            ("stt-b", vec![success()]),
        ]);
        let ctx = InvocationContext {
            allowed_adaptive_actions: vec![AdaptiveAction::ProviderSwitch],
            ..Default::default()
        };
        let result = invoke(
            &registry,
            Modality::Stt,
            ProviderInvocationId::parse("inv-1").unwrap(),
            &InvocationRequest::default(),
            &ctx,
            &InvocationControllerConfig::default(),
            &IoCapture::default(),
            &crate::time::SystemClock::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.selected_provider, "stt-b");
        assert_eq!(result.retry_decision, RetryDecision::None);
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.switch_signals.len(), 1);
    }

    #[tokio::test]
    async fn retries_same_provider_when_retryable() {
        let registry = registry_with(vec![(
            "stt-a",
            vec![
                Outcome {
                    class: OutcomeClass::Timeout,
                    retryable: true,
                    circuit_open: false,
                    backoff_ms: 10,
                    reason: None,
                    status_code: None,
                },
                success(),
            ],
        )]);
        let result = invoke(
            &registry,
            Modality::Stt,
            ProviderInvocationId::parse("inv-1").unwrap(),
            &InvocationRequest::default(),
            &InvocationContext::default(),
            &InvocationControllerConfig::default(),
            &IoCapture::default(),
            &crate::time::SystemClock::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.terminal_outcome_class, OutcomeClass::Success);
    }

    #[tokio::test]
    async fn fallback_used_when_candidates_exhausted() {
        let registry = registry_with(vec![("stt-a", vec![overload_circuit_open()])]);
        let ctx = InvocationContext {
            allowed_adaptive_actions: vec![AdaptiveAction::Fallback],
            ..Default::default()
        };
        let result = invoke(
            &registry,
            Modality::Stt,
            ProviderInvocationId::parse("inv-1").unwrap(),
            &InvocationRequest::default(),
            &ctx,
            &InvocationControllerConfig {
                max_attempts_per_provider: 1,
                ..InvocationControllerConfig::default()
            },
            &IoCapture::default(),
            &crate::time::SystemClock::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.retry_decision, RetryDecision::Fallback);
        assert_eq!(result.attempts.len(), 2);
    }

    struct SlowAdapter {
        id: String,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl Adapter for SlowAdapter {
        fn provider_id(&self) -> &str {
            &self.id
        }
        fn modality(&self) -> Modality {
            Modality::Stt
        }
        async fn invoke(&self, _req: &InvocationRequest) -> (Outcome, Option<String>) {
            tokio::time::sleep(self.delay).await;
            (success(), None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_exceeding_attempt_timeout_is_reported_as_timeout() {
        let registry = ProviderRegistry::new(vec![ProviderEntry {
            provider_id: "stt-a".to_string(),
            modality: Modality::Stt,
            adapter: Arc::new(SlowAdapter {
                id: "stt-a".to_string(),
                delay: std::time::Duration::from_millis(100),
            }),
            catalog_rank: 0,
        }]);
        let result = invoke(
            &registry,
            Modality::Stt,
            ProviderInvocationId::parse("inv-1").unwrap(),
            &InvocationRequest::default(),
            &InvocationContext::default(),
            &InvocationControllerConfig {
                attempt_timeout_ms: 10,
                max_attempts_per_provider: 1,
                ..InvocationControllerConfig::default()
            },
            &IoCapture::default(),
            &crate::time::SystemClock::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.terminal_outcome_class, OutcomeClass::Timeout);
        assert!(!result.attempts[0].retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn invocation_deadline_short_circuits_further_attempts() {
        let registry = registry_with(vec![(
            "stt-a",
            vec![Outcome {
                class: OutcomeClass::Timeout,
                retryable: true,
                circuit_open: false,
                backoff_ms: 0,
                reason: None,
                status_code: None,
            }],
        )]);
        let result = invoke(
            &registry,
            Modality::Stt,
            ProviderInvocationId::parse("inv-1").unwrap(),
            &InvocationRequest::default(),
            &InvocationContext::default(),
            &InvocationControllerConfig {
                invocation_timeout_ms: 0,
                max_attempts_per_provider: 5,
                ..InvocationControllerConfig::default()
            },
            &IoCapture::default(),
            &crate::time::SystemClock::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.terminal_outcome_class, OutcomeClass::Timeout);
        assert_eq!(result.attempts.len(), 1);
    }

    struct RecordingObserver {
        starts: u32,
        chunks: u32,
        completes: u32,
        errors: u32,
    }

    impl StreamObserver for RecordingObserver {
        fn on_start(&mut self) {
            self.starts += 1;
        }
        fn on_chunk(&mut self, _chunk: &StreamChunk) {
            self.chunks += 1;
        }
        fn on_complete(&mut self, _chunk: &StreamChunk) {
            self.completes += 1;
        }
        fn on_error(&mut self, _chunk: &StreamChunk) {
            self.errors += 1;
        }
    }

    #[test]
    fn stream_lifecycle_accepts_well_formed_sequence() {
        let mut observer = RecordingObserver {
            starts: 0,
            chunks: 0,
            completes: 0,
            errors: 0,
        };
        let validator = StreamLifecycleValidator::new(&mut observer);
        let chunks = vec![
            StreamChunk::Start,
            StreamChunk::TextDelta {
                sequence: 1,
                text_delta: "hel".into(),
            },
            StreamChunk::TextDelta {
                sequence: 2,
                text_delta: "lo".into(),
            },
            StreamChunk::Final {
                sequence: 3,
                text_final: Some("hello".into()),
            },
        ];
        validator.drive(&chunks).unwrap();
        assert_eq!(observer.starts, 1);
        assert_eq!(observer.chunks, 2);
        assert_eq!(observer.completes, 1);
    }

    #[test]
    fn stream_lifecycle_rejects_chunk_before_start() {
        let mut observer = RecordingObserver {
            starts: 0,
            chunks: 0,
            completes: 0,
            errors: 0,
        };
        let validator = StreamLifecycleValidator::new(&mut observer);
        let chunks = vec![StreamChunk::TextDelta {
            sequence: 1,
            text_delta: "x".into(),
        }];
        assert!(validator.drive(&chunks).is_err());
    }

    #[test]
    fn stream_lifecycle_rejects_non_monotonic_sequence() {
        let mut observer = RecordingObserver {
            starts: 0,
            chunks: 0,
            completes: 0,
            errors: 0,
        };
        let validator = StreamLifecycleValidator::new(&mut observer);
        let chunks = vec![
            StreamChunk::Start,
            StreamChunk::TextDelta {
                sequence: 2,
                text_delta: "a".into(),
            },
            StreamChunk::TextDelta {
                sequence: 1,
                text_delta: "b".into(),
            },
        ];
        assert!(validator.drive(&chunks).is_err());
    }

    #[test]
    fn stream_lifecycle_rejects_chunk_after_terminal() {
        let mut observer = RecordingObserver {
            starts: 0,
            chunks: 0,
            completes: 0,
            errors: 0,
        };
        let validator = StreamLifecycleValidator::new(&mut observer);
        let chunks = vec![
            StreamChunk::Start,
            StreamChunk::Final {
                sequence: 1,
                text_final: Some("done".into()),
            },
            StreamChunk::TextDelta {
                sequence: 2,
                text_delta: "late".into(),
            },
        ];
        assert!(validator.drive(&chunks).is_err());
    }

    struct ScriptedStreamingAdapter {
        id: String,
        chunks: Vec<StreamChunk>,
        violate: bool,
    }

    #[async_trait]
    impl Adapter for ScriptedStreamingAdapter {
        fn provider_id(&self) -> &str {
            &self.id
        }
        fn modality(&self) -> Modality {
            Modality::Stt
        }
        async fn invoke(&self, _req: &InvocationRequest) -> (Outcome, Option<String>) {
            (success(), None)
        }
        fn as_streaming(&self) -> Option<&dyn StreamingAdapter> {
            Some(self)
        }
    }

    #[async_trait]
    impl StreamingAdapter for ScriptedStreamingAdapter {
        async fn invoke_stream(
            &self,
            _req: &InvocationRequest,
            observer: &mut dyn StreamObserver,
        ) -> (Outcome, Option<String>) {
            if self.violate {
                observer.on_chunk(&StreamChunk::TextDelta {
                    sequence: 1,
                    text_delta: "oops".into(),
                });
                return (success(), None);
            }
            for chunk in &self.chunks {
                match chunk {
                    StreamChunk::Start => observer.on_start(),
                    StreamChunk::Final { .. } => observer.on_complete(chunk),
                    StreamChunk::Error { .. } => observer.on_error(chunk),
                    other => observer.on_chunk(other),
                }
            }
            (success(), None)
        }
    }

    #[tokio::test]
    async fn streaming_attempt_reports_metrics_through_invoke() {
        let registry = ProviderRegistry::new(vec![ProviderEntry {
            provider_id: "stt-a".to_string(),
            modality: Modality::Stt,
            adapter: Arc::new(ScriptedStreamingAdapter {
                id: "stt-a".to_string(),
                chunks: vec![
                    StreamChunk::Start,
                    StreamChunk::TextDelta {
                        sequence: 1,
                        text_delta: "hel".into(),
                    },
                    StreamChunk::TextDelta {
                        sequence: 2,
                        text_delta: "lo".into(),
                    },
                    StreamChunk::Final {
                        sequence: 3,
                        text_final: Some("hello".into()),
                    },
                ],
                violate: false,
            }),
            catalog_rank: 0,
        }]);
        let ctx = InvocationContext {
            streaming_enabled: true,
            ..Default::default()
        };
        let req = InvocationRequest {
            streaming_requested: true,
            ..Default::default()
        };
        let result = invoke(
            &registry,
            Modality::Stt,
            ProviderInvocationId::parse("inv-1").unwrap(),
            &req,
            &ctx,
            &InvocationControllerConfig::default(),
            &IoCapture::default(),
            &crate::time::SystemClock::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.terminal_outcome_class, OutcomeClass::Success);
        let attempt = &result.attempts[0];
        assert!(attempt.streaming_used);
        assert_eq!(attempt.chunk_count, 3);
        assert_eq!(attempt.bytes_out, 10);
    }

    #[tokio::test]
    async fn streaming_disabled_falls_back_to_plain_invoke() {
        let registry = ProviderRegistry::new(vec![ProviderEntry {
            provider_id: "stt-a".to_string(),
            modality: Modality::Stt,
            adapter: Arc::new(ScriptedStreamingAdapter {
                id: "stt-a".to_string(),
                chunks: vec![StreamChunk::Start],
                violate: false,
            }),
            catalog_rank: 0,
        }]);
        let req = InvocationRequest {
            streaming_requested: true,
            ..Default::default()
        };
        let result = invoke(
            &registry,
            Modality::Stt,
            ProviderInvocationId::parse("inv-1").unwrap(),
            &req,
            &InvocationContext::default(),
            &InvocationControllerConfig::default(),
            &IoCapture::default(),
            &crate::time::SystemClock::new(),
        )
        .await
        .unwrap();

        assert!(!result.attempts[0].streaming_used);
        assert_eq!(result.attempts[0].chunk_count, 0);
    }

    #[tokio::test]
    async fn streaming_lifecycle_violation_maps_to_infrastructure_failure() {
        let registry = ProviderRegistry::new(vec![ProviderEntry {
            provider_id: "stt-a".to_string(),
            modality: Modality::Stt,
            adapter: Arc::new(ScriptedStreamingAdapter {
                id: "stt-a".to_string(),
                chunks: vec![],
                violate: true,
            }),
            catalog_rank: 0,
        }]);
        let ctx = InvocationContext {
            streaming_enabled: true,
            ..Default::default()
        };
        let req = InvocationRequest {
            streaming_requested: true,
            ..Default::default()
        };
        let result = invoke(
            &registry,
            Modality::Stt,
            ProviderInvocationId::parse("inv-1").unwrap(),
            &req,
            &ctx,
            &InvocationControllerConfig::default(),
            &IoCapture::default(),
            &crate::time::SystemClock::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.terminal_outcome_class, OutcomeClass::InfrastructureFailure);
        assert!(result.attempts[0].streaming_used);
    }
}
