//! Configuration surface (spec §6 closed enumeration), expanded with
//! validate-then-freeze construction in the style of a configuration
//! builder: defaults match the spec exactly, and out-of-range values fail
//! fast at construction rather than at first use.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorKind};

fn require_at_least(value: usize, min: usize, field: &'static str) -> Result<(), CoreError> {
    if value < min {
        return Err(CoreError::new(
            ErrorKind::InvalidInput,
            "config.out_of_range",
            format!("`{field}` must be >= {min}, got {value}"),
        ));
    }
    Ok(())
}

/// Bounded capacities for the Stage-A baseline recorder (C10).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StageAConfig {
    pub baseline_capacity: usize,
    pub detail_capacity: usize,
    pub attempt_capacity: usize,
    pub handoff_capacity: usize,
    pub invocation_snapshot_cap: usize,
    pub enable_invocation_snapshot: bool,
}

impl Default for StageAConfig {
    fn default() -> Self {
        Self {
            baseline_capacity: 128,
            detail_capacity: 512,
            attempt_capacity: 1024,
            handoff_capacity: 1024,
            invocation_snapshot_cap: 1024,
            enable_invocation_snapshot: false,
        }
    }
}

impl StageAConfig {
    pub fn validate(self) -> Result<Self, CoreError> {
        require_at_least(self.baseline_capacity, 1, "BaselineCapacity")?;
        require_at_least(self.detail_capacity, 1, "DetailCapacity")?;
        require_at_least(self.attempt_capacity, 1, "AttemptCapacity")?;
        require_at_least(self.handoff_capacity, 1, "HandoffCapacity")?;
        require_at_least(self.invocation_snapshot_cap, 1, "InvocationSnapshotCap")?;
        Ok(self)
    }
}

/// Per-modality streaming defaults used by [`InvocationControllerConfig`].
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StreamingDefaults {
    pub stt: bool,
    pub llm: bool,
    pub tts: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InvocationControllerConfig {
    pub max_attempts_per_provider: u32,
    pub max_candidate_providers: u32,
    pub attempt_timeout_ms: u64,
    pub invocation_timeout_ms: u64,
    pub streaming_defaults: StreamingDefaults,
}

impl Default for InvocationControllerConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_provider: 3,
            max_candidate_providers: 5,
            attempt_timeout_ms: 8_000,
            invocation_timeout_ms: 30_000,
            streaming_defaults: StreamingDefaults {
                stt: true,
                llm: true,
                tts: true,
            },
        }
    }
}

impl InvocationControllerConfig {
    pub fn validate(self) -> Result<Self, CoreError> {
        require_at_least(self.max_attempts_per_provider as usize, 1, "MaxAttemptsPerProvider")?;
        require_at_least(self.max_candidate_providers as usize, 1, "MaxCandidateProviders")?;
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StreamingHandoffPolicy {
    pub enabled: bool,
    pub stt_to_llm_enabled: bool,
    pub llm_to_tts_enabled: bool,
    pub min_partial_chars: usize,
    pub max_pending_revisions: usize,
    pub coalesce_latest_only: bool,
}

impl Default for StreamingHandoffPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            stt_to_llm_enabled: true,
            llm_to_tts_enabled: true,
            min_partial_chars: 8,
            max_pending_revisions: 4,
            coalesce_latest_only: true,
        }
    }
}

impl StreamingHandoffPolicy {
    pub fn validate(self) -> Result<Self, CoreError> {
        require_at_least(self.min_partial_chars, 1, "MinPartialChars")?;
        require_at_least(self.max_pending_revisions, 1, "MaxPendingRevisions")?;
        Ok(self)
    }
}

/// A single expected divergence, used by [`DivergencePolicy`] to whitelist
/// specific (class, scope) pairs (spec §4.11).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpectedDivergence {
    pub class: crate::replay::DivergenceClass,
    pub scope: String,
    pub approved: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DivergencePolicy {
    pub timing_tolerance_ms: u64,
    pub expected: Vec<ExpectedDivergence>,
}

impl Default for DivergencePolicy {
    fn default() -> Self {
        Self {
            timing_tolerance_ms: 250,
            expected: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SloThresholds {
    pub turn_open_p95_ms: u64,
    pub first_output_p95_ms: u64,
    pub cancel_fence_p95_ms: u64,
    pub baseline_completeness_min: f64,
    pub terminal_correctness_min: f64,
}

impl Default for SloThresholds {
    fn default() -> Self {
        Self {
            turn_open_p95_ms: 300,
            first_output_p95_ms: 1_200,
            cancel_fence_p95_ms: 150,
            baseline_completeness_min: 0.999,
            terminal_correctness_min: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoCaptureMode {
    Redacted,
    Hash,
    Full,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IoCapture {
    pub mode: IoCaptureMode,
    pub max_bytes: usize,
}

impl Default for IoCapture {
    fn default() -> Self {
        Self {
            mode: IoCaptureMode::Redacted,
            max_bytes: 4096,
        }
    }
}

impl IoCapture {
    pub fn validate(self) -> Result<Self, CoreError> {
        require_at_least(self.max_bytes, 256, "max_bytes")?;
        Ok(self)
    }
}

/// Determines how bundle-resolution failure (`TurnStartBundleResolutionFailed`)
/// maps to a pre-turn decision (spec §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanFailurePolicy {
    Defer,
    Reject,
}

impl Default for PlanFailurePolicy {
    fn default() -> Self {
        PlanFailurePolicy::Defer
    }
}

/// Root configuration assembled once per host process and shared (`Arc`)
/// across sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelConfig {
    pub stage_a: StageAConfig,
    pub invocation: InvocationControllerConfig,
    pub handoff: StreamingHandoffPolicy,
    pub divergence: DivergencePolicy,
    pub slo: SloThresholds,
    pub io_capture: IoCapture,
    pub plan_failure_policy: PlanFailurePolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            stage_a: StageAConfig::default(),
            invocation: InvocationControllerConfig::default(),
            handoff: StreamingHandoffPolicy::default(),
            divergence: DivergencePolicy::default(),
            slo: SloThresholds::default(),
            io_capture: IoCapture::default(),
            plan_failure_policy: PlanFailurePolicy::default(),
        }
    }
}

impl KernelConfig {
    pub fn validate(self) -> Result<Self, CoreError> {
        Ok(Self {
            stage_a: self.stage_a.validate()?,
            invocation: self.invocation.validate()?,
            handoff: self.handoff.validate()?,
            divergence: self.divergence,
            slo: self.slo,
            io_capture: self.io_capture.validate()?,
            plan_failure_policy: self.plan_failure_policy,
        })
    }
}
