//! Backend traits consumed by the bundle resolver (C2). Every backend is
//! optional from the host's perspective — a host may wire `None` for any of
//! them, which the resolver treats identically to the backend erroring (the
//! deterministic fallback fires either way).

use async_trait::async_trait;

use crate::error::CoreError;
use crate::event::ControlSignalKind;
use crate::ids::SessionId;

#[derive(Clone, Debug)]
pub struct RolloutInput {
    pub session_id: SessionId,
    pub requested_pipeline_version: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RolloutResolution {
    pub pipeline_version: String,
    pub execution_profile: String,
    pub snapshot_ref: String,
}

#[async_trait]
pub trait Rollout: Send + Sync {
    async fn resolve_pipeline_version(
        &self,
        input: &RolloutInput,
    ) -> Result<RolloutResolution, CoreError>;
}

#[derive(Clone, Debug)]
pub struct PipelineRecord {
    pub pipeline_version: String,
    pub default_execution_profile: String,
    pub graph_definition_ref: String,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn resolve_pipeline_record(&self, version: &str) -> Result<PipelineRecord, CoreError>;
}

#[derive(Clone, Debug)]
pub struct RoutingViewInput {
    pub session_id: SessionId,
    pub pipeline_version: String,
}

#[derive(Clone, Debug)]
pub struct RoutingViewSnapshot {
    pub routing_snapshot_ref: String,
    pub admission_policy_snapshot_ref: String,
    pub abi_compat_snapshot_ref: String,
}

#[async_trait]
pub trait RoutingView: Send + Sync {
    async fn get_snapshot(&self, input: &RoutingViewInput) -> Result<RoutingViewSnapshot, CoreError>;
}

/// The four canonical adaptive actions, always normalized to this order
/// (spec §4.2) regardless of the order the policy backend returns them in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum AdaptiveAction {
    Retry,
    ProviderSwitch,
    Fallback,
    Degrade,
}

impl AdaptiveAction {
    pub fn canonical_rank(&self) -> u8 {
        match self {
            AdaptiveAction::Retry => 0,
            AdaptiveAction::ProviderSwitch => 1,
            AdaptiveAction::Fallback => 2,
            AdaptiveAction::Degrade => 3,
        }
    }
}

/// Sorts and dedups a set of adaptive actions into canonical order.
pub fn canonicalize_adaptive_actions(mut actions: Vec<AdaptiveAction>) -> Vec<AdaptiveAction> {
    actions.sort_by_key(|a| a.canonical_rank());
    actions.dedup();
    actions
}

#[derive(Clone, Debug)]
pub struct PolicyInput {
    pub session_id: SessionId,
    pub pipeline_version: String,
}

#[derive(Clone, Debug)]
pub struct PolicyResolution {
    pub allowed_adaptive_actions: Vec<AdaptiveAction>,
    pub snapshot_ref: String,
}

#[async_trait]
pub trait Policy: Send + Sync {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyResolution, CoreError>;
}

#[derive(Clone, Debug)]
pub struct ProviderHealthInput {
    pub pipeline_version: String,
}

#[derive(Clone, Debug)]
pub struct ProviderHealthSnapshot {
    pub snapshot_ref: String,
}

#[async_trait]
pub trait ProviderHealth: Send + Sync {
    async fn get_snapshot(
        &self,
        input: &ProviderHealthInput,
    ) -> Result<ProviderHealthSnapshot, CoreError>;
}

/// Pre-turn admission outcome kinds the admission backend may return
/// (joined with guard-produced outcomes in C3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admit,
    Defer,
    Reject,
    Shed,
}

#[derive(Clone, Debug)]
pub struct AdmissionInput {
    pub session_id: SessionId,
    pub pipeline_version: String,
}

#[async_trait]
pub trait Admission: Send + Sync {
    async fn evaluate(&self, input: &AdmissionInput) -> Result<AdmissionOutcome, CoreError>;
}

#[derive(Clone, Debug)]
pub struct LeaseInput {
    pub session_id: SessionId,
}

#[derive(Clone, Debug)]
pub struct LeaseResolution {
    pub lease_ref: String,
    pub valid: bool,
}

#[async_trait]
pub trait Lease: Send + Sync {
    async fn resolve(&self, input: &LeaseInput) -> Result<LeaseResolution, CoreError>;
}

#[derive(Clone, Debug)]
pub struct GraphCompileInput {
    pub graph_definition_ref: String,
}

#[derive(Clone, Debug)]
pub struct GraphCompileResult {
    pub compiled_ref: String,
}

#[async_trait]
pub trait GraphCompiler: Send + Sync {
    async fn compile(&self, input: &GraphCompileInput) -> Result<GraphCompileResult, CoreError>;
}

/// Non-blocking emission surface for control signals raised by the bundle
/// resolver's fallbacks (e.g. none today, reserved for future StaleSnapshot
/// notifications) — kept symmetric with the rest of the kernel's signal
/// vocabulary.
pub trait ControlSignalSink: Send + Sync {
    fn emit(&self, kind: ControlSignalKind, session_id: &SessionId, reason: Option<&str>);
}
