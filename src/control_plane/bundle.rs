//! Resolves the per-turn [`TurnStartBundle`] from up to five independent
//! backends (spec §4.2). Each backend's failure (or absence — a host may
//! wire `None`) degrades deterministically to a named default rather than
//! aborting the whole resolution; only a failing [`Registry`] call, or any
//! backend surfacing a stale-snapshot condition, forces a hard outcome.

use std::sync::Arc;

use crate::control_plane::backends::{
    self, AdaptiveAction, PipelineRecord, Policy, PolicyInput, ProviderHealth,
    ProviderHealthInput, Registry, Rollout, RolloutInput, RoutingView, RoutingViewInput,
};
use crate::error::{CoreError, ErrorKind};
use crate::ids::SessionId;

const FALLBACK_VERSION_RESOLUTION_SNAPSHOT: &str = "version-resolution/v1";
const FALLBACK_ROUTING_SNAPSHOT: &str = "routing-view/v1";
const FALLBACK_ADMISSION_POLICY_SNAPSHOT: &str = "admission-policy/v1";
const FALLBACK_ABI_COMPAT_SNAPSHOT: &str = "abi-compat/v1";
const FALLBACK_ADAPTIVE_POLICY_SNAPSHOT: &str = "adaptive-actions-policy/v1";
const FALLBACK_PROVIDER_HEALTH_SNAPSHOT: &str = "provider-health/v1";

/// References to the six independent snapshots a resolved bundle is built
/// from, recorded verbatim into the baseline (C10) so replay can compare
/// them scope-by-scope (C11).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotProvenance {
    pub version_resolution: String,
    pub routing: String,
    pub admission_policy: String,
    pub abi_compat: String,
    pub adaptive_policy: String,
    pub provider_health: String,
}

/// Fully resolved, immutable per-turn control-plane bundle.
#[derive(Clone, Debug)]
pub struct TurnStartBundle {
    pub pipeline_version: String,
    pub execution_profile: String,
    pub graph_definition_ref: String,
    pub allowed_adaptive_actions: Vec<AdaptiveAction>,
    pub snapshot_provenance: SnapshotProvenance,
}

/// Optional backend collaborators. Any field left `None` is treated
/// identically to that backend returning an error: the deterministic
/// fallback for that field fires. `registry` is the one mandatory
/// collaborator — there is no fallback pipeline record.
#[derive(Clone)]
pub struct ControlPlaneBackends {
    pub rollout: Option<Arc<dyn Rollout>>,
    pub registry: Arc<dyn Registry>,
    pub routing_view: Option<Arc<dyn RoutingView>>,
    pub policy: Option<Arc<dyn Policy>>,
    pub provider_health: Option<Arc<dyn ProviderHealth>>,
}

impl std::fmt::Debug for ControlPlaneBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneBackends").finish_non_exhaustive()
    }
}

/// Why bundle resolution did not produce a usable [`TurnStartBundle`].
#[derive(Debug)]
pub enum BundleResolutionFailure {
    /// A stale-snapshot condition was detected on any backend call. Per
    /// spec §4.2 this always maps to a pre-turn `Defer`, overriding
    /// `plan_failure_policy`.
    StaleSnapshot,
    /// The registry call failed outright, or the resolved execution profile
    /// is anything other than `"simple"`. Maps to `plan_failure_policy`
    /// (`Defer` or `Reject`).
    ResolutionFailed(CoreError),
}

/// Resolves a [`TurnStartBundle`] for `session_id` (spec §4.2).
///
/// The registry is the only backend without a default fallback: a record
/// must exist for `requested_pipeline_version` (or whatever the rollout
/// backend resolves) for the bundle to be usable at all.
pub async fn resolve_turn_start_bundle(
    backends: &ControlPlaneBackends,
    session_id: &SessionId,
    requested_pipeline_version: Option<String>,
) -> Result<TurnStartBundle, BundleResolutionFailure> {
    let rollout_input = RolloutInput {
        session_id: session_id.clone(),
        requested_pipeline_version,
    };

    let (pipeline_version, execution_profile_hint, version_resolution_snapshot) =
        match &backends.rollout {
            Some(rollout) => match rollout.resolve_pipeline_version(&rollout_input).await {
                Ok(resolution) => (
                    Some(resolution.pipeline_version),
                    Some(resolution.execution_profile),
                    resolution.snapshot_ref,
                ),
                Err(err) if err.is_stale_snapshot() => {
                    return Err(BundleResolutionFailure::StaleSnapshot);
                }
                Err(_) => (None, None, FALLBACK_VERSION_RESOLUTION_SNAPSHOT.to_string()),
            },
            None => (None, None, FALLBACK_VERSION_RESOLUTION_SNAPSHOT.to_string()),
        };

    let record: PipelineRecord = {
        let version_hint = pipeline_version.clone().unwrap_or_default();
        match backends.registry.resolve_pipeline_record(&version_hint).await {
            Ok(record) => record,
            Err(err) if err.is_stale_snapshot() => return Err(BundleResolutionFailure::StaleSnapshot),
            Err(err) => return Err(BundleResolutionFailure::ResolutionFailed(err)),
        }
    };

    let pipeline_version = pipeline_version.unwrap_or_else(|| record.pipeline_version.clone());
    let execution_profile = execution_profile_hint.unwrap_or_else(|| record.default_execution_profile.clone());
    const SUPPORTED_EXECUTION_PROFILE: &str = "simple";
    if execution_profile != SUPPORTED_EXECUTION_PROFILE {
        return Err(BundleResolutionFailure::ResolutionFailed(CoreError::new(
            ErrorKind::UnsupportedExecutionProfile,
            crate::error::codes::UNSUPPORTED_EXECUTION_PROFILE,
            format!("execution_profile `{execution_profile}` is not supported"),
        )));
    }

    let routing_input = RoutingViewInput {
        session_id: session_id.clone(),
        pipeline_version: pipeline_version.clone(),
    };
    let (routing, admission_policy, abi_compat) = match &backends.routing_view {
        Some(view) => match view.get_snapshot(&routing_input).await {
            Ok(snapshot) => (
                snapshot.routing_snapshot_ref,
                snapshot.admission_policy_snapshot_ref,
                snapshot.abi_compat_snapshot_ref,
            ),
            Err(err) if err.is_stale_snapshot() => return Err(BundleResolutionFailure::StaleSnapshot),
            Err(_) => (
                FALLBACK_ROUTING_SNAPSHOT.to_string(),
                FALLBACK_ADMISSION_POLICY_SNAPSHOT.to_string(),
                FALLBACK_ABI_COMPAT_SNAPSHOT.to_string(),
            ),
        },
        None => (
            FALLBACK_ROUTING_SNAPSHOT.to_string(),
            FALLBACK_ADMISSION_POLICY_SNAPSHOT.to_string(),
            FALLBACK_ABI_COMPAT_SNAPSHOT.to_string(),
        ),
    };

    let policy_input = PolicyInput {
        session_id: session_id.clone(),
        pipeline_version: pipeline_version.clone(),
    };
    let (allowed_adaptive_actions, adaptive_policy) = match &backends.policy {
        Some(policy) => match policy.evaluate(&policy_input).await {
            Ok(resolution) => (
                backends::canonicalize_adaptive_actions(resolution.allowed_adaptive_actions),
                resolution.snapshot_ref,
            ),
            Err(err) if err.is_stale_snapshot() => return Err(BundleResolutionFailure::StaleSnapshot),
            Err(_) => (default_adaptive_actions(), FALLBACK_ADAPTIVE_POLICY_SNAPSHOT.to_string()),
        },
        None => (default_adaptive_actions(), FALLBACK_ADAPTIVE_POLICY_SNAPSHOT.to_string()),
    };

    let provider_health_input = ProviderHealthInput {
        pipeline_version: pipeline_version.clone(),
    };
    let provider_health = match &backends.provider_health {
        Some(backend) => match backend.get_snapshot(&provider_health_input).await {
            Ok(snapshot) => snapshot.snapshot_ref,
            Err(err) if err.is_stale_snapshot() => return Err(BundleResolutionFailure::StaleSnapshot),
            Err(_) => FALLBACK_PROVIDER_HEALTH_SNAPSHOT.to_string(),
        },
        None => FALLBACK_PROVIDER_HEALTH_SNAPSHOT.to_string(),
    };

    Ok(TurnStartBundle {
        pipeline_version,
        execution_profile,
        graph_definition_ref: record.graph_definition_ref,
        allowed_adaptive_actions,
        snapshot_provenance: SnapshotProvenance {
            version_resolution: version_resolution_snapshot,
            routing,
            admission_policy,
            abi_compat,
            adaptive_policy,
            provider_health,
        },
    })
}

fn default_adaptive_actions() -> Vec<AdaptiveAction> {
    backends::canonicalize_adaptive_actions(vec![
        AdaptiveAction::Retry,
        AdaptiveAction::ProviderSwitch,
        AdaptiveAction::Fallback,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backends::PolicyResolution;

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

    fn backends_with_only_registry() -> ControlPlaneBackends {
        ControlPlaneBackends {
            rollout: None,
            registry: Arc::new(AlwaysRegistry),
            routing_view: None,
            policy: None,
            provider_health: None,
        }
    }

    #[tokio::test]
    async fn missing_optional_backends_fall_back_to_named_defaults() {
        let session = SessionId::parse("s-1").unwrap();
        let bundle = resolve_turn_start_bundle(&backends_with_only_registry(), &session, None)
            .await
            .expect("bundle resolves via fallbacks");
        assert_eq!(bundle.pipeline_version, "v1");
        assert_eq!(bundle.execution_profile, "simple");
        assert_eq!(
            bundle.snapshot_provenance.routing,
            FALLBACK_ROUTING_SNAPSHOT
        );
        assert_eq!(
            bundle.allowed_adaptive_actions,
            vec![
                AdaptiveAction::Retry,
                AdaptiveAction::ProviderSwitch,
                AdaptiveAction::Fallback
            ]
        );
    }

    struct FailingRegistry;
    #[async_trait]
    impl Registry for FailingRegistry {
        async fn resolve_pipeline_record(&self, _version: &str) -> Result<PipelineRecord, CoreError> {
            Err(CoreError::new(ErrorKind::BackendUnavailable, "registry.unreachable", "down"))
        }
    }

    #[tokio::test]
    async fn registry_failure_is_a_hard_failure() {
        let session = SessionId::parse("s-1").unwrap();
        let backends = ControlPlaneBackends {
            rollout: None,
            registry: Arc::new(FailingRegistry),
            routing_view: None,
            policy: None,
            provider_health: None,
        };
        let result = resolve_turn_start_bundle(&backends, &session, None).await;
        assert!(matches!(result, Err(BundleResolutionFailure::ResolutionFailed(_))));
    }

    #[tokio::test]
    async fn adaptive_actions_are_canonically_ordered_even_if_backend_returns_scrambled() {
        struct ScrambledPolicy;
        #[async_trait]
        impl Policy for ScrambledPolicy {
            async fn evaluate(&self, _input: &PolicyInput) -> Result<PolicyResolution, CoreError> {
                Ok(PolicyResolution {
                    allowed_adaptive_actions: vec![
                        AdaptiveAction::Fallback,
                        AdaptiveAction::Retry,
                        AdaptiveAction::Degrade,
                    ],
                    snapshot_ref: "adaptive-actions-policy/v2".into(),
                })
            }
        }
        let session = SessionId::parse("s-1").unwrap();
        let backends = ControlPlaneBackends {
            rollout: None,
            registry: Arc::new(AlwaysRegistry),
            routing_view: None,
            policy: Some(Arc::new(ScrambledPolicy)),
            provider_health: None,
        };
        let bundle = resolve_turn_start_bundle(&backends, &session, None).await.unwrap();
        assert_eq!(
            bundle.allowed_adaptive_actions,
            vec![AdaptiveAction::Retry, AdaptiveAction::Fallback, AdaptiveAction::Degrade]
        );
    }
}
