//! C4 — Plan resolver.
//!
//! Freezes the per-turn [`ResolvedTurnPlan`] from a [`TurnStartBundle`]
//! (spec §4.4). The plan is read-only once constructed: `plan_hash` is a
//! deterministic function of the bundle's fields plus `ordering_markers`,
//! so replay (C11) can recompute it from the same inputs and compare.

use sha2::{Digest, Sha256};

use crate::control_plane::backends::AdaptiveAction;
use crate::control_plane::bundle::{SnapshotProvenance, TurnStartBundle};
use crate::error::{CoreError, ErrorKind};
use crate::ids::TurnId;

/// The single execution profile the kernel currently supports end to end
/// (spec §3: `execution_profile ∈ {"simple"}`).
pub const EXECUTION_PROFILE_SIMPLE: &str = "simple";

/// Frozen, read-only per-turn plan (spec §3 `ResolvedTurnPlan`).
#[derive(Clone, Debug)]
pub struct ResolvedTurnPlan {
    pub plan_hash: String,
    pub pipeline_version: String,
    pub graph_definition_ref: String,
    pub execution_profile: String,
    pub allowed_adaptive_actions: Vec<AdaptiveAction>,
    pub snapshot_provenance: SnapshotProvenance,
    pub determinism_seed: i64,
    pub ordering_markers: Vec<String>,
    pub merge_rule_id: String,
    pub merge_rule_version: u32,
}

/// Canonical default merge rule, used when the control plane does not
/// supply one. Kept as a named constant rather than inlined so future
/// callers have one place to point a replay comparison at.
pub const DEFAULT_MERGE_RULE_ID: &str = "runtime-sequence-lexical/v1";
pub const DEFAULT_MERGE_RULE_VERSION: u32 = 1;

fn canonical_plan_input(
    bundle: &TurnStartBundle,
    ordering_markers: &[String],
    determinism_seed_material: &str,
) -> String {
    let SnapshotProvenance {
        version_resolution,
        routing,
        admission_policy,
        abi_compat,
        adaptive_policy,
        provider_health,
    } = &bundle.snapshot_provenance;
    format!(
        "pipeline_version={}|graph_definition_ref={}|snapshot_provenance={{version_resolution={};routing={};admission_policy={};abi_compat={};adaptive_policy={};provider_health={}}}|ordering_markers=[{}]|determinism_seed_material={}",
        bundle.pipeline_version,
        bundle.graph_definition_ref,
        version_resolution,
        routing,
        admission_policy,
        abi_compat,
        adaptive_policy,
        provider_health,
        ordering_markers.join(","),
        determinism_seed_material,
    )
}

/// Computes the 64-hex `plan_hash` for a bundle + ordering markers (spec §4.4:
/// "a deterministic function of `(pipeline_version, graph_definition_ref,
/// snapshot_provenance, ordering_markers, determinism_seed)`"). The
/// determinism seed material used here is `turn_id`, matching
/// [`resolve_turn_plan`]'s derivation of `determinism_seed` from
/// `(plan_hash, turn_id)` — the hash is computed first over `turn_id` as seed
/// material, then the int64 seed is derived from the resulting hash.
fn compute_plan_hash(bundle: &TurnStartBundle, ordering_markers: &[String], turn_id: &TurnId) -> String {
    let canonical = canonical_plan_input(bundle, ordering_markers, turn_id.as_str());
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

fn derive_determinism_seed(plan_hash: &str, turn_id: &TurnId) -> i64 {
    let material = format!("{plan_hash}|{turn_id}");
    let digest = Sha256::digest(material.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[0..8]);
    i64::from_be_bytes(buf)
}

/// Produces a [`ResolvedTurnPlan`] from a resolved bundle (spec §4.4).
///
/// `ordering_markers` must include at least `runtime_sequence` — callers
/// pass the turn-open proposal's `runtime_sequence` formatted as
/// `"runtime_sequence:{n}"` as the first marker; additional markers (e.g.
/// per-lane sequence numbers) may be appended and must be unique.
pub fn resolve_turn_plan(
    bundle: &TurnStartBundle,
    turn_id: &TurnId,
    runtime_sequence: u64,
    extra_ordering_markers: Vec<String>,
) -> Result<ResolvedTurnPlan, CoreError> {
    if bundle.execution_profile != EXECUTION_PROFILE_SIMPLE {
        return Err(CoreError::new(
            ErrorKind::UnsupportedExecutionProfile,
            crate::error::codes::EXECUTION_PROFILE_MISMATCH,
            format!(
                "resolved bundle carries execution_profile `{}`, expected `{}`",
                bundle.execution_profile, EXECUTION_PROFILE_SIMPLE
            ),
        ));
    }

    let mut ordering_markers = vec![format!("runtime_sequence:{runtime_sequence}")];
    for marker in extra_ordering_markers {
        if !ordering_markers.contains(&marker) {
            ordering_markers.push(marker);
        }
    }

    let plan_hash = compute_plan_hash(bundle, &ordering_markers, turn_id);
    let determinism_seed = derive_determinism_seed(&plan_hash, turn_id);

    Ok(ResolvedTurnPlan {
        plan_hash,
        pipeline_version: bundle.pipeline_version.clone(),
        graph_definition_ref: bundle.graph_definition_ref.clone(),
        execution_profile: bundle.execution_profile.clone(),
        allowed_adaptive_actions: bundle.allowed_adaptive_actions.clone(),
        snapshot_provenance: bundle.snapshot_provenance.clone(),
        determinism_seed,
        ordering_markers,
        merge_rule_id: DEFAULT_MERGE_RULE_ID.to_string(),
        merge_rule_version: DEFAULT_MERGE_RULE_VERSION,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> TurnStartBundle {
        TurnStartBundle {
            pipeline_version: "v1".into(),
            execution_profile: "simple".into(),
            graph_definition_ref: "graph/v1".into(),
            allowed_adaptive_actions: vec![AdaptiveAction::Retry, AdaptiveAction::Fallback],
            snapshot_provenance: SnapshotProvenance {
                version_resolution: "version-resolution/v1".into(),
                routing: "routing-view/v1".into(),
                admission_policy: "admission-policy/v1".into(),
                abi_compat: "abi-compat/v1".into(),
                adaptive_policy: "adaptive-actions-policy/v1".into(),
                provider_health: "provider-health/v1".into(),
            },
        }
    }

    #[test]
    fn plan_hash_is_deterministic_and_64_hex() {
        let turn_id = TurnId::parse("t-1").unwrap();
        let plan = resolve_turn_plan(&bundle(), &turn_id, 7, vec![]).unwrap();
        assert_eq!(plan.plan_hash.len(), 64);
        assert!(plan.plan_hash.chars().all(|c| c.is_ascii_hexdigit()));

        let plan2 = resolve_turn_plan(&bundle(), &turn_id, 7, vec![]).unwrap();
        assert_eq!(plan.plan_hash, plan2.plan_hash);
        assert_eq!(plan.determinism_seed, plan2.determinism_seed);
    }

    #[test]
    fn different_turn_ids_produce_different_hashes() {
        let plan_a = resolve_turn_plan(&bundle(), &TurnId::parse("t-a").unwrap(), 7, vec![]).unwrap();
        let plan_b = resolve_turn_plan(&bundle(), &TurnId::parse("t-b").unwrap(), 7, vec![]).unwrap();
        assert_ne!(plan_a.plan_hash, plan_b.plan_hash);
    }

    #[test]
    fn ordering_markers_include_runtime_sequence_and_are_unique() {
        let turn_id = TurnId::parse("t-1").unwrap();
        let plan = resolve_turn_plan(
            &bundle(),
            &turn_id,
            3,
            vec!["lane:audio".into(), "lane:audio".into()],
        )
        .unwrap();
        assert_eq!(plan.ordering_markers[0], "runtime_sequence:3");
        let unique: std::collections::HashSet<_> = plan.ordering_markers.iter().collect();
        assert_eq!(unique.len(), plan.ordering_markers.len());
    }

    #[test]
    fn non_simple_execution_profile_is_rejected() {
        let mut b = bundle();
        b.execution_profile = "advanced".into();
        let turn_id = TurnId::parse("t-1").unwrap();
        assert!(resolve_turn_plan(&b, &turn_id, 1, vec![]).is_err());
    }
}
