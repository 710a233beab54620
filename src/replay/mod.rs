//! C11 — Replay comparator.
//!
//! Compares a recorded baseline trace against a replayed trace and reports
//! divergences in a closed taxonomy (spec §4.11). Divergences are not
//! automatically fatal: [`crate::config::DivergencePolicy`] whitelists
//! specific `(class, scope)` pairs, except `Authority` (always fails) and
//! any `invocation_latency_{final,total}:` timing scope (always fails when
//! present, per spec §9 open question 1: presence alone is the failure
//! condition, independent of `diff_ms` magnitude).

use std::collections::BTreeMap;

use crate::config::DivergencePolicy;
use crate::ids::TurnId;

/// The closed set of ways a replayed trace can diverge from its baseline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum DivergenceClass {
    Plan,
    Outcome,
    Ordering,
    Authority,
    Timing,
    ProviderChoice,
}

/// A scalar or categorical value recorded at a named scope within a turn's
/// trace (e.g. `"plan_hash"`, `"invocation_latency_final:stt"`,
/// `"outcome:provider-a"`). Traces are flat maps from scope to value; nested
/// structure lives in the scope name itself, matching how the baseline
/// recorder (C10) already flattens evidence.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceValue {
    Text(String),
    Number(f64),
}

/// A single recorded or replayed turn trace, keyed by scope.
#[derive(Clone, Debug, Default)]
pub struct TraceArtifact {
    pub turn_id: Option<TurnId>,
    pub scopes: BTreeMap<String, TraceValue>,
}

impl TraceArtifact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: impl Into<String>, value: TraceValue) -> Self {
        self.scopes.insert(scope.into(), value);
        self
    }
}

/// A single detected divergence between baseline and replay (spec §3
/// `ReplayDivergence`).
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayDivergence {
    pub class: DivergenceClass,
    pub scope: String,
    pub message: String,
    pub baseline: Option<TraceValue>,
    pub replayed: Option<TraceValue>,
    pub diff_ms: Option<f64>,
}

/// Maps a scope name to the divergence class it belongs to, for scopes whose
/// class cannot be inferred structurally (the recorder doesn't tag scopes
/// with a class, so the comparator classifies by name prefix).
fn classify_scope(scope: &str) -> DivergenceClass {
    if scope == "plan_hash" || scope.starts_with("ordering_markers") || scope == "determinism_seed" || scope.starts_with("snapshot_provenance") {
        DivergenceClass::Plan
    } else if scope.starts_with("authority") {
        DivergenceClass::Authority
    } else if scope.starts_with("invocation_latency_") || scope.starts_with("timing:") || scope.starts_with("runtime_timestamp") {
        DivergenceClass::Timing
    } else if scope.starts_with("provider_choice") || scope.starts_with("candidate_order") {
        DivergenceClass::ProviderChoice
    } else if scope.starts_with("turn:") || scope.starts_with("sequence") {
        DivergenceClass::Ordering
    } else {
        DivergenceClass::Outcome
    }
}

fn numeric_diff_ms(baseline: Option<&TraceValue>, replayed: Option<&TraceValue>) -> Option<f64> {
    match (baseline, replayed) {
        (Some(TraceValue::Number(b)), Some(TraceValue::Number(r))) => Some((r - b).abs()),
        _ => None,
    }
}

/// Compares two trace artifacts scope-by-scope and returns every scope whose
/// recorded value differs (missing-on-one-side counts as a divergence too).
pub fn compare_trace_artifacts(baseline: &TraceArtifact, replayed: &TraceArtifact) -> Vec<ReplayDivergence> {
    let mut scopes: Vec<&String> = baseline.scopes.keys().chain(replayed.scopes.keys()).collect();
    scopes.sort();
    scopes.dedup();

    let mut out = Vec::new();
    for scope in scopes {
        let b = baseline.scopes.get(scope);
        let r = replayed.scopes.get(scope);
        if b != r {
            let class = classify_scope(scope);
            let diff_ms = if class == DivergenceClass::Timing {
                numeric_diff_ms(b, r)
            } else {
                None
            };
            out.push(ReplayDivergence {
                class,
                scope: scope.clone(),
                message: format!("scope `{scope}` diverged between baseline and replay"),
                baseline: b.cloned(),
                replayed: r.cloned(),
                diff_ms,
            });
        }
    }
    out
}

/// The outcome of gating a set of divergences against policy (spec §4.11):
/// every divergence that fails is listed in `failing`, and every expected
/// `(class, scope)` pair with no matching observed divergence is listed in
/// `missing_expected`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DivergenceGateResult {
    pub failing: Vec<ReplayDivergence>,
    pub missing_expected: Vec<(DivergenceClass, String)>,
}

impl DivergenceGateResult {
    pub fn passed(&self) -> bool {
        self.failing.is_empty() && self.missing_expected.is_empty()
    }
}

fn invocation_latency_scope(scope: &str) -> bool {
    scope.starts_with("invocation_latency_final:") || scope.starts_with("invocation_latency_total:")
}

/// Evaluates detected divergences against the divergence policy (spec
/// §4.11):
/// - `Plan`, `Outcome`, `ProviderChoice` fail unless explicitly listed in
///   `policy.expected`.
/// - `Authority` always fails, regardless of expectation.
/// - `Ordering` fails unless the matching expectation has `approved == true`.
/// - `Timing` fails when `diff_ms` is absent or exceeds
///   `timing_tolerance_ms`; `invocation_latency_{final,total}:`-prefixed
///   scopes always fail when present, overriding tolerance and expectation.
/// - Any expectation with no matching observed divergence becomes a
///   `MissingExpected` failure.
pub fn evaluate_divergences(divergences: &[ReplayDivergence], policy: &DivergencePolicy) -> DivergenceGateResult {
    let mut failing = Vec::new();

    let whitelisted = |class: DivergenceClass, scope: &str, require_approved: bool| -> bool {
        policy
            .expected
            .iter()
            .any(|e| e.class == class && e.scope == scope && (!require_approved || e.approved))
    };

    for d in divergences {
        let fails = match d.class {
            DivergenceClass::Authority => true,
            DivergenceClass::Timing if invocation_latency_scope(&d.scope) => true,
            DivergenceClass::Timing => {
                let tolerance = policy.timing_tolerance_ms as f64;
                match d.diff_ms {
                    Some(diff) => diff > tolerance,
                    None => true,
                }
            }
            DivergenceClass::Ordering => !whitelisted(d.class, &d.scope, true),
            DivergenceClass::Plan | DivergenceClass::Outcome | DivergenceClass::ProviderChoice => {
                !whitelisted(d.class, &d.scope, false)
            }
        };
        if fails {
            failing.push(d.clone());
        }
    }

    let mut missing_expected = Vec::new();
    for expected in &policy.expected {
        let matched = divergences
            .iter()
            .any(|d| d.class == expected.class && d.scope == expected.scope);
        if !matched {
            missing_expected.push((expected.class, expected.scope.clone()));
        }
    }

    DivergenceGateResult {
        failing,
        missing_expected,
    }
}
