//! C14 — Telemetry/logging emitter interface.
//!
//! A non-blocking emission surface (spec §4: "sinks injected"). The kernel
//! itself only ever wraps `tracing` (SPEC_FULL.md A.2) — hosts attach
//! whatever subscriber they use without the kernel taking a hard dependency
//! on a specific telemetry backend.

use std::collections::BTreeMap;

use crate::ids::{CorrelationId, SessionId, TurnId};

/// Correlation fields attached to every metric/event emission (spec §6).
#[derive(Clone, Debug, Default)]
pub struct Correlation {
    pub session_id: Option<SessionId>,
    pub turn_id: Option<TurnId>,
    pub edge_id: Option<CorrelationId>,
}

/// A single telemetry emission: either a metric sample or a named event,
/// both carrying free-form attributes (spec §6 `Emit(Metric|Event)`).
#[derive(Clone, Debug)]
pub enum Emission {
    Metric {
        name: &'static str,
        value: f64,
        correlation: Correlation,
        attributes: BTreeMap<String, String>,
    },
    Event {
        name: &'static str,
        correlation: Correlation,
        attributes: BTreeMap<String, String>,
    },
}

/// Non-blocking telemetry facade. Implementations must not block the
/// calling worker — metric/event emission is an ambient side effect, never
/// on the turn-lifecycle critical path.
pub trait ObservabilityFacade: Send + Sync {
    fn emit(&self, emission: Emission);
}

/// Mirrors every emission as a `tracing` event, tagged with correlation
/// fields (SPEC_FULL.md A.2). This is the default facade a host installs
/// when it has no dedicated metrics backend: `tracing`'s own subscriber
/// ecosystem (fmt, OpenTelemetry bridges, …) takes it from there.
pub struct TracingFacade;

impl ObservabilityFacade for TracingFacade {
    fn emit(&self, emission: Emission) {
        match emission {
            Emission::Metric {
                name,
                value,
                correlation,
                attributes,
            } => {
                tracing::event!(
                    tracing::Level::DEBUG,
                    metric = name,
                    value,
                    session_id = correlation.session_id.as_ref().map(|s| s.as_str()),
                    turn_id = correlation.turn_id.as_ref().map(|t| t.as_str()),
                    edge_id = correlation.edge_id.as_ref().map(|e| e.as_str()),
                    attributes = ?attributes,
                    "turn_kernel.metric"
                );
            }
            Emission::Event {
                name,
                correlation,
                attributes,
            } => {
                tracing::event!(
                    tracing::Level::INFO,
                    event = name,
                    session_id = correlation.session_id.as_ref().map(|s| s.as_str()),
                    turn_id = correlation.turn_id.as_ref().map(|t| t.as_str()),
                    edge_id = correlation.edge_id.as_ref().map(|e| e.as_str()),
                    attributes = ?attributes,
                    "turn_kernel.event"
                );
            }
        }
    }
}

/// Emits a lifecycle transition (`turn_open`, `abort`, `close`) or control
/// signal (`provider_switch`, `flow_xoff`/`flow_xon`, `playback_cancelled`,
/// `discontinuity`, `recording_level_downgraded`, `deauthorized_drain`) as a
/// named event with no attributes beyond correlation, matching
/// SPEC_FULL.md A.2's "every lifecycle transition ... is mirrored as a
/// tracing event" contract.
pub fn emit_lifecycle_event(facade: &dyn ObservabilityFacade, name: &'static str, correlation: Correlation) {
    facade.emit(Emission::Event {
        name,
        correlation,
        attributes: BTreeMap::new(),
    });
}
