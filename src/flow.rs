//! C9 — Buffering & flow control.
//!
//! Edge-pressure reaction, sync-loss discontinuity marking (idempotent per
//! `discontinuity_id`), and deterministic lineage-preserving merge of
//! coalesced events (spec §4.9).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::control_plane::backends::AdmissionOutcome;
use crate::event::ControlSignalKind;
use crate::ids::EventId;

/// Range of `runtime_sequence` values a `drop_notice` covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceRange {
    pub start: u64,
    pub end: u64,
}

/// One signal emitted while reacting to edge pressure, in deterministic
/// order (spec §4.9: `watermark`, `drop_notice`, `flow_xoff`, optional
/// `flow_xon`, optional `Shed`).
#[derive(Clone, Debug)]
pub enum PressureSignal {
    Watermark { high: bool },
    DropNotice { range: SequenceRange },
    FlowControl(ControlSignalKind),
    Shed(AdmissionOutcome),
}

/// Input describing the pressure observed on one edge.
#[derive(Clone, Copy, Debug)]
pub struct EdgePressureInput {
    pub watermark_high: bool,
    pub drop_range: Option<SequenceRange>,
    pub saturated: bool,
    pub recovered: bool,
    pub shed: bool,
}

/// Reacts to edge pressure, producing signals in the fixed order the spec
/// requires: `watermark`, then `drop_notice` (if any), then `flow_xoff`,
/// then optionally `flow_xon`, then optionally `Shed`.
pub fn handle_edge_pressure(input: &EdgePressureInput) -> Vec<PressureSignal> {
    let mut out = Vec::new();
    out.push(PressureSignal::Watermark {
        high: input.watermark_high,
    });
    if let Some(range) = input.drop_range {
        out.push(PressureSignal::DropNotice { range });
    }
    if input.saturated {
        out.push(PressureSignal::FlowControl(ControlSignalKind::FlowXoff));
    }
    if input.recovered {
        out.push(PressureSignal::FlowControl(ControlSignalKind::FlowXon));
    }
    if input.shed {
        out.push(PressureSignal::Shed(AdmissionOutcome::Shed));
    }
    out
}

/// Marker returned by [`SyncLossTracker::handle_sync_loss`]; repeated calls
/// with the same `discontinuity_id` return an equal marker without raising a
/// new control signal (spec §4.9 / testable idempotence law).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscontinuityMarker {
    pub domain: String,
    pub discontinuity_id: String,
}

/// Tracks which `(domain, discontinuity_id)` pairs have already been
/// reported for one session, so repeated sync-loss notifications for the
/// same discontinuity are idempotent.
pub struct SyncLossTracker {
    seen: Mutex<HashMap<(String, String), DiscontinuityMarker>>,
}

impl SyncLossTracker {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `(marker, is_new)` — `is_new` tells the caller whether to
    /// emit a fresh `discontinuity` control signal.
    pub fn handle_sync_loss(&self, domain: &str, discontinuity_id: &str) -> (DiscontinuityMarker, bool) {
        let key = (domain.to_string(), discontinuity_id.to_string());
        let mut seen = self.seen.lock();
        if let Some(existing) = seen.get(&key) {
            return (existing.clone(), false);
        }
        let marker = DiscontinuityMarker {
            domain: domain.to_string(),
            discontinuity_id: discontinuity_id.to_string(),
        };
        seen.insert(key, marker.clone());
        (marker, true)
    }
}

impl Default for SyncLossTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// One source event contributing to a coalesced merge.
#[derive(Clone, Debug)]
pub struct MergeSource {
    pub event_id: EventId,
    pub runtime_sequence: u64,
}

/// The span of `runtime_sequence` values covered by a merge's sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceSpan {
    pub min: u64,
    pub max: u64,
}

/// Result of merging a set of coalesced events (spec §4.9 `MergedEvent`).
#[derive(Clone, Debug, PartialEq)]
pub struct MergedEvent {
    pub merge_group_id: String,
    pub ordered_event_ids: Vec<String>,
    pub source_span: (u64, u64),
}

/// Merges `sources` deterministically regardless of input order (spec §4.9 /
/// testable property 7): sorted by `runtime_sequence` ascending, then
/// `event_id` lexicographically.
pub fn merge_coalesced_events(merge_group_id: &str, mut sources: Vec<MergeSource>) -> MergedEvent {
    sources.sort_by(|a, b| {
        a.runtime_sequence
            .cmp(&b.runtime_sequence)
            .then_with(|| a.event_id.as_str().cmp(b.event_id.as_str()))
    });
    let min = sources.iter().map(|s| s.runtime_sequence).min().unwrap_or(0);
    let max = sources.iter().map(|s| s.runtime_sequence).max().unwrap_or(0);
    MergedEvent {
        merge_group_id: merge_group_id.to_string(),
        ordered_event_ids: sources.iter().map(|s| s.event_id.as_str().to_string()).collect(),
        source_span: (min, max),
    }
}
