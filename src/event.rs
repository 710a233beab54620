//! C1 — Event ABI & control-signal normalizer.
//!
//! Canonicalizes per-event identity, sequence numbers, timestamps, lane, and
//! payload class before anything downstream (the arbiter, the bundle
//! resolver, the recorder) ever sees a transport-originated record.
//! Everything past this module deals only in [`NormalizedEvent`] /
//! [`NormalizedControlSignal`] — never the raw wire shape.

use crate::error::{CoreError, ErrorKind, codes};
use crate::ids::{EventId, SessionId, TurnId};

/// The closed set of inbound transport event kinds (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportEventKind {
    Connected,
    Disconnected,
    TransportDisconnect,
    TurnOpenProposed,
    IngressChunk,
    CancelRequested,
}

/// The closed set of payload classes a normalized event may carry.
/// Anything else is rejected by [`normalize_event`] as unrecognized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadClass {
    Audio,
    Text,
    Control,
    Diagnostic,
}

impl PayloadClass {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(PayloadClass::Audio),
            "text" => Some(PayloadClass::Text),
            "control" => Some(PayloadClass::Control),
            "diagnostic" => Some(PayloadClass::Diagnostic),
            _ => None,
        }
    }
}

/// Raw, wire-shaped inbound transport event, as handed to the normalizer by
/// the session orchestrator (C13)'s external transport collaborator.
#[derive(Clone, Debug)]
pub struct RawTransportEvent {
    pub kind: TransportEventKind,
    pub session_id: String,
    pub turn_id: Option<String>,
    pub event_id: String,
    pub transport_sequence: Option<i64>,
    pub runtime_sequence: i64,
    pub authority_epoch: i64,
    pub runtime_ts_ms: i64,
    pub wall_ms: i64,
    pub payload_class: String,
    pub payload_ref: Option<String>,
}

/// Canonicalized event: identity fields are typed, sequence/timestamp
/// fields are non-negative, and `payload_class` is a closed variant.
#[derive(Clone, Debug)]
pub struct NormalizedEvent {
    pub kind: TransportEventKind,
    pub session_id: SessionId,
    pub turn_id: Option<TurnId>,
    pub event_id: EventId,
    pub transport_sequence: u64,
    pub runtime_sequence: u64,
    pub authority_epoch: u64,
    pub runtime_ts_ms: u64,
    pub wall_ms: u64,
    pub payload_class: PayloadClass,
    pub payload_ref: Option<String>,
}

/// Controls whether negative numeric fields are rejected outright (`strict`)
/// or sanitized to zero (non-strict, the default used by best-effort
/// transports).
#[derive(Clone, Copy, Debug, Default)]
pub struct NormalizeOptions {
    pub strict: bool,
}

fn sanitize_i64(value: i64, strict: bool, field: &'static str) -> Result<u64, CoreError> {
    if value >= 0 {
        return Ok(value as u64);
    }
    if strict {
        return Err(CoreError::new(
            ErrorKind::InvalidInput,
            codes::NEGATIVE_FIELD,
            format!("field `{field}` is negative ({value}) under strict normalization"),
        ));
    }
    Ok(0)
}

/// Normalizes a raw transport event (spec §4.1).
///
/// Fails for empty `session_id`/`event_id` or an unrecognized payload class
/// regardless of strict mode; `transport_sequence` defaults to `0` when
/// absent; negative `runtime_sequence`/`authority_epoch`/timestamps are
/// rejected in strict mode and zero-substituted otherwise.
pub fn normalize_event(
    raw: RawTransportEvent,
    options: NormalizeOptions,
) -> Result<NormalizedEvent, CoreError> {
    let session_id = SessionId::parse(raw.session_id).map_err(|_| {
        CoreError::new(
            ErrorKind::InvalidInput,
            codes::EMPTY_SESSION_ID,
            "session_id must not be empty",
        )
    })?;
    let event_id = EventId::parse(raw.event_id).map_err(|_| {
        CoreError::new(
            ErrorKind::InvalidInput,
            codes::EMPTY_EVENT_ID,
            "event_id must not be empty",
        )
    })?;
    let turn_id = match raw.turn_id {
        Some(t) if !t.trim().is_empty() => Some(TurnId::parse(t)?),
        _ => None,
    };
    let payload_class = PayloadClass::parse(&raw.payload_class).ok_or_else(|| {
        CoreError::new(
            ErrorKind::InvalidInput,
            codes::UNRECOGNIZED_PAYLOAD_CLASS,
            format!("unrecognized payload class `{}`", raw.payload_class),
        )
    })?;

    let transport_sequence = match raw.transport_sequence {
        Some(v) => sanitize_i64(v, options.strict, "transport_sequence")?,
        None => 0,
    };
    let runtime_sequence = sanitize_i64(raw.runtime_sequence, options.strict, "runtime_sequence")?;
    let authority_epoch = sanitize_i64(raw.authority_epoch, options.strict, "authority_epoch")?;
    let runtime_ts_ms = sanitize_i64(raw.runtime_ts_ms, options.strict, "runtime_ts_ms")?;
    let wall_ms = sanitize_i64(raw.wall_ms, options.strict, "wall_ms")?;

    Ok(NormalizedEvent {
        kind: raw.kind,
        session_id,
        turn_id,
        event_id,
        transport_sequence,
        runtime_sequence,
        authority_epoch,
        runtime_ts_ms,
        wall_ms,
        payload_class,
        payload_ref: raw.payload_ref,
    })
}

/// The closed set of control signals components emit across the lifecycle
/// (spec §4.2–§4.9): `provider_switch`, `flow_xoff`/`flow_xon`,
/// `playback_cancelled`, `discontinuity`, `recording_level_downgraded`,
/// `deauthorized_drain`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlSignalKind {
    ProviderSwitch,
    FlowXoff,
    FlowXon,
    PlaybackCancelled,
    OutputAccepted,
    Discontinuity,
    RecordingLevelDowngraded,
    DeauthorizedDrain,
}

impl ControlSignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignalKind::ProviderSwitch => "provider_switch",
            ControlSignalKind::FlowXoff => "flow_xoff",
            ControlSignalKind::FlowXon => "flow_xon",
            ControlSignalKind::PlaybackCancelled => "playback_cancelled",
            ControlSignalKind::OutputAccepted => "output_accepted",
            ControlSignalKind::Discontinuity => "discontinuity",
            ControlSignalKind::RecordingLevelDowngraded => "recording_level_downgraded",
            ControlSignalKind::DeauthorizedDrain => "deauthorized_drain",
        }
    }
}

/// Raw control signal as produced by the emitting component before
/// normalization.
#[derive(Clone, Debug)]
pub struct RawControlSignal {
    pub kind: ControlSignalKind,
    pub session_id: String,
    pub turn_id: Option<String>,
    pub runtime_sequence: i64,
    pub runtime_ts_ms: i64,
    pub reason: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NormalizedControlSignal {
    pub kind: ControlSignalKind,
    pub session_id: SessionId,
    pub turn_id: Option<TurnId>,
    pub runtime_sequence: u64,
    pub runtime_ts_ms: u64,
    pub reason: Option<String>,
}

/// Normalizes a control signal (spec §4.1), sharing the same sequence/
/// timestamp sanitization rules as [`normalize_event`].
pub fn normalize_control_signal(
    raw: RawControlSignal,
    options: NormalizeOptions,
) -> Result<NormalizedControlSignal, CoreError> {
    let session_id = SessionId::parse(raw.session_id).map_err(|_| {
        CoreError::new(
            ErrorKind::InvalidInput,
            codes::EMPTY_SESSION_ID,
            "session_id must not be empty",
        )
    })?;
    let turn_id = match raw.turn_id {
        Some(t) if !t.trim().is_empty() => Some(TurnId::parse(t)?),
        _ => None,
    };
    let runtime_sequence = sanitize_i64(raw.runtime_sequence, options.strict, "runtime_sequence")?;
    let runtime_ts_ms = sanitize_i64(raw.runtime_ts_ms, options.strict, "runtime_ts_ms")?;

    Ok(NormalizedControlSignal {
        kind: raw.kind,
        session_id,
        turn_id,
        runtime_sequence,
        runtime_ts_ms,
        reason: raw.reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event() -> RawTransportEvent {
        RawTransportEvent {
            kind: TransportEventKind::TurnOpenProposed,
            session_id: "s-1".into(),
            turn_id: Some("t-1".into()),
            event_id: "e-1".into(),
            transport_sequence: None,
            runtime_sequence: 5,
            authority_epoch: 1,
            runtime_ts_ms: 10,
            wall_ms: 10,
            payload_class: "control".into(),
            payload_ref: None,
        }
    }

    #[test]
    fn defaults_missing_transport_sequence_to_zero() {
        let normalized = normalize_event(base_event(), NormalizeOptions::default()).unwrap();
        assert_eq!(normalized.transport_sequence, 0);
    }

    #[test]
    fn rejects_empty_session_id() {
        let mut raw = base_event();
        raw.session_id = String::new();
        assert!(normalize_event(raw, NormalizeOptions::default()).is_err());
    }

    #[test]
    fn rejects_unrecognized_payload_class() {
        let mut raw = base_event();
        raw.payload_class = "smoke-signal".into();
        assert!(normalize_event(raw, NormalizeOptions::default()).is_err());
    }

    #[test]
    fn non_strict_sanitizes_negative_fields_to_zero() {
        let mut raw = base_event();
        raw.runtime_sequence = -5;
        let normalized = normalize_event(raw, NormalizeOptions { strict: false }).unwrap();
        assert_eq!(normalized.runtime_sequence, 0);
    }

    #[test]
    fn strict_rejects_negative_fields() {
        let mut raw = base_event();
        raw.runtime_sequence = -5;
        assert!(normalize_event(raw, NormalizeOptions { strict: true }).is_err());
    }
}
