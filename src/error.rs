//! Crate-wide error taxonomy.
//!
//! `CoreError` is the single error type returned by fallible kernel
//! operations. It pairs a closed [`ErrorKind`] (the taxonomy from the turn
//! lifecycle specification) with a stable machine-readable `code` and a
//! human-readable `message`, and can carry a boxed cause for error-chain
//! inspection. Pre-turn rejections are *not* represented as `CoreError` —
//! they surface as [`crate::arbiter::DecisionOutcome`] values so that a
//! turn that never admits never raises to the transport layer.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

/// Closed taxonomy of kernel failure kinds (spec §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidInput,
    CapacityExhausted,
    StaleAuthority,
    TerminalAlreadyEmitted,
    TurnStartBundleResolutionFailed,
    UnsupportedExecutionProfile,
    ProviderExhausted,
    StreamLifecycleViolation,
    DeadlineExceeded,
    StaleSnapshot,
    BackendUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::CapacityExhausted => "capacity_exhausted",
            ErrorKind::StaleAuthority => "stale_authority",
            ErrorKind::TerminalAlreadyEmitted => "terminal_already_emitted",
            ErrorKind::TurnStartBundleResolutionFailed => "turn_start_bundle_resolution_failed",
            ErrorKind::UnsupportedExecutionProfile => "unsupported_execution_profile",
            ErrorKind::ProviderExhausted => "provider_exhausted",
            ErrorKind::StreamLifecycleViolation => "stream_lifecycle_violation",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::StaleSnapshot => "stale_snapshot",
            ErrorKind::BackendUnavailable => "backend_unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The crate's single error type.
#[derive(Debug)]
pub struct CoreError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Construct a `StaleSnapshot` error. `StaleSnapshot` is singled out
    /// because bundle resolution (C2) treats it specially: it deterministically
    /// degrades to a pre-turn `Defer` regardless of `PlanFailurePolicy`.
    pub fn stale_snapshot(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::StaleSnapshot, "control_plane.stale_snapshot", message)
    }

    pub fn is_stale_snapshot(&self) -> bool {
        self.kind == ErrorKind::StaleSnapshot
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.kind, self.message)
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn StdError + 'static))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Stable error codes referenced by more than one module.
pub mod codes {
    pub const EMPTY_SESSION_ID: &str = "event.empty_session_id";
    pub const EMPTY_TURN_ID: &str = "event.empty_turn_id";
    pub const EMPTY_EVENT_ID: &str = "event.empty_event_id";
    pub const EMPTY_PIPELINE_VERSION: &str = "event.empty_pipeline_version";
    pub const UNRECOGNIZED_PAYLOAD_CLASS: &str = "event.unrecognized_payload_class";
    pub const NEGATIVE_FIELD: &str = "event.negative_field";
    pub const BUNDLE_RESOLUTION_FAILED: &str = "control_plane.bundle_resolution_failed";
    pub const UNSUPPORTED_EXECUTION_PROFILE: &str = "control_plane.unsupported_execution_profile";
    pub const EXECUTION_PROFILE_MISMATCH: &str = "control_plane.execution_profile_mismatch";
    pub const TERMINAL_ALREADY_EMITTED: &str = "arbiter.terminal_already_emitted";
    pub const NOT_ACTIVE: &str = "arbiter.not_active";
    pub const NOT_IDLE: &str = "arbiter.not_idle";
    pub const PROVIDER_EXHAUSTED: &str = "provider.exhausted";
    pub const STREAM_LIFECYCLE_VIOLATION: &str = "provider.stream_lifecycle_violation";
    pub const CAPACITY_EXHAUSTED: &str = "recorder.capacity_exhausted";
    pub const COMPLETENESS_FAILED: &str = "recorder.completeness_failed";
    pub const DUPLICATE_REGISTRATION: &str = "authority.duplicate_registration";
    pub const STALE_AUTHORITY: &str = "authority.stale";
}
