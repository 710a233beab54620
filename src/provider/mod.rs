//! C6 — Provider registry & invocation controller.

pub mod invocation;
pub mod registry;

pub use invocation::*;
pub use registry::*;

/// The closed taxonomy of normalized provider outcomes (spec §3/§4.6).
/// Provider-specific raw errors are mapped into this set with the original
/// reason preserved as metadata on the attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutcomeClass {
    Success,
    Timeout,
    Overload,
    Blocked,
    InfrastructureFailure,
    Cancelled,
}

impl OutcomeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Success => "success",
            OutcomeClass::Timeout => "timeout",
            OutcomeClass::Overload => "overload",
            OutcomeClass::Blocked => "blocked",
            OutcomeClass::InfrastructureFailure => "infrastructure_failure",
            OutcomeClass::Cancelled => "cancelled",
        }
    }
}

/// Which adaptive action, if any, the controller selected in response to a
/// non-success attempt outcome (spec §3 `ProviderAttempt.retry_decision`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    None,
    Retry,
    ProviderSwitch,
    Fallback,
}

/// Speech pipeline modality a provider invocation targets (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Modality {
    Stt,
    Llm,
    Tts,
    External,
}
