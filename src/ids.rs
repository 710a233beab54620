//! Identifier newtypes shared across every component.
//!
//! Every identifier in the turn lifecycle is backed by a non-empty string so
//! that an empty `session_id`/`turn_id`/`event_id` fails at the boundary
//! (C1's `NormalizeEvent`) instead of propagating into a replay artifact.

use std::fmt;
use std::sync::Arc;

use crate::error::{CoreError, ErrorKind};

/// A string guaranteed to be non-empty and non-whitespace-only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyStr(Arc<str>);

impl NonEmptyStr {
    pub fn new(value: impl Into<Arc<str>>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(CoreError::new(
                ErrorKind::InvalidInput,
                "identifier.empty",
                "identifier must not be empty or whitespace-only",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NonEmptyStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! id_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonEmptyStr);

        impl $name {
            pub fn parse(value: impl Into<Arc<str>>) -> Result<Self, CoreError> {
                Ok(Self(NonEmptyStr::new(value)?))
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.as_str().to_owned()
            }
        }
    };
}

id_newtype!(SessionId, "Identifies one session for its full lifetime.");
id_newtype!(TurnId, "Identifies one turn, unique within its session.");
id_newtype!(EventId, "Identifies one transport-originated event.");
id_newtype!(
    ProviderInvocationId,
    "Identifies one provider invocation (a sequence of attempts) within a turn."
);
id_newtype!(
    CorrelationId,
    "Cross-cutting correlation id propagated through telemetry."
);
id_newtype!(
    IdempotencyKey,
    "Caller-supplied key used to deduplicate turn/invocation registration."
);
