//! Newtype domain identifiers.
//!
//! Every concept with an identity is a distinct newtype wrapping a primitive,
//! so a [`TriggerKey`] can never be passed where a [`DeliveryId`] is expected
//! even though both are strings under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (broker supplied)
// ---------------------------------------------------------------------------

string_id! {
    /// Scopes debounce and rate-limit state.
    ///
    /// Derived from a message's routing key, or from a configured header when
    /// the routing key is too coarse (e.g. one topic carrying many services).
    TriggerKey
}

string_id! {
    /// Broker-assigned (or publisher-assigned) identity of a message.
    ///
    /// Redeliveries of the same message carry the same delivery id, which is
    /// what the trigger policy deduplicates on.
    DeliveryId
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies one execution of the configured command.
///
/// Generated fresh for every `Fire` decision; propagated through spans so all
/// log lines from a single child process can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(Uuid);

impl InvocationId {
    /// Generates a new random invocation identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_ids_are_rejected() {
        assert!(TriggerKey::new("").is_none());
        assert!(DeliveryId::new(String::new()).is_none());
    }

    #[test]
    fn string_ids_display_their_value() {
        let key = TriggerKey::new("alerts.disk").unwrap();
        assert_eq!(key.as_str(), "alerts.disk");
        assert_eq!(key.to_string(), "alerts.disk");
    }

    #[test]
    fn invocation_ids_are_unique() {
        assert_ne!(InvocationId::new_random(), InvocationId::new_random());
    }
}
