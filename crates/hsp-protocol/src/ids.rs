//! Typed identifiers used on the HSP wire.
//!
//! Every id is an opaque, serde-transparent `String`. Peers built in other
//! languages are free to choose their own id scheme; this crate only mints
//! UUID v4 values when it has to create one itself.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new id using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the id is the empty string (treated as absent on the wire).
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier of one envelope. Unique per sender.
    MessageId
);
typed_id!(
    /// Identity of an HSP participant agent (HPA).
    AgentId
);
typed_id!(
    /// Identifier of a capability, unique per advertiser.
    CapabilityId
);
typed_id!(
    /// Identifier of a task request; also the correlation key for its results.
    RequestId
);
typed_id!(
    /// Identifier of one task result message.
    ResultId
);
typed_id!(
    /// Identifier of a fact, belief or opinion.
    FactId
);

impl MessageId {
    pub fn generate() -> Self {
        Self::new_uuid()
    }
}
