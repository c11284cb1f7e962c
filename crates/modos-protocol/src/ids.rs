//! Canonical ID types for the runtime.
//!
//! IDs are opaque String wrappers (serde-transparent). Request ids are
//! generated as UUID v4; module ids are the module's manifest name.

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

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
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
    /// Globally unique identifier for one inbound call or correlated bus call.
    RequestId
);
typed_id!(
    /// Identifier of a module. Equal to the manifest `name`.
    ModuleId
);

impl RequestId {
    /// Create a new request id using UUID v4 (random).
    pub fn new_uuid() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accept an externally supplied id only if it is a well-formed UUID.
    ///
    /// Inbound ids are a correlation hint, never an authentication signal.
    pub fn parse_hint(raw: &str) -> Option<Self> {
        uuid::Uuid::parse_str(raw.trim())
            .ok()
            .map(|uuid| Self(uuid.to_string()))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new_uuid()
    }
}
