//! Identity types for Fleetline records.
//!
//! Identifiers are issued by the hosted backend and arrive as opaque strings,
//! so both wrappers only guarantee they are distinct types at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Organization identifier. Every cache key and subscription is scoped by one.
    TenantId
);

string_id!(
    /// Identifier of a single row (equipment, work order, team, ...).
    RecordId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_as_str_agree() {
        let tenant = TenantId::new("org-1");
        assert_eq!(tenant.to_string(), "org-1");
        assert_eq!(tenant.as_str(), "org-1");
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = RecordId::from("eq-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"eq-1\"");
        let back: RecordId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
