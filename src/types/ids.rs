//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.
//! Named ids (functions, resources, teams) come from configuration-resolved
//! metadata; generated ids (processes, flows, jobs) are UUID v4.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `must()`, `as_str()`, Display,
/// Serialize, Deserialize. Optionally generates `new()` (UUID v4) and
/// `Default` if the `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            /// Construct from a literal, panicking on empty input.
            /// Intended for tests and build-time constants.
            #[allow(clippy::panic)]
            pub fn must(s: &str) -> Self {
                match Self::from_string(s.to_string()) {
                    Ok(id) => id,
                    Err(e) => panic!("{}", e),
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            /// Construct from a literal, panicking on empty input.
            /// Intended for tests and build-time constants.
            #[allow(clippy::panic)]
            pub fn must(s: &str) -> Self {
                match Self::from_string(s.to_string()) {
                    Ok(id) => id,
                    Err(e) => panic!("{}", e),
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// Configuration-resolved identities.
define_id!(FunctionId);
define_id!(ResourceId);
define_id!(TeamId);
define_id!(GovernanceId);
define_id!(StrategyId);

// Kernel-generated identities.
define_id!(ProcessId, uuid);
define_id!(ThreadContextId, uuid);
define_id!(FlowId, uuid);
define_id!(JobId, uuid);
define_id!(HandleId, uuid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_string_rejects_empty() {
        assert!(FunctionId::from_string(String::new()).is_err());
        assert!(FunctionId::from_string("work".to_string()).is_ok());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(FlowId::new(), FlowId::new());
        assert_ne!(ProcessId::new(), ProcessId::new());
    }

    #[test]
    fn display_round_trips() {
        let id = TeamId::must("workers");
        assert_eq!(id.to_string(), "workers");
        assert_eq!(id.as_str(), "workers");
    }
}
