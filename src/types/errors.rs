//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.
//!
//! This enum covers construction-fatal and API-misuse failures only. Runtime
//! failures inside scheduled work are not errors in this sense - they become
//! [`Escalation`](crate::kernel::escalation::Escalation) values threaded
//! through continuations, so they survive cross-team hand-off where a call
//! stack cannot.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the Foreman kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed metadata detected at construction: missing execution
    /// strategy, unknown team, dangling flow linkage. Fatal - prevents
    /// startup, never escalates.
    #[error("configuration error: {0}")]
    Config(String),

    /// Referenced entity does not exist (function, resource, team, flow).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid lifecycle transition (container, team, process context).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Convenience constructors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::config("executive exposes no execution strategies");
        assert_eq!(
            err.to_string(),
            "configuration error: executive exposes no execution strategies"
        );
    }

    #[test]
    fn serde_error_converts() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
