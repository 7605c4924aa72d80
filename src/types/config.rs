//! Configuration structures.
//!
//! Configuration is pre-resolved by upstream collaborators; the kernel only
//! consumes the deadlines below. Every suspension point (resource load,
//! unmanaged handle, recycle) accepts an optional per-entity override; these
//! are the process-wide defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Deadline for an asynchronous resource load. On expiry the container
    /// transitions to Failed and dependents receive an AsyncTimeout
    /// escalation.
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,

    /// Deadline for an unmanaged asynchronous handle created by a function.
    #[serde(with = "humantime_serde")]
    pub handle_timeout: Duration,

    /// Deadline for recycling a managed resource at scope exit.
    #[serde(with = "humantime_serde")]
    pub recycle_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            handle_timeout: Duration::from_secs(30),
            recycle_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = KernelConfig::default();
        assert_eq!(config.load_timeout, Duration::from_secs(10));
        assert_eq!(config.handle_timeout, Duration::from_secs(30));
        assert_eq!(config.recycle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn humantime_round_trip() {
        let json = r#"{"load_timeout":"50ms","handle_timeout":"2s","recycle_timeout":"1s"}"#;
        let config: KernelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.load_timeout, Duration::from_millis(50));
        assert_eq!(config.handle_timeout, Duration::from_secs(2));
    }
}
