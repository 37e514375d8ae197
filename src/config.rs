//! Database Configuration
//!
//! Tunables for locking, change streams, CDC and cascading deletes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cdc::OverflowPolicy;
use crate::error::{DbError, DbResult};

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    /// Collection lock lease in milliseconds (default: 1000)
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,

    /// Buffered events per change-stream subscriber (default: 256)
    #[serde(default = "default_change_stream_capacity")]
    pub change_stream_capacity: usize,

    /// What a full subscriber channel drops (default: drop_oldest)
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Persist and publish change records (default: true)
    #[serde(default = "default_cdc_enabled")]
    pub cdc_enabled: bool,

    /// Longest chain of cascading deletes (default: 32)
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: usize,

    /// Page size applied when a query sets no limit; 0 is unlimited (default: 0)
    #[serde(default)]
    pub default_limit: usize,
}

fn default_lock_lease_ms() -> u64 {
    1000
}

fn default_change_stream_capacity() -> usize {
    256
}

fn default_cdc_enabled() -> bool {
    true
}

fn default_max_cascade_depth() -> usize {
    32
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            lock_lease_ms: default_lock_lease_ms(),
            change_stream_capacity: default_change_stream_capacity(),
            overflow_policy: OverflowPolicy::default(),
            cdc_enabled: default_cdc_enabled(),
            max_cascade_depth: default_max_cascade_depth(),
            default_limit: 0,
        }
    }
}

impl DbConfig {
    /// Parses a JSON configuration; absent keys take their defaults
    pub fn from_json(raw: &str) -> DbResult<Self> {
        let config: DbConfig = serde_json::from_str(raw)
            .map_err(|e| DbError::validation(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.lock_lease_ms == 0 {
            return Err(DbError::validation("lock_lease_ms must be positive"));
        }
        if self.change_stream_capacity == 0 {
            return Err(DbError::validation("change_stream_capacity must be positive"));
        }
        if self.max_cascade_depth == 0 {
            return Err(DbError::validation("max_cascade_depth must be positive"));
        }
        Ok(())
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease_ms = lease.as_millis().max(1) as u64;
        self
    }

    pub fn with_change_stream_capacity(mut self, capacity: usize) -> Self {
        self.change_stream_capacity = capacity;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_cdc(mut self, enabled: bool) -> Self {
        self.cdc_enabled = enabled;
        self
    }

    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbConfig::default();
        assert_eq!(config.lock_lease_ms, 1000);
        assert_eq!(config.change_stream_capacity, 256);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert!(config.cdc_enabled);
        assert_eq!(config.max_cascade_depth, 32);
        assert_eq!(config.default_limit, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            DbConfig::from_json(r#"{"lock_lease_ms": 50, "overflow_policy": "reject_newest"}"#)
                .unwrap();
        assert_eq!(config.lock_lease(), Duration::from_millis(50));
        assert_eq!(config.overflow_policy, OverflowPolicy::RejectNewest);
        assert_eq!(config.change_stream_capacity, 256);
    }

    #[test]
    fn test_invalid_config() {
        assert!(DbConfig::from_json(r#"{"change_stream_capacity": 0}"#).is_err());
        assert!(DbConfig::default().with_max_cascade_depth(0).validate().is_err());
    }
}
