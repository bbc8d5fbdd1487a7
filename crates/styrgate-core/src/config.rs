//! Gateway configuration.
//!
//! Every knob has a working default; a deployment overrides the parts
//! it cares about from a JSON file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::audit::AuditConfig;
use crate::breaker::BreakerConfig;
use crate::errors::Result;
use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Row cap injected into statements that carry no limit of their
    /// own.
    pub max_rows: usize,
    /// Database call timeout. A timed-out call counts as a breaker
    /// failure.
    pub query_timeout_ms: u64,
    /// Where dynamic rules and permission requests live.
    pub store_path: PathBuf,
    pub audit: AuditConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_rows: 100,
            query_timeout_ms: 30_000,
            store_path: PathBuf::from("./data/permissions.json"),
            audit: AuditConfig::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_rows": 25, "breaker": {{"cooldown_ms": 1000}}}}"#).unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_rows, 25);
        assert_eq!(config.breaker.cooldown_ms, 1000);
        // Untouched sections fall back to defaults
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.rate_limit.heavy_query.max_requests, 5);
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.max_rows, 100);
        assert_eq!(config.breaker.cooldown_ms, 300_000);
        assert_eq!(config.rate_limit.tracking.max_requests, 10);
    }
}
