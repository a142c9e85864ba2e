use crate::dispatch::DispatchConfig;
use crate::registry::ScoringPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_workers() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

/// `[orchestrator]` section of `weft.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Size of the worker pool, i.e. how many stages dispatch at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bound of a single `/health` probe.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub scoring: ScoringPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            scoring: ScoringPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            scoring: self.scoring,
        }
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_section_uses_defaults() {
        let config: OrchestratorConfig = serde_json::from_value(serde_json::json!({
            "workers": 2,
            "scoring": { "load_weight": 3.0 }
        }))
        .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.scoring.load_weight, 3.0);
        assert_eq!(config.scoring.health_weight, 2.0);
    }

    #[test]
    fn test_dispatch_config_conversion() {
        let dispatch = OrchestratorConfig::default().dispatch_config();
        assert_eq!(dispatch.poll_interval, Duration::from_millis(500));
        assert_eq!(dispatch.cache_ttl, Duration::from_secs(300));
    }
}
