use crate::types::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Weight of the newest sample in the latency moving average.
const LATENCY_ALPHA: f64 = 0.3;

/// Dispatch metrics tracked per remote agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub in_flight: u32,
    pub total_dispatches: u64,
    pub errors: u64,
    pub consecutive_failures: u32,
    /// Exponential moving average of call latency; `None` until the first call.
    pub avg_latency_ms: Option<f64>,
    pub last_dispatch_at: Option<DateTime<Utc>>,
}

impl AgentStats {
    /// 1.0 for a healthy agent, approaching 0 as failures pile up.
    pub fn health(&self) -> f64 {
        1.0 / (1.0 + f64::from(self.consecutive_failures))
    }
}

/// Tracks in-flight dispatches, latency and failures of every agent the
/// dispatcher talks to.
pub struct AgentMonitor {
    stats: Arc<RwLock<HashMap<AgentId, AgentStats>>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record the start of a network call to an agent.
    pub async fn start_dispatch(&self, agent_id: &str) {
        let mut stats = self.stats.write().await;
        admit(stats.entry(agent_id.to_string()).or_default());
    }

    /// Start a call only if the agent stays below `ceiling` once
    /// `external_load` is counted. Returns whether the call was admitted.
    pub async fn try_start_dispatch(&self, agent_id: &str, external_load: u32, ceiling: u32) -> bool {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(agent_id.to_string()).or_default();
        if entry.in_flight + external_load >= ceiling {
            return false;
        }
        admit(entry);
        true
    }

    /// Record the end of a network call.
    pub async fn finish_dispatch(&self, agent_id: &str, latency_ms: u64, success: bool) {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(agent_id.to_string()).or_default();
        entry.in_flight = entry.in_flight.saturating_sub(1);
        let sample = latency_ms as f64;
        entry.avg_latency_ms = Some(match entry.avg_latency_ms {
            Some(avg) => avg + LATENCY_ALPHA * (sample - avg),
            None => sample,
        });
        if success {
            entry.consecutive_failures = 0;
        } else {
            entry.errors += 1;
            entry.consecutive_failures += 1;
        }
    }

    pub async fn in_flight(&self, agent_id: &str) -> u32 {
        self.stats
            .read()
            .await
            .get(agent_id)
            .map_or(0, |s| s.in_flight)
    }

    pub async fn get_stats(&self, agent_id: &str) -> Option<AgentStats> {
        self.stats.read().await.get(agent_id).cloned()
    }

    /// Snapshot of every tracked agent.
    pub async fn snapshot(&self) -> HashMap<AgentId, AgentStats> {
        self.stats.read().await.clone()
    }

    /// Serialize the current state as JSON (for the dashboard stream).
    pub async fn to_json(&self) -> serde_json::Value {
        let stats = self.snapshot().await;
        let in_flight: u32 = stats.values().map(|s| s.in_flight).sum();
        let errors: u64 = stats.values().map(|s| s.errors).sum();
        serde_json::json!({
            "agents": stats,
            "aggregate": { "in_flight": in_flight, "errors": errors },
        })
    }
}

fn admit(entry: &mut AgentStats) {
    entry.in_flight += 1;
    entry.total_dispatches += 1;
    entry.last_dispatch_at = Some(Utc::now());
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}
