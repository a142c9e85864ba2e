use crate::client::AgentTransport;
use crate::monitor::AgentStats;
use crate::types::AgentId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use weft_core::{WeftError, WeftResult};

/// Liveness of an agent as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

fn default_status() -> AgentStatus {
    AgentStatus::Online
}

fn default_max_concurrent() -> u32 {
    1
}

/// A remote worker that advertises capability tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_status")]
    pub status: AgentStatus,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            capabilities: BTreeSet::new(),
            status: AgentStatus::Online,
            max_concurrent_tasks: default_max_concurrent(),
            auth_token: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Read-only view of the agent fleet consulted by the dispatcher.
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    /// Online agents whose capability set contains `capability`.
    async fn find_capable_online_agents(&self, capability: &str) -> WeftResult<Vec<AgentRecord>>;

    /// Work the registry knows an agent is doing outside this dispatcher.
    async fn load_of(&self, agent_id: &str) -> u32;
}

/// Registry kept in memory; agents come from configuration or the API.
pub struct InMemoryRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    external_load: RwLock<HashMap<AgentId, u32>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            external_load: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_agents(agents: impl IntoIterator<Item = AgentRecord>) -> Self {
        let map = agents.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            agents: RwLock::new(map),
            external_load: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, agent: AgentRecord) {
        info!(agent_id = %agent.id, endpoint = %agent.endpoint, "Agent registered");
        self.agents.write().await.insert(agent.id.clone(), agent);
    }

    pub async fn deregister(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.write().await.remove(agent_id)
    }

    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> WeftResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| WeftError::NotFound(format!("agent {agent_id}")))?;
        agent.status = status;
        Ok(())
    }

    /// Record load reported by another subsystem (e.g. claimed board tasks).
    pub async fn set_load(&self, agent_id: &str, load: u32) {
        self.external_load
            .write()
            .await
            .insert(agent_id.to_string(), load);
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Probe every agent's health endpoint and flip its status accordingly.
    /// Returns the number of agents found online.
    pub async fn probe_all(&self, transport: &dyn AgentTransport, timeout: Duration) -> usize {
        let agents = self.list().await;
        let mut online = 0;
        for agent in agents {
            let status = match transport.health(&agent, timeout).await {
                Ok(report) if report.is_healthy() => AgentStatus::Online,
                Ok(report) => {
                    warn!(agent_id = %agent.id, status = %report.status, "Agent unhealthy");
                    AgentStatus::Offline
                }
                Err(e) => {
                    warn!(agent_id = %agent.id, error = %e, "Health probe failed");
                    AgentStatus::Offline
                }
            };
            if status == AgentStatus::Online {
                online += 1;
            }
            if let Some(record) = self.agents.write().await.get_mut(&agent.id) {
                record.status = status;
            }
        }
        online
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityRegistry for InMemoryRegistry {
    async fn find_capable_online_agents(&self, capability: &str) -> WeftResult<Vec<AgentRecord>> {
        let agents = self.agents.read().await;
        let mut found: Vec<AgentRecord> = agents
            .values()
            .filter(|a| a.status == AgentStatus::Online && a.has_capability(capability))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn load_of(&self, agent_id: &str) -> u32 {
        self.external_load
            .read()
            .await
            .get(agent_id)
            .copied()
            .unwrap_or(0)
    }
}

fn default_load_weight() -> f64 {
    1.0
}

fn default_latency_weight() -> f64 {
    0.001
}

fn default_health_weight() -> f64 {
    2.0
}

/// Weights of the agent ranking function. Higher score wins.
///
/// `score = health_weight * health - load_weight * load - latency_weight * avg_latency_ms`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringPolicy {
    #[serde(default = "default_load_weight")]
    pub load_weight: f64,
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
    #[serde(default = "default_health_weight")]
    pub health_weight: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            load_weight: default_load_weight(),
            latency_weight: default_latency_weight(),
            health_weight: default_health_weight(),
        }
    }
}

/// Inputs of the score for one candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CandidateSignals {
    /// Registry load plus this dispatcher's in-flight calls.
    pub load: u32,
    pub avg_latency_ms: f64,
    pub health: f64,
}

impl CandidateSignals {
    pub fn from_stats(external_load: u32, stats: Option<&AgentStats>) -> Self {
        match stats {
            Some(s) => Self {
                load: external_load + s.in_flight,
                avg_latency_ms: s.avg_latency_ms.unwrap_or(0.0),
                health: s.health(),
            },
            None => Self {
                load: external_load,
                avg_latency_ms: 0.0,
                health: 1.0,
            },
        }
    }
}

impl ScoringPolicy {
    pub fn score(&self, signals: &CandidateSignals) -> f64 {
        self.health_weight * signals.health
            - self.load_weight * f64::from(signals.load)
            - self.latency_weight * signals.avg_latency_ms
    }
}

/// Pick the best-scoring candidate that is below its concurrency ceiling and
/// not in `excluded`. Ties go to the lexicographically smaller agent id.
pub fn select_agent<'a>(
    candidates: &'a [(AgentRecord, CandidateSignals)],
    excluded: &HashSet<AgentId>,
    policy: &ScoringPolicy,
) -> Option<&'a AgentRecord> {
    candidates
        .iter()
        .filter(|(agent, _)| !excluded.contains(&agent.id))
        .filter(|(agent, signals)| signals.load < agent.max_concurrent_tasks)
        .map(|(agent, signals)| (agent, policy.score(signals)))
        .max_by(|(a, sa), (b, sb)| sa.total_cmp(sb).then_with(|| b.id.cmp(&a.id)))
        .map(|(agent, _)| agent)
}
