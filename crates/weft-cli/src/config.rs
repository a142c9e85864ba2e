use serde::Deserialize;
use std::path::{Path, PathBuf};
use weft_core::{WeftError, WeftResult};
use weft_orchestrator::{AgentRecord, OrchestratorConfig};

/// Contents of `weft.toml`.
#[derive(Debug, Deserialize)]
pub struct WeftConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
    /// Seconds between expired-lock sweeps.
    #[serde(default = "default_lock_sweep_secs")]
    pub lock_sweep_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: vec![],
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_lock_sweep_secs() -> u64 {
    30
}

impl WeftConfig {
    pub fn parse(raw: &str) -> WeftResult<Self> {
        let config: WeftConfig =
            toml::from_str(raw).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> WeftResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            WeftError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    fn validate(&self) -> WeftResult<()> {
        if self.orchestrator.workers == 0 {
            return Err(WeftError::Config("orchestrator.workers must be at least 1".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(WeftError::Config(format!("duplicate agent id '{}'", agent.id)));
            }
            if agent.max_concurrent_tasks == 0 {
                return Err(WeftError::Config(format!(
                    "agent '{}' must allow at least one concurrent task",
                    agent.id
                )));
            }
        }
        Ok(())
    }
}
