//! Narrow contracts of the budget and result-cache collaborators.
//!
//! The dispatcher consults both before calling an agent. Neither is required:
//! without a budget guard every dispatch is allowed, without a cache every
//! dispatch goes to an agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// What to do when a dispatch would exceed the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetAction {
    /// Defer the dispatch; the stage waits and asks again.
    Pause,
    /// Fail the stage outright.
    Kill,
}

/// Answer of the budget collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub action: Option<BudgetAction>,
}

impl BudgetDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            action: None,
        }
    }

    pub fn deny(action: BudgetAction) -> Self {
        Self {
            allowed: false,
            action: Some(action),
        }
    }
}

#[async_trait]
pub trait BudgetGuard: Send + Sync {
    async fn check_budget(&self, scope: &str, additional_cost_cents: u64) -> BudgetDecision;
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn lookup(&self, capability: &str, input: &serde_json::Value) -> Option<serde_json::Value>;

    async fn store(
        &self,
        capability: &str,
        input: &serde_json::Value,
        output: &serde_json::Value,
        ttl: Duration,
    );
}

/// Cache key: SHA-256 over the capability and the serialized input.
pub fn cache_key(capability: &str, input: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(capability.as_bytes());
    hasher.update([0u8]);
    hasher.update(input.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

struct CacheEntry {
    output: serde_json::Value,
    expires_at: Instant,
}

/// Process-local [`ResultCache`] with per-entry TTL.
#[derive(Default)]
pub struct InMemoryResultCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop expired entries.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn lookup(&self, capability: &str, input: &serde_json::Value) -> Option<serde_json::Value> {
        let key = cache_key(capability, input);
        let entries = self.entries.read().await;
        entries
            .get(&key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.output.clone())
    }

    async fn store(
        &self,
        capability: &str,
        input: &serde_json::Value,
        output: &serde_json::Value,
        ttl: Duration,
    ) {
        let key = cache_key(capability, input);
        self.entries.write().await.insert(
            key,
            CacheEntry {
                output: output.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}
