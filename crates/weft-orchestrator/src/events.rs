use crate::types::{ExecutionLogEntry, RunStatus, StageStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Channel carrying events of one workflow run.
pub fn run_channel(run_id: Uuid) -> String {
    format!("run:{run_id}")
}

/// Channel carrying events of one team's task board.
pub fn team_channel(team_uuid: Uuid) -> String {
    format!("team:{team_uuid}")
}

/// Notification published to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    RunStatusChanged {
        run_id: Uuid,
        status: RunStatus,
    },
    StageStatusChanged {
        run_id: Uuid,
        stage_id: String,
        status: StageStatus,
        agent_id: Option<String>,
    },
    Audit {
        entry: ExecutionLogEntry,
    },
    TaskStatusChanged {
        team_uuid: Uuid,
        task_uuid: Uuid,
        status: TaskStatus,
    },
}

/// A live subscription. Dropping the receiver is detected lazily; call
/// [`EventBus::unsubscribe`] to deregister eagerly.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub channel: String,
    pub rx: mpsc::UnboundedReceiver<OrchestrationEvent>,
}

/// Publish/subscribe message passing keyed by channel id.
pub struct EventBus {
    channels: RwLock<HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<OrchestrationEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.channels
            .write()
            .await
            .entry(channel.clone())
            .or_default()
            .insert(id, tx);
        tracing::debug!(channel = %channel, subscriber = %id, "Subscriber added");
        Subscription { id, channel, rx }
    }

    pub async fn unsubscribe(&self, channel: &str, id: Uuid) -> bool {
        let mut channels = self.channels.write().await;
        let Some(subs) = channels.get_mut(channel) else {
            return false;
        };
        let removed = subs.remove(&id).is_some();
        if subs.is_empty() {
            channels.remove(channel);
        }
        if removed {
            tracing::debug!(channel = %channel, subscriber = %id, "Subscriber removed");
        }
        removed
    }

    /// Deliver an event to every subscriber of `channel`. Subscribers whose
    /// receiver is gone are pruned. Returns the number of deliveries.
    pub async fn publish(&self, channel: &str, event: OrchestrationEvent) -> usize {
        let mut stale = Vec::new();
        let mut delivered = 0;
        {
            let channels = self.channels.read().await;
            let Some(subs) = channels.get(channel) else {
                return 0;
            };
            for (id, tx) in subs {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    stale.push(*id);
                }
            }
        }
        for id in stale {
            self.unsubscribe(channel, id).await;
        }
        delivered
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, HashMap::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
