use crate::events::{run_channel, EventBus, OrchestrationEvent};
use crate::types::{AuditAction, ExecutionLogEntry};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

enum JournalMsg {
    Entry(Box<ExecutionLogEntry>),
    Flush(oneshot::Sender<()>),
}

/// Append-only record of every dispatch decision.
///
/// Entries are kept in memory per run and, when a journal directory is
/// configured, appended as JSON lines to `executions.jsonl` by a background
/// writer.
pub struct ExecutionLog {
    entries: RwLock<HashMap<Uuid, Vec<ExecutionLogEntry>>>,
    journal: Option<mpsc::UnboundedSender<JournalMsg>>,
    events: Option<Arc<EventBus>>,
}

impl ExecutionLog {
    /// In-memory log only.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            journal: None,
            events: None,
        }
    }

    /// Log that also persists to `<log_dir>/executions.jsonl`.
    /// Spawns the writer task, so it must be called inside a Tokio runtime.
    pub fn with_journal(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalMsg>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                error!(error = %e, dir = %log_dir.display(), "Cannot create audit directory");
                return;
            }
            let path = log_dir.join("executions.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Cannot open audit journal");
                    return;
                }
            };

            while let Some(msg) = rx.recv().await {
                match msg {
                    JournalMsg::Entry(entry) => {
                        if let Ok(line) = serde_json::to_string(&entry) {
                            let line = format!("{line}\n");
                            if let Err(e) = file.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to append audit entry");
                            }
                        }
                    }
                    JournalMsg::Flush(done) => {
                        if let Err(e) = file.flush().await {
                            error!(error = %e, "Failed to flush audit journal");
                        }
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            entries: RwLock::new(HashMap::new()),
            journal: Some(tx),
            events: None,
        }
    }

    /// Also publish every entry on the run's event channel.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn append(&self, entry: ExecutionLogEntry) {
        info!(
            run_id = %entry.run_id,
            stage_id = %entry.stage_id,
            agent_id = entry.agent_id.as_deref().unwrap_or("-"),
            action = %entry.action,
            attempt = entry.attempt,
            "audit"
        );
        if let Some(tx) = &self.journal {
            if tx.send(JournalMsg::Entry(Box::new(entry.clone()))).is_err() {
                warn!(
                    run_id = %entry.run_id,
                    stage_id = %entry.stage_id,
                    "Audit journal writer stopped; entry kept in memory only"
                );
            }
        }
        if let Some(events) = &self.events {
            events
                .publish(
                    &run_channel(entry.run_id),
                    OrchestrationEvent::Audit {
                        entry: entry.clone(),
                    },
                )
                .await;
        }
        self.entries
            .write()
            .await
            .entry(entry.run_id)
            .or_default()
            .push(entry);
    }

    pub async fn record(
        &self,
        run_id: Uuid,
        stage_id: &str,
        agent_id: Option<&str>,
        action: AuditAction,
        attempt: u32,
        detail: serde_json::Value,
    ) {
        self.append(ExecutionLogEntry {
            id: Uuid::new_v4(),
            run_id,
            stage_id: stage_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            action,
            attempt,
            timestamp: Utc::now(),
            detail,
        })
        .await;
    }

    /// Every entry of a run, in append order.
    pub async fn for_run(&self, run_id: Uuid) -> Vec<ExecutionLogEntry> {
        self.entries
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn for_stage(&self, run_id: Uuid, stage_id: &str) -> Vec<ExecutionLogEntry> {
        self.for_run(run_id)
            .await
            .into_iter()
            .filter(|e| e.stage_id == stage_id)
            .collect()
    }

    pub async fn count_action(&self, run_id: Uuid, action: AuditAction) -> usize {
        self.entries
            .read()
            .await
            .get(&run_id)
            .map_or(0, |entries| entries.iter().filter(|e| e.action == action).count())
    }

    /// Wait until the journal writer has written everything sent so far.
    pub async fn flush(&self) {
        if let Some(tx) = &self.journal {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(JournalMsg::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_query() {
        let log = ExecutionLog::new();
        let run = Uuid::new_v4();
        log.record(run, "research", Some("a1"), AuditAction::Execute, 1, json!({}))
            .await;
        log.record(run, "research", Some("a1"), AuditAction::Complete, 1, json!({}))
            .await;
        log.record(run, "audit", Some("a2"), AuditAction::Execute, 1, json!({}))
            .await;

        assert_eq!(log.for_run(run).await.len(), 3);
        assert_eq!(log.for_stage(run, "research").await.len(), 2);
        assert_eq!(log.count_action(run, AuditAction::Execute).await, 2);
        assert!(log.for_run(Uuid::new_v4()).await.is_empty());
    }

    #[tokio::test]
    async fn test_journal_persists_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ExecutionLog::with_journal(tmp.path().join("audit"));
        let run = Uuid::new_v4();
        log.record(run, "research", Some("a1"), AuditAction::Execute, 1, json!({"k": 1}))
            .await;
        log.record(run, "research", Some("a1"), AuditAction::Fail, 0, json!({}))
            .await;
        log.flush().await;

        let content = tokio::fs::read_to_string(tmp.path().join("audit/executions.jsonl"))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "execute");
        assert_eq!(first["stage_id"], "research");
    }

    #[tokio::test]
    async fn test_dead_journal_keeps_entries_in_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        tokio::fs::write(&blocker, b"x").await.unwrap();

        // The writer cannot create its directory under a regular file.
        let log = ExecutionLog::with_journal(blocker.join("audit"));
        log.flush().await;

        let run = Uuid::new_v4();
        log.record(run, "research", Some("a1"), AuditAction::Execute, 1, json!({}))
            .await;
        log.flush().await;
        assert_eq!(log.for_run(run).await.len(), 1);
        assert!(!blocker.join("audit").exists());
    }

    #[tokio::test]
    async fn test_entries_published_to_run_channel() {
        let bus = Arc::new(EventBus::new());
        let log = ExecutionLog::new().with_events(bus.clone());
        let run = Uuid::new_v4();
        let mut sub = bus.subscribe(run_channel(run)).await;
        log.record(run, "s", None, AuditAction::Cached, 0, json!({}))
            .await;
        match sub.rx.recv().await.unwrap() {
            OrchestrationEvent::Audit { entry } => assert_eq!(entry.action, AuditAction::Cached),
            other => panic!("unexpected {other:?}"),
        }
    }
}
