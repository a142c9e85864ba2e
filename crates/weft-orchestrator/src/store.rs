use crate::events::{run_channel, EventBus, OrchestrationEvent};
use crate::types::{RunStatus, StageExecution, StageStatus, WorkflowRun};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;
use weft_core::{WeftError, WeftResult};

struct RunEntry {
    run: WorkflowRun,
    /// Keyed by stage id; ordering comes from `run.stages`.
    executions: HashMap<String, StageExecution>,
}

/// Shared state of every run and its stage executions.
///
/// All mutations are single-record and status-guarded: a transition the
/// state machine does not allow is rejected instead of applied.
pub struct RunStore {
    runs: RwLock<HashMap<Uuid, RunEntry>>,
    events: Option<Arc<EventBus>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Insert a freshly planned run with every stage `pending`.
    pub async fn insert(&self, run: WorkflowRun) {
        let executions = run
            .stages
            .iter()
            .map(|s| (s.id.clone(), StageExecution::new(run.id, s.id.clone())))
            .collect();
        self.runs
            .write()
            .await
            .insert(run.id, RunEntry { run, executions });
    }

    pub async fn contains(&self, run_id: Uuid) -> bool {
        self.runs.read().await.contains_key(&run_id)
    }

    pub async fn run(&self, run_id: Uuid) -> Option<WorkflowRun> {
        self.runs.read().await.get(&run_id).map(|e| e.run.clone())
    }

    pub async fn stage(&self, run_id: Uuid, stage_id: &str) -> Option<StageExecution> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .and_then(|e| e.executions.get(stage_id).cloned())
    }

    /// Stage executions in declaration order.
    pub async fn stages(&self, run_id: Uuid) -> Vec<StageExecution> {
        let runs = self.runs.read().await;
        let Some(entry) = runs.get(&run_id) else {
            return Vec::new();
        };
        entry
            .run
            .stages
            .iter()
            .filter_map(|s| entry.executions.get(&s.id).cloned())
            .collect()
    }

    /// Outputs of every completed stage of a run.
    pub async fn completed_outputs(&self, run_id: Uuid) -> HashMap<String, serde_json::Value> {
        let runs = self.runs.read().await;
        let Some(entry) = runs.get(&run_id) else {
            return HashMap::new();
        };
        entry
            .executions
            .values()
            .filter(|e| e.status == StageStatus::Completed)
            .map(|e| {
                (
                    e.stage_id.clone(),
                    e.output.clone().unwrap_or(serde_json::Value::Null),
                )
            })
            .collect()
    }

    pub async fn list(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .read()
            .await
            .values()
            .map(|e| e.run.clone())
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Move a stage to `next`, applying `update` to the record in the same
    /// critical section. Fails with a conflict if the move is not allowed.
    pub async fn transition_stage<F>(
        &self,
        run_id: Uuid,
        stage_id: &str,
        next: StageStatus,
        update: F,
    ) -> WeftResult<StageExecution>
    where
        F: FnOnce(&mut StageExecution),
    {
        let updated = {
            let mut runs = self.runs.write().await;
            let entry = runs
                .get_mut(&run_id)
                .ok_or_else(|| WeftError::NotFound(format!("run {run_id}")))?;
            let exec = entry
                .executions
                .get_mut(stage_id)
                .ok_or_else(|| WeftError::NotFound(format!("stage {stage_id} in run {run_id}")))?;

            if !exec.status.can_transition_to(next) {
                return Err(WeftError::Conflict(format!(
                    "stage {stage_id} cannot move from {} to {next}",
                    exec.status
                )));
            }

            let was_terminal = exec.status.is_terminal();
            exec.status = next;
            update(exec);
            let now = Utc::now();
            if next == StageStatus::Dispatched && exec.started_at.is_none() {
                exec.started_at = Some(now);
            }
            if next.is_terminal() {
                exec.completed_at = Some(now);
            }
            let snapshot = exec.clone();

            if !was_terminal {
                match next {
                    StageStatus::Completed => entry.run.progress.completed += 1,
                    StageStatus::Failed => entry.run.progress.failed += 1,
                    _ => {}
                }
            }
            snapshot
        };

        debug!(
            run_id = %run_id,
            stage_id = %stage_id,
            status = %next,
            agent_id = updated.assigned_agent_id.as_deref().unwrap_or("-"),
            "Stage transition"
        );
        if let Some(events) = &self.events {
            events
                .publish(
                    &run_channel(run_id),
                    OrchestrationEvent::StageStatusChanged {
                        run_id,
                        stage_id: stage_id.to_string(),
                        status: next,
                        agent_id: updated.assigned_agent_id.clone(),
                    },
                )
                .await;
        }
        Ok(updated)
    }

    /// Mutate a stage record without changing its status.
    pub async fn update_stage<F>(&self, run_id: Uuid, stage_id: &str, update: F) -> WeftResult<()>
    where
        F: FnOnce(&mut StageExecution),
    {
        let mut runs = self.runs.write().await;
        let exec = runs
            .get_mut(&run_id)
            .and_then(|e| e.executions.get_mut(stage_id))
            .ok_or_else(|| WeftError::NotFound(format!("stage {stage_id} in run {run_id}")))?;
        update(exec);
        Ok(())
    }

    /// Move a run forward. Returns `false` when the run is already past
    /// `next` (terminal runs never change).
    pub async fn transition_run(
        &self,
        run_id: Uuid,
        next: RunStatus,
        error_message: Option<String>,
    ) -> WeftResult<bool> {
        {
            let mut runs = self.runs.write().await;
            let entry = runs
                .get_mut(&run_id)
                .ok_or_else(|| WeftError::NotFound(format!("run {run_id}")))?;
            let run = &mut entry.run;
            if !run.status.can_transition_to(next) {
                return Ok(false);
            }
            run.status = next;
            if next.is_terminal() {
                run.completed_at = Some(Utc::now());
            }
            if error_message.is_some() {
                run.error_message = error_message;
            }
        }

        info!(run_id = %run_id, status = %next, "Run transition");
        if let Some(events) = &self.events {
            events
                .publish(
                    &run_channel(run_id),
                    OrchestrationEvent::RunStatusChanged {
                        run_id,
                        status: next,
                    },
                )
                .await;
        }
        Ok(true)
    }

    pub async fn set_current_level(&self, run_id: Uuid, level: usize) {
        if let Some(entry) = self.runs.write().await.get_mut(&run_id) {
            entry.run.progress.current_level = level;
        }
    }
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{RunProgress, StageDefinition};

    fn sample_run() -> WorkflowRun {
        let stages = vec![
            StageDefinition::new("research", "research"),
            StageDefinition::new("audit", "audit").with_dependencies(["research"]),
        ];
        WorkflowRun {
            id: Uuid::new_v4(),
            name: "review".into(),
            progress: RunProgress {
                total: stages.len(),
                total_levels: 2,
                ..RunProgress::default()
            },
            stages,
            input: serde_json::json!({}),
            levels: vec![vec!["research".into()], vec!["audit".into()]],
            status: RunStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_insert_creates_pending_stages() {
        let store = RunStore::new();
        let run = sample_run();
        let id = run.id;
        store.insert(run).await;

        let stages = store.stages(id).await;
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].stage_id, "research");
        assert!(stages.iter().all(|s| s.status == StageStatus::Pending));
    }

    #[tokio::test]
    async fn test_guarded_stage_transitions() {
        let store = RunStore::new();
        let run = sample_run();
        let id = run.id;
        store.insert(run).await;

        let err = store
            .transition_stage(id, "research", StageStatus::Dispatched, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        store
            .transition_stage(id, "research", StageStatus::Ready, |_| {})
            .await
            .unwrap();
        store
            .transition_stage(id, "research", StageStatus::Dispatched, |e| {
                e.attempts += 1;
                e.assigned_agent_id = Some("a1".into());
            })
            .await
            .unwrap();
        let done = store
            .transition_stage(id, "research", StageStatus::Completed, |e| {
                e.output = Some(serde_json::json!({"summary": "ok"}));
            })
            .await
            .unwrap();
        assert_eq!(done.attempts, 1);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());

        assert!(store
            .transition_stage(id, "research", StageStatus::Failed, |_| {})
            .await
            .is_err());
        assert_eq!(store.run(id).await.unwrap().progress.completed, 1);
        assert_eq!(
            store.completed_outputs(id).await["research"],
            serde_json::json!({"summary": "ok"})
        );
    }

    #[tokio::test]
    async fn test_run_never_leaves_terminal_state() {
        let store = RunStore::new();
        let run = sample_run();
        let id = run.id;
        store.insert(run).await;

        assert!(store.transition_run(id, RunStatus::InProgress, None).await.unwrap());
        assert!(store
            .transition_run(id, RunStatus::Failed, Some("stage audit failed".into()))
            .await
            .unwrap());
        assert!(!store.transition_run(id, RunStatus::Completed, None).await.unwrap());

        let run = store.run(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("stage audit failed"));
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let store = RunStore::new();
        let err = store
            .transition_run(Uuid::new_v4(), RunStatus::InProgress, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(store.stages(Uuid::new_v4()).await.is_empty());
    }
}
