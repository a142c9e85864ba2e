//! Kanban façade: tasks with dependency chains outside of any workflow run.
//!
//! A task with dependencies starts in `backlog` and is promoted to `todo`
//! once every dependency is `done`, with its input mapping resolved against
//! their outputs. Promotion runs on a background task when
//! [`TaskBoard::spawn_promoter`] is active, inline otherwise.

use crate::events::{team_channel, EventBus, OrchestrationEvent};
use crate::resolver::{references, resolve_task, Syntax, TemplateRef};
use crate::types::{AgentId, BoardTask, TaskOutcome, TaskStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use weft_core::{WeftError, WeftResult};

/// Request to create a board task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub team_uuid: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_capability: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub input_mapping: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// One upstream task as seen from a dependent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyContext {
    pub task_uuid: Uuid,
    pub title: String,
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
    pub output: Option<serde_json::Value>,
}

/// Resolved dependency context of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_uuid: Uuid,
    pub dependencies: Vec<DependencyContext>,
    /// Input mapping resolved against the dependencies' current outputs.
    pub resolved_input: serde_json::Value,
    pub ready: bool,
}

fn dependency_satisfied(dep: &BoardTask) -> bool {
    dep.status == TaskStatus::Done && !dep.is_dead_letter()
}

fn resolve_mapping(
    mapping: &BTreeMap<String, serde_json::Value>,
    outputs: &HashMap<Uuid, serde_json::Value>,
) -> WeftResult<serde_json::Value> {
    let mut resolved = serde_json::Map::new();
    for (key, template) in mapping {
        resolved.insert(key.clone(), resolve_task(template, outputs)?);
    }
    Ok(serde_json::Value::Object(resolved))
}

fn dependency_outputs(
    tasks: &HashMap<Uuid, BoardTask>,
    task: &BoardTask,
) -> HashMap<Uuid, serde_json::Value> {
    task.depends_on
        .iter()
        .filter_map(|id| tasks.get(id))
        .filter_map(|dep| dep.output.clone().map(|out| (dep.task_uuid, out)))
        .collect()
}

/// In-memory kanban board shared by every team.
pub struct TaskBoard {
    tasks: RwLock<HashMap<Uuid, BoardTask>>,
    events: Option<Arc<EventBus>>,
    promoter: Mutex<Option<mpsc::UnboundedSender<Uuid>>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            events: None,
            promoter: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    async fn publish(&self, task: &BoardTask) {
        if let Some(events) = &self.events {
            events
                .publish(
                    &team_channel(task.team_uuid),
                    OrchestrationEvent::TaskStatusChanged {
                        team_uuid: task.team_uuid,
                        task_uuid: task.task_uuid,
                        status: task.status,
                    },
                )
                .await;
        }
    }

    /// Start the background promoter. Completions are then handed to it
    /// instead of being promoted inline.
    pub fn spawn_promoter(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Uuid>();
        *self.promoter.lock() = Some(tx);
        let board = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(done_uuid) = rx.recv().await {
                let promoted = board.promote_dependents(done_uuid).await;
                if !promoted.is_empty() {
                    debug!(task_uuid = %done_uuid, promoted = promoted.len(), "Dependents promoted");
                }
            }
        })
    }

    /// Hand a finished task to the promoter, or promote inline without one.
    async fn on_done(&self, task_uuid: Uuid) {
        let sent = match self.promoter.lock().as_ref() {
            Some(tx) => tx.send(task_uuid).is_ok(),
            None => false,
        };
        if !sent {
            self.promote_dependents(task_uuid).await;
        }
    }

    pub async fn create(&self, request: NewTask) -> WeftResult<BoardTask> {
        if request.title.trim().is_empty() {
            return Err(WeftError::Validation("task title is empty".into()));
        }
        for template in request.input_mapping.values() {
            for reference in references(template, Syntax::Task)? {
                if let TemplateRef::TaskOutput { task_uuid, .. } = reference {
                    if !request.depends_on.contains(&task_uuid) {
                        return Err(WeftError::Validation(format!(
                            "input mapping references task {task_uuid}, which is not a dependency"
                        )));
                    }
                }
            }
        }

        let task = {
            let mut tasks = self.tasks.write().await;
            for dep in &request.depends_on {
                if !tasks.contains_key(dep) {
                    return Err(WeftError::NotFound(format!("dependency task {dep}")));
                }
            }

            let now = Utc::now();
            let mut task = BoardTask {
                task_uuid: Uuid::new_v4(),
                team_uuid: request.team_uuid,
                title: request.title,
                description: request.description,
                status: TaskStatus::Backlog,
                outcome: None,
                required_capability: request.required_capability,
                assigned_agent_id: None,
                depends_on: request.depends_on,
                input_mapping: request.input_mapping,
                resolved_input: None,
                output: None,
                retry_count: 0,
                max_retries: request.max_retries,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            if task.depends_on.is_empty() {
                task.resolved_input = Some(resolve_mapping(&task.input_mapping, &HashMap::new())?);
                task.status = TaskStatus::Todo;
            }
            tasks.insert(task.task_uuid, task.clone());
            task
        };

        info!(
            task_uuid = %task.task_uuid,
            team_uuid = %task.team_uuid,
            status = %task.status,
            "Task created"
        );
        self.publish(&task).await;

        // Dependencies may all be done already; give the promoter a look.
        if task.status == TaskStatus::Backlog {
            self.try_promote(task.task_uuid).await?;
        }
        self.get(task.task_uuid).await
    }

    pub async fn get(&self, task_uuid: Uuid) -> WeftResult<BoardTask> {
        self.tasks
            .read()
            .await
            .get(&task_uuid)
            .cloned()
            .ok_or_else(|| WeftError::NotFound(format!("task {task_uuid}")))
    }

    /// Tasks of a team, oldest first.
    pub async fn list_team(&self, team_uuid: Uuid) -> Vec<BoardTask> {
        let mut tasks: Vec<BoardTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.team_uuid == team_uuid)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Promote a `backlog` task whose dependencies are all done. Idempotent;
    /// returns whether this call promoted it.
    pub async fn try_promote(&self, task_uuid: Uuid) -> WeftResult<bool> {
        let promoted = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get(&task_uuid) else {
                return Err(WeftError::NotFound(format!("task {task_uuid}")));
            };
            if task.status != TaskStatus::Backlog {
                return Ok(false);
            }
            let all_done = task
                .depends_on
                .iter()
                .all(|dep| tasks.get(dep).is_some_and(dependency_satisfied));
            if !all_done {
                return Ok(false);
            }
            let outputs = dependency_outputs(&tasks, task);
            let resolved = resolve_mapping(&task.input_mapping, &outputs)?;

            let Some(task) = tasks.get_mut(&task_uuid) else {
                return Ok(false);
            };
            task.resolved_input = Some(resolved);
            task.status = TaskStatus::Todo;
            task.updated_at = Utc::now();
            task.clone()
        };

        info!(task_uuid = %task_uuid, "Task promoted to todo");
        self.publish(&promoted).await;
        Ok(true)
    }

    /// Re-check every task depending on `done_uuid`. Returns the promoted ids.
    pub async fn promote_dependents(&self, done_uuid: Uuid) -> Vec<Uuid> {
        let dependents: Vec<Uuid> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.depends_on.contains(&done_uuid))
            .map(|t| t.task_uuid)
            .collect();

        let mut promoted = Vec::new();
        for id in dependents {
            match self.try_promote(id).await {
                Ok(true) => promoted.push(id),
                Ok(false) => {}
                Err(e) => warn!(task_uuid = %id, error = %e, "Promotion failed"),
            }
        }
        promoted
    }

    /// Apply a guarded update to one task and publish the result.
    async fn update<F>(&self, task_uuid: Uuid, apply: F) -> WeftResult<BoardTask>
    where
        F: FnOnce(&mut BoardTask) -> WeftResult<()>,
    {
        let updated = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&task_uuid)
                .ok_or_else(|| WeftError::NotFound(format!("task {task_uuid}")))?;
            let mut draft = task.clone();
            apply(&mut draft)?;
            draft.updated_at = Utc::now();
            *task = draft.clone();
            draft
        };
        self.publish(&updated).await;
        Ok(updated)
    }

    /// An agent takes a `todo` task.
    pub async fn claim(&self, task_uuid: Uuid, agent_id: &str) -> WeftResult<BoardTask> {
        let task = self
            .update(task_uuid, |task| {
                if task.status != TaskStatus::Todo {
                    return Err(WeftError::Conflict(format!(
                        "task {task_uuid} is {}, not todo",
                        task.status
                    )));
                }
                task.status = TaskStatus::InProgress;
                task.assigned_agent_id = Some(agent_id.to_string());
                Ok(())
            })
            .await?;
        info!(task_uuid = %task_uuid, agent_id = %agent_id, "Task claimed");
        Ok(task)
    }

    /// Claim the oldest `todo` task of a team the agent is capable of.
    pub async fn claim_next(
        &self,
        team_uuid: Uuid,
        agent_id: &str,
        capabilities: &BTreeSet<String>,
    ) -> WeftResult<Option<BoardTask>> {
        let candidates: Vec<Uuid> = self
            .list_team(team_uuid)
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Todo)
            .filter(|t| {
                t.required_capability
                    .as_ref()
                    .map_or(true, |cap| capabilities.contains(cap))
            })
            .map(|t| t.task_uuid)
            .collect();

        for id in candidates {
            match self.claim(id, agent_id).await {
                Ok(task) => return Ok(Some(task)),
                // Someone else claimed it in between.
                Err(WeftError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn check_owner(task: &BoardTask, agent_id: &str) -> WeftResult<()> {
        match &task.assigned_agent_id {
            Some(owner) if owner != agent_id => Err(WeftError::Forbidden(format!(
                "task {} is assigned to {owner}",
                task.task_uuid
            ))),
            _ => Ok(()),
        }
    }

    pub async fn submit_for_review(
        &self,
        task_uuid: Uuid,
        agent_id: &str,
        output: serde_json::Value,
    ) -> WeftResult<BoardTask> {
        self.update(task_uuid, |task| {
            if task.status != TaskStatus::InProgress {
                return Err(WeftError::Conflict(format!(
                    "task {task_uuid} is {}, not in_progress",
                    task.status
                )));
            }
            Self::check_owner(task, agent_id)?;
            task.status = TaskStatus::Review;
            task.output = Some(output);
            Ok(())
        })
        .await
    }

    /// Finish a task successfully. `output` replaces any output submitted
    /// for review.
    pub async fn complete(
        &self,
        task_uuid: Uuid,
        agent_id: &str,
        output: Option<serde_json::Value>,
    ) -> WeftResult<BoardTask> {
        let task = self
            .update(task_uuid, |task| {
                if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Review) {
                    return Err(WeftError::Conflict(format!(
                        "task {task_uuid} is {}, cannot complete",
                        task.status
                    )));
                }
                Self::check_owner(task, agent_id)?;
                task.status = TaskStatus::Done;
                task.outcome = Some(TaskOutcome::Succeeded);
                if output.is_some() {
                    task.output = output;
                }
                task.last_error = None;
                Ok(())
            })
            .await?;
        info!(task_uuid = %task_uuid, agent_id = %agent_id, "Task done");
        self.on_done(task_uuid).await;
        Ok(task)
    }

    /// Record a failed attempt. The task returns to `todo` while retries
    /// remain, otherwise it is dead-lettered.
    pub async fn fail(&self, task_uuid: Uuid, agent_id: &str, error: &str) -> WeftResult<BoardTask> {
        let task = self
            .update(task_uuid, |task| {
                if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Review) {
                    return Err(WeftError::Conflict(format!(
                        "task {task_uuid} is {}, cannot fail",
                        task.status
                    )));
                }
                Self::check_owner(task, agent_id)?;
                task.retry_count += 1;
                task.last_error = Some(error.to_string());
                if task.retry_count > task.max_retries.unwrap_or(0) {
                    task.status = TaskStatus::Done;
                    task.outcome = Some(TaskOutcome::DeadLetter);
                } else {
                    task.status = TaskStatus::Todo;
                    task.assigned_agent_id = None;
                    task.output = None;
                }
                Ok(())
            })
            .await?;

        if task.is_dead_letter() {
            warn!(
                task_uuid = %task_uuid,
                retry_count = task.retry_count,
                error = %error,
                "Task dead-lettered"
            );
        } else {
            info!(task_uuid = %task_uuid, retry_count = task.retry_count, "Task re-queued");
        }
        Ok(task)
    }

    /// Manual status edit. Dead-lettered tasks stay terminal and a task
    /// cannot leave `backlog` ahead of its dependencies.
    pub async fn update_status(&self, task_uuid: Uuid, status: TaskStatus) -> WeftResult<BoardTask> {
        let deps_done = {
            let tasks = self.tasks.read().await;
            let task = tasks
                .get(&task_uuid)
                .ok_or_else(|| WeftError::NotFound(format!("task {task_uuid}")))?;
            task.depends_on
                .iter()
                .all(|dep| tasks.get(dep).is_some_and(dependency_satisfied))
        };

        let task = self
            .update(task_uuid, |task| {
                if task.is_dead_letter() {
                    return Err(WeftError::Conflict(format!(
                        "task {task_uuid} is dead-lettered"
                    )));
                }
                if status != TaskStatus::Backlog && !deps_done {
                    return Err(WeftError::Conflict(format!(
                        "task {task_uuid} has unfinished dependencies"
                    )));
                }
                task.status = status;
                task.outcome = (status == TaskStatus::Done).then_some(TaskOutcome::Succeeded);
                if matches!(status, TaskStatus::Backlog | TaskStatus::Todo) {
                    task.assigned_agent_id = None;
                }
                Ok(())
            })
            .await?;
        if status == TaskStatus::Done {
            self.on_done(task_uuid).await;
        }
        Ok(task)
    }

    pub async fn task_context(&self, task_uuid: Uuid) -> WeftResult<TaskContext> {
        let tasks = self.tasks.read().await;
        let task = tasks
            .get(&task_uuid)
            .ok_or_else(|| WeftError::NotFound(format!("task {task_uuid}")))?;

        let dependencies = task
            .depends_on
            .iter()
            .filter_map(|id| tasks.get(id))
            .map(|dep| DependencyContext {
                task_uuid: dep.task_uuid,
                title: dep.title.clone(),
                status: dep.status,
                outcome: dep.outcome,
                output: dep.output.clone(),
            })
            .collect();
        let outputs = dependency_outputs(&tasks, task);
        let ready = task
            .depends_on
            .iter()
            .all(|dep| tasks.get(dep).is_some_and(dependency_satisfied));

        Ok(TaskContext {
            task_uuid,
            dependencies,
            resolved_input: resolve_mapping(&task.input_mapping, &outputs)?,
            ready,
        })
    }

    /// Agents currently holding a task, with how many tasks each holds.
    pub async fn assignments(&self) -> HashMap<AgentId, u32> {
        let mut load = HashMap::new();
        for task in self.tasks.read().await.values() {
            if task.status == TaskStatus::InProgress {
                if let Some(agent) = &task.assigned_agent_id {
                    *load.entry(agent.clone()).or_insert(0) += 1;
                }
            }
        }
        load
    }
}

impl Default for TaskBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn new_task(team: Uuid, title: &str) -> NewTask {
        NewTask {
            team_uuid: team,
            title: title.into(),
            ..NewTask::default()
        }
    }

    async fn finish(board: &TaskBoard, id: Uuid, output: serde_json::Value) {
        board.claim(id, "agent-1").await.unwrap();
        board.complete(id, "agent-1", Some(output)).await.unwrap();
    }

    #[tokio::test]
    async fn test_independent_task_starts_todo() {
        let board = TaskBoard::new();
        let task = board.create(new_task(Uuid::new_v4(), "index repo")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.resolved_input, Some(json!({})));
    }

    #[tokio::test]
    async fn test_dependent_promoted_with_resolved_input() {
        let board = TaskBoard::new();
        let team = Uuid::new_v4();
        let t1 = board.create(new_task(team, "research")).await.unwrap();
        let mut request = new_task(team, "write report");
        request.depends_on = vec![t1.task_uuid];
        request.input_mapping.insert(
            "findings".into(),
            json!(format!("{{{{{}.output.summary}}}}", t1.task_uuid)),
        );
        let t2 = board.create(request).await.unwrap();
        assert_eq!(t2.status, TaskStatus::Backlog);

        board.claim(t1.task_uuid, "agent-1").await.unwrap();
        assert_eq!(board.get(t2.task_uuid).await.unwrap().status, TaskStatus::Backlog);

        board
            .complete(t1.task_uuid, "agent-1", Some(json!({"summary": "all good"})))
            .await
            .unwrap();
        let t2 = board.get(t2.task_uuid).await.unwrap();
        assert_eq!(t2.status, TaskStatus::Todo);
        assert_eq!(t2.resolved_input, Some(json!({"findings": "all good"})));
    }

    #[tokio::test]
    async fn test_promotion_waits_for_all_dependencies() {
        let board = TaskBoard::new();
        let team = Uuid::new_v4();
        let a = board.create(new_task(team, "a")).await.unwrap();
        let b = board.create(new_task(team, "b")).await.unwrap();
        let mut request = new_task(team, "c");
        request.depends_on = vec![a.task_uuid, b.task_uuid];
        let c = board.create(request).await.unwrap();

        finish(&board, a.task_uuid, json!(1)).await;
        assert_eq!(board.get(c.task_uuid).await.unwrap().status, TaskStatus::Backlog);
        finish(&board, b.task_uuid, json!(2)).await;
        assert_eq!(board.get(c.task_uuid).await.unwrap().status, TaskStatus::Todo);

        // Re-running the check changes nothing.
        assert!(!board.try_promote(c.task_uuid).await.unwrap());
        assert!(board.promote_dependents(a.task_uuid).await.is_empty());
    }

    #[tokio::test]
    async fn test_background_promoter() {
        let board = Arc::new(TaskBoard::new());
        let _promoter = board.spawn_promoter();
        let team = Uuid::new_v4();
        let t1 = board.create(new_task(team, "t1")).await.unwrap();
        let mut request = new_task(team, "t2");
        request.depends_on = vec![t1.task_uuid];
        let t2 = board.create(request).await.unwrap();

        finish(&board, t1.task_uuid, json!({"ok": true})).await;

        let mut status = TaskStatus::Backlog;
        for _ in 0..100 {
            status = board.get(t2.task_uuid).await.unwrap().status;
            if status == TaskStatus::Todo {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_zero_retries_dead_letters_on_first_failure() {
        let board = TaskBoard::new();
        let task = board.create(new_task(Uuid::new_v4(), "flaky")).await.unwrap();
        board.claim(task.task_uuid, "agent-1").await.unwrap();
        let failed = board.fail(task.task_uuid, "agent-1", "crashed").await.unwrap();

        assert_eq!(failed.status, TaskStatus::Done);
        assert!(failed.is_dead_letter());
        assert_eq!(failed.retry_count, 1);
        assert!(board.claim(task.task_uuid, "agent-1").await.is_err());
        assert!(board.update_status(task.task_uuid, TaskStatus::Todo).await.is_err());
    }

    #[tokio::test]
    async fn test_retries_requeue_until_exhausted() {
        let board = TaskBoard::new();
        let mut request = new_task(Uuid::new_v4(), "flaky");
        request.max_retries = Some(2);
        let id = board.create(request).await.unwrap().task_uuid;

        for expected in 1..=2 {
            board.claim(id, "agent-1").await.unwrap();
            let task = board.fail(id, "agent-1", "timeout").await.unwrap();
            assert_eq!(task.status, TaskStatus::Todo);
            assert_eq!(task.retry_count, expected);
            assert!(task.assigned_agent_id.is_none());
        }
        board.claim(id, "agent-1").await.unwrap();
        let task = board.fail(id, "agent-1", "timeout").await.unwrap();
        assert!(task.is_dead_letter());
        assert_eq!(task.retry_count, 3);
    }

    #[tokio::test]
    async fn test_dead_lettered_dependency_blocks_promotion() {
        let board = TaskBoard::new();
        let team = Uuid::new_v4();
        let t1 = board.create(new_task(team, "t1")).await.unwrap();
        let mut request = new_task(team, "t2");
        request.depends_on = vec![t1.task_uuid];
        let t2 = board.create(request).await.unwrap();

        board.claim(t1.task_uuid, "agent-1").await.unwrap();
        board.fail(t1.task_uuid, "agent-1", "boom").await.unwrap();
        assert_eq!(board.get(t2.task_uuid).await.unwrap().status, TaskStatus::Backlog);
    }

    #[tokio::test]
    async fn test_claim_next_matches_capability() {
        let board = TaskBoard::new();
        let team = Uuid::new_v4();
        let mut audit = new_task(team, "audit");
        audit.required_capability = Some("security".into());
        board.create(audit).await.unwrap();
        let research = board.create(new_task(team, "research")).await.unwrap();

        let caps: BTreeSet<String> = ["research".to_string()].into_iter().collect();
        let claimed = board.claim_next(team, "agent-1", &caps).await.unwrap().unwrap();
        assert_eq!(claimed.task_uuid, research.task_uuid);
        assert!(board.claim_next(team, "agent-1", &caps).await.unwrap().is_none());
        assert_eq!(board.assignments().await["agent-1"], 1);
    }

    #[tokio::test]
    async fn test_only_assignee_may_finish() {
        let board = TaskBoard::new();
        let task = board.create(new_task(Uuid::new_v4(), "t")).await.unwrap();
        board.claim(task.task_uuid, "agent-1").await.unwrap();
        let err = board.complete(task.task_uuid, "agent-2", None).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn test_review_then_complete_keeps_output() {
        let board = TaskBoard::new();
        let task = board.create(new_task(Uuid::new_v4(), "t")).await.unwrap();
        board.claim(task.task_uuid, "agent-1").await.unwrap();
        let reviewed = board
            .submit_for_review(task.task_uuid, "agent-1", json!({"draft": 1}))
            .await
            .unwrap();
        assert_eq!(reviewed.status, TaskStatus::Review);
        let done = board.complete(task.task_uuid, "agent-1", None).await.unwrap();
        assert_eq!(done.output, Some(json!({"draft": 1})));
        assert_eq!(done.outcome, Some(TaskOutcome::Succeeded));
    }

    #[tokio::test]
    async fn test_mapping_must_reference_dependencies() {
        let board = TaskBoard::new();
        let mut request = new_task(Uuid::new_v4(), "t");
        request
            .input_mapping
            .insert("x".into(), json!(format!("{{{{{}.output}}}}", Uuid::new_v4())));
        assert_eq!(board.create(request).await.unwrap_err().kind(), "validation");

        let mut request = new_task(Uuid::new_v4(), "t");
        request.depends_on = vec![Uuid::new_v4()];
        assert_eq!(board.create(request).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_manual_status_respects_dependencies() {
        let board = TaskBoard::new();
        let team = Uuid::new_v4();
        let t1 = board.create(new_task(team, "t1")).await.unwrap();
        let mut request = new_task(team, "t2");
        request.depends_on = vec![t1.task_uuid];
        let t2 = board.create(request).await.unwrap();

        assert!(board.update_status(t2.task_uuid, TaskStatus::Todo).await.is_err());
        board.update_status(t1.task_uuid, TaskStatus::Done).await.unwrap();
        assert_eq!(board.get(t2.task_uuid).await.unwrap().status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_task_context() {
        let board = TaskBoard::new();
        let team = Uuid::new_v4();
        let t1 = board.create(new_task(team, "t1")).await.unwrap();
        let mut request = new_task(team, "t2");
        request.depends_on = vec![t1.task_uuid];
        request
            .input_mapping
            .insert("n".into(), json!(format!("{{{{{}.output.n}}}}", t1.task_uuid)));
        let t2 = board.create(request).await.unwrap();

        let ctx = board.task_context(t2.task_uuid).await.unwrap();
        assert!(!ctx.ready);
        assert_eq!(ctx.resolved_input, json!({"n": null}));

        finish(&board, t1.task_uuid, json!({"n": 7})).await;
        let ctx = board.task_context(t2.task_uuid).await.unwrap();
        assert!(ctx.ready);
        assert_eq!(ctx.dependencies.len(), 1);
        assert_eq!(ctx.resolved_input, json!({"n": 7}));
    }

    #[tokio::test]
    async fn test_status_changes_published_on_team_channel() {
        let bus = Arc::new(EventBus::new());
        let board = TaskBoard::new().with_events(bus.clone());
        let team = Uuid::new_v4();
        let mut sub = bus.subscribe(team_channel(team)).await;
        let task = board.create(new_task(team, "t")).await.unwrap();
        match sub.rx.recv().await.unwrap() {
            OrchestrationEvent::TaskStatusChanged { task_uuid, status, .. } => {
                assert_eq!(task_uuid, task.task_uuid);
                assert_eq!(status, TaskStatus::Todo);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
