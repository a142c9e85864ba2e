use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier of a stage, unique within one workflow.
pub type StageId = String;

/// Identifier of a remote agent as known to the capability registry.
pub type AgentId = String;

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    1_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Per-stage retry policy. Backoff is fixed, not exponential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Additional attempts on the same agent after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Deadline for a single network call in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// One node of a workflow's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub id: StageId,
    /// Capability tag an agent must advertise to run this stage.
    #[serde(default)]
    pub agent_capability: String,
    #[serde(default)]
    pub dependencies: Vec<StageId>,
    /// Input template; `${...}` placeholders are resolved before dispatch.
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, rename = "retryConfig")]
    pub retry: RetryConfig,
    /// Estimated cost reported to the budget collaborator.
    #[serde(default)]
    pub estimated_cost_cents: u64,
}

impl StageDefinition {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_capability: capability.into(),
            dependencies: Vec::new(),
            input: serde_json::Value::Null,
            retry: RetryConfig::default(),
            estimated_cost_cents: 0,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// A workflow as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }
}

/// Lifecycle of a workflow run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the run may move from `self` to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            RunStatus::Queued => next != RunStatus::Queued,
            RunStatus::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "queued"),
            RunStatus::InProgress => write!(f, "in_progress"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of a single stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Ready,
    Dispatched,
    Retrying,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }

    /// Status guard for stage updates; terminal states never change.
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        match (self, next) {
            (Pending, Ready) => true,
            (Ready, Dispatched) | (Ready, Completed) | (Ready, Failed) => true,
            (Dispatched, Retrying) | (Dispatched, Dispatched) => true,
            (Dispatched, Completed) | (Dispatched, Failed) => true,
            (Retrying, Dispatched) | (Retrying, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Ready => "ready",
            StageStatus::Dispatched => "dispatched",
            StageStatus::Retrying => "retrying",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Execution record of one stage inside one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage_id: StageId,
    pub run_id: Uuid,
    pub status: StageStatus,
    /// Total number of network calls made for this stage, across agents.
    pub attempts: u32,
    pub assigned_agent_id: Option<AgentId>,
    pub resolved_input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageExecution {
    pub fn new(run_id: Uuid, stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            run_id,
            status: StageStatus::Pending,
            attempts: 0,
            assigned_agent_id: None,
            resolved_input: None,
            output: None,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Progress counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub current_level: usize,
    pub total_levels: usize,
}

/// A submitted workflow and its run-level state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub name: String,
    pub stages: Vec<StageDefinition>,
    pub input: serde_json::Value,
    pub levels: Vec<Vec<StageId>>,
    pub status: RunStatus,
    pub progress: RunProgress,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// What happened in one audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Execute,
    Retry,
    Fallback,
    Complete,
    Fail,
    /// Output served by the result cache without calling an agent.
    Cached,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditAction::Execute => "execute",
            AuditAction::Retry => "retry",
            AuditAction::Fallback => "fallback",
            AuditAction::Complete => "complete",
            AuditAction::Fail => "fail",
            AuditAction::Cached => "cached",
        };
        write!(f, "{s}")
    }
}

/// One append-only audit record of the dispatch subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub stage_id: StageId,
    pub agent_id: Option<AgentId>,
    pub action: AuditAction,
    /// Attempt number on the current agent (1-based); 0 for non-call entries.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Kanban column of a board task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Todo,
    InProgress,
    Review,
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// How a `done` task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    /// Retries exhausted; the task is terminal and never re-queued.
    DeadLetter,
}

/// A kanban task; may form dependency chains outside any workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardTask {
    pub task_uuid: Uuid,
    pub team_uuid: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
    pub required_capability: Option<String>,
    pub assigned_agent_id: Option<AgentId>,
    pub depends_on: Vec<Uuid>,
    /// Input templates using `{{<taskUuid>.output.<path>}}` placeholders.
    pub input_mapping: BTreeMap<String, serde_json::Value>,
    pub resolved_input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub retry_count: u32,
    /// `None` behaves as zero retries.
    pub max_retries: Option<u32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BoardTask {
    pub fn is_dead_letter(&self) -> bool {
        self.outcome == Some(TaskOutcome::DeadLetter)
    }
}
