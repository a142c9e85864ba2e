//! Workflow and task orchestration engine.
//!
//! Routes units of work to capability-tagged remote agents and drives them to
//! completion: workflows are planned into dependency levels, each ready stage
//! is dispatched by a fixed worker pool with retry, backoff and fallback to
//! other agents, and upstream outputs flow into downstream inputs through
//! template substitution. A kanban [`TaskBoard`] reuses the same resolver, and
//! a [`LockManager`] hands out conflict-detecting resource locks.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Submit, watch, cancel and audit workflow runs.
//! - [`Dispatcher`] — Agent selection and the retry/fallback ladder for one stage.
//! - [`plan_levels`] — Kahn-style planning of a stage graph into levels.
//! - [`TaskBoard`] — Kanban tasks with dependency promotion and dead-lettering.
//! - [`LockManager`] — Exclusive, versioned locks on external resources.
//! - [`EventBus`] — Run and team event channels.

/// Execution log of dispatch decisions with optional JSONL journal.
pub mod audit;
/// Kanban task board.
pub mod board;
/// Agent wire contract and HTTP transport.
pub mod client;
/// Budget and result-cache contracts.
pub mod collaborators;
/// `[orchestrator]` configuration.
pub mod config;
/// Retry, backoff and fallback dispatch of a single stage.
pub mod dispatch;
/// Orchestration façade.
pub mod engine;
/// Publish/subscribe event channels.
pub mod events;
/// Resource lock manager.
pub mod locks;
/// Per-agent dispatch metrics.
pub mod monitor;
/// Capability registry and agent scoring.
pub mod registry;
/// Template resolution.
pub mod resolver;
/// Dependency-level planning.
pub mod scheduler;
/// Run and stage state.
pub mod store;
/// Shared orchestration types.
pub mod types;
/// Fixed-size dispatch worker pool.
pub mod workers;

pub use audit::ExecutionLog;
pub use board::{NewTask, TaskBoard, TaskContext};
pub use client::{AgentTransport, DispatchFailure, ExecuteRequest, HttpAgentTransport};
pub use collaborators::{BudgetAction, BudgetDecision, BudgetGuard, InMemoryResultCache, ResultCache};
pub use config::OrchestratorConfig;
pub use dispatch::{CancelFlag, DispatchConfig, DispatchJob, DispatchOutcome, Dispatcher};
pub use engine::{Orchestrator, OrchestratorBuilder, RunSnapshot};
pub use events::{run_channel, team_channel, EventBus, OrchestrationEvent, Subscription};
pub use locks::{content_hash, LockError, LockManager, LockRequest, ResourceLock};
pub use monitor::{AgentMonitor, AgentStats};
pub use registry::{AgentRecord, AgentStatus, CapabilityRegistry, InMemoryRegistry, ScoringPolicy};
pub use resolver::{resolve, resolve_task, StageContext};
pub use scheduler::{plan_levels, ExecutionPlan};
pub use store::RunStore;
pub use types::{
    AuditAction, BoardTask, ExecutionLogEntry, RetryConfig, RunStatus, StageDefinition,
    StageExecution, StageStatus, TaskOutcome, TaskStatus, WorkflowDefinition, WorkflowRun,
};
pub use workers::WorkerPool;
