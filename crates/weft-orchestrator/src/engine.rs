use crate::audit::ExecutionLog;
use crate::client::AgentTransport;
use crate::collaborators::{BudgetGuard, ResultCache};
use crate::config::OrchestratorConfig;
use crate::dispatch::{CancelFlag, DispatchJob, DispatchOutcome, Dispatcher};
use crate::events::EventBus;
use crate::monitor::AgentMonitor;
use crate::registry::CapabilityRegistry;
use crate::resolver::{references, Syntax, TemplateRef};
use crate::scheduler::{plan_levels, ExecutionPlan};
use crate::store::RunStore;
use crate::types::{
    ExecutionLogEntry, RunProgress, RunStatus, StageDefinition, StageExecution, StageStatus,
    WorkflowDefinition, WorkflowRun,
};
use crate::workers::WorkerPool;
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;
use weft_core::{WeftError, WeftResult};

/// Run record plus every stage execution, as returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: WorkflowRun,
    pub stages: Vec<StageExecution>,
}

struct RunHandle {
    cancel: CancelFlag,
    done: watch::Receiver<RunStatus>,
}

/// Assembles an [`Orchestrator`] from its collaborators.
pub struct OrchestratorBuilder {
    registry: Arc<dyn CapabilityRegistry>,
    transport: Arc<dyn AgentTransport>,
    config: OrchestratorConfig,
    journal_dir: Option<PathBuf>,
    events: Option<Arc<EventBus>>,
    monitor: Option<Arc<AgentMonitor>>,
    budget: Option<Arc<dyn BudgetGuard>>,
    cache: Option<Arc<dyn ResultCache>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist the execution log under `dir/executions.jsonl`.
    pub fn journal_dir(mut self, dir: PathBuf) -> Self {
        self.journal_dir = Some(dir);
        self
    }

    /// Share an event bus with other façades (e.g. the task board).
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn monitor(mut self, monitor: Arc<AgentMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn budget(mut self, budget: Arc<dyn BudgetGuard>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Spawns the worker pool, so it must be called inside a Tokio runtime.
    pub fn build(self) -> Orchestrator {
        let events = self.events.unwrap_or_default();
        let monitor = self.monitor.unwrap_or_default();
        let log = match self.journal_dir {
            Some(dir) => ExecutionLog::with_journal(dir),
            None => ExecutionLog::new(),
        };
        let log = Arc::new(log.with_events(events.clone()));
        let store = Arc::new(RunStore::new().with_events(events.clone()));

        let mut dispatcher = Dispatcher::new(
            self.registry,
            self.transport,
            monitor.clone(),
            log.clone(),
            store.clone(),
            self.config.dispatch_config(),
        );
        if let Some(budget) = self.budget {
            dispatcher = dispatcher.with_budget(budget);
        }
        if let Some(cache) = self.cache {
            dispatcher = dispatcher.with_cache(cache);
        }
        let pool = Arc::new(WorkerPool::spawn(self.config.workers, Arc::new(dispatcher)));
        info!(workers = pool.size(), "Orchestrator started");

        Orchestrator {
            store,
            log,
            events,
            monitor,
            pool,
            handles: RwLock::new(HashMap::new()),
        }
    }
}

/// Façade over the scheduler and dispatcher: submit workflows, watch them,
/// cancel them, read their audit trail.
pub struct Orchestrator {
    store: Arc<RunStore>,
    log: Arc<ExecutionLog>,
    events: Arc<EventBus>,
    monitor: Arc<AgentMonitor>,
    pool: Arc<WorkerPool>,
    handles: RwLock<HashMap<Uuid, RunHandle>>,
}

impl Orchestrator {
    pub fn builder(
        registry: Arc<dyn CapabilityRegistry>,
        transport: Arc<dyn AgentTransport>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            transport,
            config: OrchestratorConfig::default(),
            journal_dir: None,
            events: None,
            monitor: None,
            budget: None,
            cache: None,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    pub fn execution_log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    /// Validate, plan and start a workflow. Returns the new run id.
    ///
    /// Invalid graphs and template references are rejected here; no run or
    /// stage execution exists afterwards.
    pub async fn submit(
        &self,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> WeftResult<Uuid> {
        let plan = plan_levels(&definition.stages)?;
        validate_templates(&definition.stages, &plan)?;

        let run = WorkflowRun {
            id: Uuid::new_v4(),
            name: definition.name,
            progress: RunProgress {
                total: plan.stage_count(),
                total_levels: plan.level_count(),
                ..RunProgress::default()
            },
            stages: definition.stages,
            input,
            levels: plan.into_levels(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        let run_id = run.id;
        info!(
            run_id = %run_id,
            name = %run.name,
            stages = run.progress.total,
            levels = run.progress.total_levels,
            "Workflow submitted"
        );
        self.store.insert(run).await;

        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(RunStatus::Queued);
        self.handles.write().await.insert(
            run_id,
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let store = self.store.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let status = drive_run(&store, &pool, run_id, &cancel).await;
            let _ = done_tx.send(status);
        });

        Ok(run_id)
    }

    /// Wait until a run reaches a terminal status.
    pub async fn wait(&self, run_id: Uuid) -> WeftResult<WorkflowRun> {
        let mut done = self
            .handles
            .read()
            .await
            .get(&run_id)
            .map(|h| h.done.clone())
            .ok_or_else(|| WeftError::NotFound(format!("run {run_id}")))?;
        done.wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| WeftError::Orchestrator(format!("driver of run {run_id} stopped")))?;
        self.store
            .run(run_id)
            .await
            .ok_or_else(|| WeftError::NotFound(format!("run {run_id}")))
    }

    /// Submit and wait in one call.
    pub async fn run_to_completion(
        &self,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> WeftResult<WorkflowRun> {
        let run_id = self.submit(definition, input).await?;
        self.wait(run_id).await
    }

    pub async fn status(&self, run_id: Uuid) -> WeftResult<RunSnapshot> {
        let run = self
            .store
            .run(run_id)
            .await
            .ok_or_else(|| WeftError::NotFound(format!("run {run_id}")))?;
        let stages = self.store.stages(run_id).await;
        Ok(RunSnapshot { run, stages })
    }

    pub async fn list_runs(&self) -> Vec<WorkflowRun> {
        self.store.list().await
    }

    /// Every audit entry of a run, whatever its status.
    pub async fn audit_log(&self, run_id: Uuid) -> WeftResult<Vec<ExecutionLogEntry>> {
        if !self.store.contains(run_id).await {
            return Err(WeftError::NotFound(format!("run {run_id}")));
        }
        Ok(self.log.for_run(run_id).await)
    }

    /// Request cancellation. In-flight calls finish; nothing further is
    /// scheduled. Returns the status at the time of the request.
    pub async fn cancel(&self, run_id: Uuid) -> WeftResult<RunStatus> {
        let run = self
            .store
            .run(run_id)
            .await
            .ok_or_else(|| WeftError::NotFound(format!("run {run_id}")))?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }
        if let Some(handle) = self.handles.read().await.get(&run_id) {
            handle.cancel.store(true, Ordering::SeqCst);
        }
        info!(run_id = %run_id, "Cancellation requested");
        Ok(run.status)
    }
}

/// Stage-output references must name a stage in a strictly earlier level;
/// only those are guaranteed `completed` when the referencing stage starts.
fn validate_templates(stages: &[StageDefinition], plan: &ExecutionPlan) -> WeftResult<()> {
    for stage in stages {
        if let Ok(task_refs) = references(&stage.input, Syntax::Task) {
            if !task_refs.is_empty() {
                return Err(WeftError::Resolution(format!(
                    "stage '{}' uses a task reference",
                    stage.id
                )));
            }
        }

        let Some(level) = plan.level_of(&stage.id) else {
            continue;
        };
        for reference in references(&stage.input, Syntax::Stage)? {
            let TemplateRef::StageOutput { stage_id, .. } = reference else {
                continue;
            };
            match plan.level_of(&stage_id) {
                Some(upstream) if upstream < level => {}
                Some(_) => {
                    return Err(WeftError::Resolution(format!(
                        "stage '{}' references '{stage_id}', which does not finish before it starts",
                        stage.id
                    )));
                }
                None => {
                    return Err(WeftError::Resolution(format!(
                        "stage '{}' references unknown stage '{stage_id}'",
                        stage.id
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Advance a run level by level until it is terminal. Returns the final status.
async fn drive_run(store: &RunStore, pool: &WorkerPool, run_id: Uuid, cancel: &CancelFlag) -> RunStatus {
    let Some(run) = store.run(run_id).await else {
        return RunStatus::Failed;
    };

    let by_id: HashMap<&str, &StageDefinition> =
        run.stages.iter().map(|s| (s.id.as_str(), s)).collect();

    for (index, level) in run.levels.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            return finish(store, run_id, RunStatus::Cancelled, None).await;
        }
        store.set_current_level(run_id, index).await;
        if index == 0 {
            if let Err(e) = store.transition_run(run_id, RunStatus::InProgress, None).await {
                error!(run_id = %run_id, error = %e, "Cannot start run");
                return RunStatus::Failed;
            }
        }
        info!(run_id = %run_id, level = index, stages = level.len(), "Dispatching level");

        let mut pending = Vec::with_capacity(level.len());
        for stage_id in level {
            let Some(stage) = by_id.get(stage_id.as_str()) else {
                continue;
            };
            if let Err(e) = store
                .transition_stage(run_id, stage_id, StageStatus::Ready, |_| {})
                .await
            {
                warn!(run_id = %run_id, stage_id = %stage_id, error = %e, "Stage not ready");
                continue;
            }
            let job = DispatchJob {
                run_id,
                stage: (*stage).clone(),
                workflow_input: run.input.clone(),
                cancel: cancel.clone(),
            };
            match pool.submit(job) {
                Ok(rx) => pending.push((stage_id.clone(), rx)),
                Err(e) => {
                    return finish(store, run_id, RunStatus::Failed, Some(e.to_string())).await;
                }
            }
        }

        let (ids, receivers): (Vec<String>, Vec<_>) = pending.into_iter().unzip();
        let outcomes = join_all(receivers).await;

        let mut failure: Option<String> = None;
        let mut cancelled = false;
        for (stage_id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                Ok(DispatchOutcome::Completed { .. }) => {}
                Ok(DispatchOutcome::Failed { error }) => {
                    failure.get_or_insert_with(|| format!("stage '{stage_id}' failed: {error}"));
                }
                Ok(DispatchOutcome::Cancelled) => cancelled = true,
                Err(_) => {
                    failure.get_or_insert_with(|| format!("worker dropped stage '{stage_id}'"));
                }
            }
        }

        if let Some(message) = failure {
            return finish(store, run_id, RunStatus::Failed, Some(message)).await;
        }
        if cancelled {
            return finish(store, run_id, RunStatus::Cancelled, None).await;
        }
    }

    finish(store, run_id, RunStatus::Completed, None).await
}

async fn finish(store: &RunStore, run_id: Uuid, status: RunStatus, message: Option<String>) -> RunStatus {
    match store.transition_run(run_id, status, message).await {
        Ok(true) => status,
        Ok(false) | Err(_) => store.run(run_id).await.map_or(status, |r| r.status),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::client::{DispatchFailure, ExecuteRequest, HealthReport};
    use crate::registry::{AgentRecord, InMemoryRegistry};
    use crate::types::{AuditAction, RetryConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Echoes the resolved input back as output, failing for stages named `boom`.
    #[derive(Default)]
    struct EchoTransport {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentTransport for EchoTransport {
        async fn execute(
            &self,
            _agent: &AgentRecord,
            request: &ExecuteRequest,
            _timeout: Duration,
        ) -> Result<serde_json::Value, DispatchFailure> {
            self.calls.lock().unwrap().push(request.stage_id.clone());
            if request.stage_id == "boom" {
                return Err(DispatchFailure::Permanent("boom".into()));
            }
            Ok(json!({ "echo": request.input }))
        }

        async fn health(&self, _agent: &AgentRecord, _timeout: Duration) -> WeftResult<HealthReport> {
            Ok(HealthReport {
                status: "healthy".into(),
                timestamp: None,
            })
        }
    }

    fn orchestrator(transport: Arc<EchoTransport>) -> Orchestrator {
        let registry = InMemoryRegistry::with_agents(vec![AgentRecord::new("a1", "http://a1.local")
            .with_capabilities(["work"])
            .with_max_concurrent(4)]);
        Orchestrator::builder(Arc::new(registry), transport)
            .config(OrchestratorConfig {
                workers: 2,
                poll_interval_ms: 5,
                ..OrchestratorConfig::default()
            })
            .build()
    }

    fn no_retry(stage: StageDefinition) -> StageDefinition {
        stage.with_retry(RetryConfig {
            max_retries: 0,
            backoff_ms: 1,
            timeout_ms: 1_000,
        })
    }

    #[tokio::test]
    async fn test_outputs_flow_downstream() {
        let transport = Arc::new(EchoTransport::default());
        let orch = orchestrator(transport.clone());
        let def = WorkflowDefinition::new(
            "chain",
            vec![
                StageDefinition::new("first", "work").with_input(json!({"q": "${workflow.input.q}"})),
                StageDefinition::new("second", "work")
                    .with_dependencies(["first"])
                    .with_input(json!("${first.output.echo.q}")),
            ],
        );

        let run = orch.run_to_completion(def, json!({"q": 42})).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.progress.completed, 2);

        let snapshot = orch.status(run.id).await.unwrap();
        let second = snapshot.stages.iter().find(|s| s.stage_id == "second").unwrap();
        assert_eq!(second.resolved_input, Some(json!(42)));
        assert_eq!(*transport.calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_cycle_rejected_without_run() {
        let orch = orchestrator(Arc::new(EchoTransport::default()));
        let def = WorkflowDefinition::new(
            "loop",
            vec![
                StageDefinition::new("a", "work").with_dependencies(["b"]),
                StageDefinition::new("b", "work").with_dependencies(["a"]),
            ],
        );
        let err = orch.submit(def, json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(orch.list_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_reference_to_non_upstream_stage_rejected() {
        let orch = orchestrator(Arc::new(EchoTransport::default()));
        let def = WorkflowDefinition::new(
            "bad",
            vec![
                StageDefinition::new("a", "work"),
                StageDefinition::new("b", "work").with_input(json!("${a.output.x}")),
            ],
        );
        let err = orch.submit(def, json!({})).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(orch.list_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_stops_later_levels() {
        let transport = Arc::new(EchoTransport::default());
        let orch = orchestrator(transport.clone());
        let def = WorkflowDefinition::new(
            "fails",
            vec![
                no_retry(StageDefinition::new("boom", "work")),
                no_retry(StageDefinition::new("sibling", "work")),
                no_retry(StageDefinition::new("after", "work").with_dependencies(["boom"])),
            ],
        );

        let run = orch.run_to_completion(def, json!({})).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("boom"));

        let snapshot = orch.status(run.id).await.unwrap();
        let by_id: HashMap<_, _> = snapshot.stages.iter().map(|s| (s.stage_id.as_str(), s)).collect();
        assert_eq!(by_id["sibling"].status, StageStatus::Completed);
        assert!(by_id["sibling"].output.is_some());
        assert_eq!(by_id["after"].status, StageStatus::Pending);
        assert!(!transport.calls.lock().unwrap().contains(&"after".to_string()));

        let audit = orch.audit_log(run.id).await.unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::Fail));
    }

    #[tokio::test]
    async fn test_unknown_run_queries() {
        let orch = orchestrator(Arc::new(EchoTransport::default()));
        let id = Uuid::new_v4();
        assert_eq!(orch.status(id).await.unwrap_err().kind(), "not_found");
        assert_eq!(orch.audit_log(id).await.unwrap_err().kind(), "not_found");
        assert_eq!(orch.cancel(id).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_cancel_terminal_run_is_noop() {
        let orch = orchestrator(Arc::new(EchoTransport::default()));
        let run = orch
            .run_to_completion(
                WorkflowDefinition::new("one", vec![StageDefinition::new("s", "work")]),
                json!({}),
            )
            .await
            .unwrap();
        assert_eq!(orch.cancel(run.id).await.unwrap(), RunStatus::Completed);
        assert_eq!(orch.status(run.id).await.unwrap().run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_reference_to_earlier_level_without_dependency() {
        let orch = orchestrator(Arc::new(EchoTransport::default()));
        let def = WorkflowDefinition::new(
            "skip-level",
            vec![
                StageDefinition::new("a", "work").with_input(json!({ "v": 7 })),
                StageDefinition::new("b", "work").with_dependencies(["a"]),
                StageDefinition::new("c", "work")
                    .with_dependencies(["b"])
                    .with_input(json!("${a.output.echo.v}")),
                StageDefinition::new("d", "work").with_input(json!("${a.output}")),
            ],
        );
        // `d` shares level 0 with `a`.
        assert!(orch.submit(def.clone(), json!({})).await.is_err());

        let mut valid = def;
        valid.stages.pop();
        let run = orch.run_to_completion(valid, json!({})).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let snapshot = orch.status(run.id).await.unwrap();
        let c = snapshot.stages.iter().find(|s| s.stage_id == "c").unwrap();
        assert_eq!(c.resolved_input, Some(json!(7)));
    }

    #[test]
    fn test_template_validation_by_level() {
        let stages = vec![
            StageDefinition::new("a", "w"),
            StageDefinition::new("b", "w").with_dependencies(["a"]),
            StageDefinition::new("c", "w").with_dependencies(["b"]),
        ];
        let check = |input: serde_json::Value, at: usize| {
            let mut stages = stages.clone();
            stages[at] = stages[at].clone().with_input(input);
            let plan = plan_levels(&stages).unwrap();
            validate_templates(&stages, &plan)
        };
        assert!(check(json!("${a.output}"), 2).is_ok());
        assert!(check(json!("${c.output}"), 1).is_err());
        assert!(check(json!("${ghost.output}"), 2).is_err());
        let task_ref = format!("{{{{{}.output.x}}}}", Uuid::new_v4());
        assert!(check(json!(task_ref), 2).is_err());
        // Braces that are not a task reference are plain text.
        assert!(check(json!("{{name}}"), 2).is_ok());
    }
}
