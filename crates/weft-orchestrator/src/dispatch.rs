use crate::audit::ExecutionLog;
use crate::client::{AgentTransport, ExecuteRequest};
use crate::collaborators::{BudgetAction, BudgetGuard, ResultCache};
use crate::monitor::AgentMonitor;
use crate::registry::{select_agent, AgentRecord, CandidateSignals, CapabilityRegistry, ScoringPolicy};
use crate::resolver::{resolve, StageContext};
use crate::store::RunStore;
use crate::types::{AgentId, AuditAction, StageDefinition, StageStatus};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use weft_core::WeftResult;

/// Injectable sleep used by tests to skip real delays.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Per-run cancellation flag shared by the engine and every dispatch of the run.
pub type CancelFlag = Arc<AtomicBool>;

/// Tunables of the dispatch subsystem.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Re-evaluation interval while no agent is eligible or the budget pauses.
    pub poll_interval: Duration,
    /// TTL of outputs written to the result cache.
    pub cache_ttl: Duration,
    pub scoring: ScoringPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(300),
            scoring: ScoringPolicy::default(),
        }
    }
}

/// One ready stage handed to a worker.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub run_id: Uuid,
    pub stage: StageDefinition,
    pub workflow_input: serde_json::Value,
    pub cancel: CancelFlag,
}

impl DispatchJob {
    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed {
        /// `None` when the output came from the result cache.
        agent_id: Option<AgentId>,
        output: serde_json::Value,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

enum LadderOutcome {
    Success { output: serde_json::Value, attempt: u32 },
    Exhausted(String),
    Cancelled,
    Rejected(String),
}

/// Sends ready stages to capable agents with retry, backoff and fallback.
pub struct Dispatcher {
    registry: Arc<dyn CapabilityRegistry>,
    transport: Arc<dyn AgentTransport>,
    monitor: Arc<AgentMonitor>,
    log: Arc<ExecutionLog>,
    store: Arc<RunStore>,
    budget: Option<Arc<dyn BudgetGuard>>,
    cache: Option<Arc<dyn ResultCache>>,
    config: DispatchConfig,
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        transport: Arc<dyn AgentTransport>,
        monitor: Arc<AgentMonitor>,
        log: Arc<ExecutionLog>,
        store: Arc<RunStore>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            monitor,
            log,
            store,
            budget: None,
            cache: None,
            config,
            #[cfg(test)]
            sleep_fn: None,
        }
    }

    pub fn with_budget(mut self, budget: Arc<dyn BudgetGuard>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Sleep `ms`, waking every poll interval to honor cancellation.
    /// Returns `false` if the job was cancelled.
    async fn sleep_unless_cancelled(&self, job: &DispatchJob, ms: u64) -> bool {
        let slice = (self.config.poll_interval.as_millis() as u64).max(1);
        let mut remaining = ms;
        while remaining > 0 {
            if job.is_cancelled() {
                return false;
            }
            let step = remaining.min(slice);
            self.do_sleep(step).await;
            remaining -= step;
        }
        !job.is_cancelled()
    }

    async fn poll_wait(&self, job: &DispatchJob) -> bool {
        let ms = self.config.poll_interval.as_millis() as u64;
        self.sleep_unless_cancelled(job, ms).await
    }

    /// Run one stage to a terminal outcome. The stage must be `ready`.
    pub async fn dispatch(&self, job: DispatchJob) -> DispatchOutcome {
        let run_id = job.run_id;
        let stage_id = job.stage.id.as_str();
        if job.is_cancelled() {
            return DispatchOutcome::Cancelled;
        }

        let outputs = self.store.completed_outputs(run_id).await;
        let ctx = StageContext::new(&job.workflow_input, &outputs);
        let input = match resolve(&job.stage.input, &ctx) {
            Ok(v) => v,
            Err(e) => return self.fail_stage(run_id, stage_id, None, 0, e.to_string()).await,
        };
        let recorded = input.clone();
        if let Err(e) = self
            .store
            .update_stage(run_id, stage_id, |exec| exec.resolved_input = Some(recorded))
            .await
        {
            return DispatchOutcome::Failed {
                error: e.to_string(),
            };
        }

        if let Some(cache) = &self.cache {
            if let Some(output) = cache.lookup(&job.stage.agent_capability, &input).await {
                return self.complete_from_cache(&job, output).await;
            }
        }

        if let Some(outcome) = self.await_budget(&job).await {
            return outcome;
        }

        let mut excluded: HashSet<AgentId> = HashSet::new();
        let mut last_error: Option<String> = None;

        loop {
            if job.is_cancelled() {
                return self.cancel_stage(run_id, stage_id).await;
            }

            let candidates = match self.rank_candidates(&job.stage.agent_capability).await {
                Ok(c) => c,
                Err(e) => return self.fail_stage(run_id, stage_id, None, 0, e.to_string()).await,
            };
            let remaining = candidates
                .iter()
                .filter(|(a, _)| !excluded.contains(&a.id))
                .count();

            if remaining == 0 && !excluded.is_empty() {
                let reason = format!(
                    "all capable agents exhausted for '{}': {}",
                    job.stage.agent_capability,
                    last_error.as_deref().unwrap_or("no agent succeeded")
                );
                return self.fail_stage(run_id, stage_id, None, 0, reason).await;
            }

            let Some(agent) = select_agent(&candidates, &excluded, &self.config.scoring).cloned()
            else {
                debug!(
                    run_id = %run_id,
                    stage_id = %stage_id,
                    capability = %job.stage.agent_capability,
                    "No eligible agent, waiting"
                );
                if !self.poll_wait(&job).await {
                    return self.cancel_stage(run_id, stage_id).await;
                }
                continue;
            };

            let fallback = !excluded.is_empty();
            match self.run_ladder(&job, &input, &agent, fallback).await {
                LadderOutcome::Success { output, attempt } => {
                    return self
                        .complete_stage(&job, &input, &agent.id, attempt, output)
                        .await;
                }
                LadderOutcome::Exhausted(err) => {
                    warn!(
                        run_id = %run_id,
                        stage_id = %stage_id,
                        agent_id = %agent.id,
                        error = %err,
                        "Agent exhausted, falling back"
                    );
                    excluded.insert(agent.id.clone());
                    last_error = Some(err);
                }
                LadderOutcome::Cancelled => return self.cancel_stage(run_id, stage_id).await,
                LadderOutcome::Rejected(err) => {
                    warn!(run_id = %run_id, stage_id = %stage_id, error = %err, "Stage update rejected");
                    return DispatchOutcome::Failed { error: err };
                }
            }
        }
    }

    async fn rank_candidates(
        &self,
        capability: &str,
    ) -> WeftResult<Vec<(AgentRecord, CandidateSignals)>> {
        let agents = self.registry.find_capable_online_agents(capability).await?;
        let mut ranked = Vec::with_capacity(agents.len());
        for agent in agents {
            let load = self.registry.load_of(&agent.id).await;
            let stats = self.monitor.get_stats(&agent.id).await;
            let signals = CandidateSignals::from_stats(load, stats.as_ref());
            ranked.push((agent, signals));
        }
        Ok(ranked)
    }

    /// Consult the budget collaborator. `Some` carries a terminal outcome.
    async fn await_budget(&self, job: &DispatchJob) -> Option<DispatchOutcome> {
        let budget = self.budget.as_ref()?;
        let scope = job.run_id.to_string();
        loop {
            if job.is_cancelled() {
                return Some(DispatchOutcome::Cancelled);
            }
            let decision = budget
                .check_budget(&scope, job.stage.estimated_cost_cents)
                .await;
            if decision.allowed {
                return None;
            }
            match decision.action {
                Some(BudgetAction::Pause) => {
                    debug!(run_id = %job.run_id, stage_id = %job.stage.id, "Budget paused dispatch");
                    if !self.poll_wait(job).await {
                        return Some(DispatchOutcome::Cancelled);
                    }
                }
                Some(BudgetAction::Kill) | None => {
                    let reason = format!(
                        "budget refused {} cents for stage {}",
                        job.stage.estimated_cost_cents, job.stage.id
                    );
                    return Some(
                        self.fail_stage(job.run_id, &job.stage.id, None, 0, reason)
                            .await,
                    );
                }
            }
        }
    }

    /// Attempts against one agent: the first call plus `max_retries` retries.
    async fn run_ladder(
        &self,
        job: &DispatchJob,
        input: &serde_json::Value,
        agent: &AgentRecord,
        fallback: bool,
    ) -> LadderOutcome {
        let run_id = job.run_id;
        let stage_id = job.stage.id.as_str();
        let retry = job.stage.retry;
        let timeout = Duration::from_millis(retry.timeout_ms);
        let mut last_error = String::from("no attempt made");

        for attempt in 0..=retry.max_retries {
            let number = attempt + 1;
            if attempt > 0 && job.is_cancelled() {
                return LadderOutcome::Cancelled;
            }

            // The ceiling is re-checked per call; another stage may have taken
            // the slot since selection or during backoff. Registry load is
            // re-read on every poll so a freed slot is seen.
            loop {
                let external = self.registry.load_of(&agent.id).await;
                if self
                    .monitor
                    .try_start_dispatch(&agent.id, external, agent.max_concurrent_tasks)
                    .await
                {
                    break;
                }
                if !self.poll_wait(job).await {
                    return LadderOutcome::Cancelled;
                }
            }

            let agent_id = agent.id.clone();
            if let Err(e) = self
                .store
                .transition_stage(run_id, stage_id, StageStatus::Dispatched, |exec| {
                    exec.attempts += 1;
                    exec.assigned_agent_id = Some(agent_id);
                })
                .await
            {
                self.monitor.finish_dispatch(&agent.id, 0, true).await;
                return LadderOutcome::Rejected(e.to_string());
            }

            let action = match (attempt, fallback) {
                (0, false) => AuditAction::Execute,
                (0, true) => AuditAction::Fallback,
                _ => AuditAction::Retry,
            };
            self.log
                .record(
                    run_id,
                    stage_id,
                    Some(&agent.id),
                    action,
                    number,
                    json!({ "endpoint": agent.endpoint }),
                )
                .await;

            let request = ExecuteRequest {
                stage_id: stage_id.to_string(),
                input: input.clone(),
                context: json!({
                    "run_id": run_id,
                    "agent_id": agent.id,
                    "attempt": number,
                }),
                deadline_ms: retry.timeout_ms,
            };

            let started = Instant::now();
            let result = self.transport.execute(agent, &request, timeout).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            self.monitor
                .finish_dispatch(&agent.id, latency_ms, result.is_ok())
                .await;

            let failure = match result {
                Ok(output) => {
                    return LadderOutcome::Success {
                        output,
                        attempt: number,
                    }
                }
                Err(failure) => failure,
            };
            last_error = failure.message().to_string();
            let recorded = last_error.clone();
            if let Err(e) = self
                .store
                .update_stage(run_id, stage_id, |exec| exec.last_error = Some(recorded))
                .await
            {
                warn!(run_id = %run_id, stage_id = %stage_id, error = %e, "Cannot record last error");
            }

            if !failure.is_retryable() {
                warn!(
                    run_id = %run_id,
                    stage_id = %stage_id,
                    agent_id = %agent.id,
                    attempt = number,
                    error = %failure,
                    "Non-retryable failure, moving to next agent"
                );
                return LadderOutcome::Exhausted(last_error);
            }

            if attempt < retry.max_retries {
                info!(
                    run_id = %run_id,
                    stage_id = %stage_id,
                    agent_id = %agent.id,
                    attempt = number,
                    delay_ms = retry.backoff_ms,
                    error = %failure,
                    "Retryable failure, backing off"
                );
                if let Err(e) = self
                    .store
                    .transition_stage(run_id, stage_id, StageStatus::Retrying, |_| {})
                    .await
                {
                    return LadderOutcome::Rejected(e.to_string());
                }
                if !self.sleep_unless_cancelled(job, retry.backoff_ms).await {
                    return LadderOutcome::Cancelled;
                }
            }
        }

        LadderOutcome::Exhausted(last_error)
    }

    async fn complete_stage(
        &self,
        job: &DispatchJob,
        input: &serde_json::Value,
        agent_id: &str,
        attempt: u32,
        output: serde_json::Value,
    ) -> DispatchOutcome {
        let run_id = job.run_id;
        let stage_id = job.stage.id.as_str();
        let recorded = output.clone();
        if let Err(e) = self
            .store
            .transition_stage(run_id, stage_id, StageStatus::Completed, |exec| {
                exec.output = Some(recorded);
                exec.last_error = None;
            })
            .await
        {
            return DispatchOutcome::Failed {
                error: e.to_string(),
            };
        }
        self.log
            .record(
                run_id,
                stage_id,
                Some(agent_id),
                AuditAction::Complete,
                attempt,
                json!({}),
            )
            .await;
        if let Some(cache) = &self.cache {
            cache
                .store(&job.stage.agent_capability, input, &output, self.config.cache_ttl)
                .await;
        }
        info!(run_id = %run_id, stage_id = %stage_id, agent_id = %agent_id, "Stage completed");
        DispatchOutcome::Completed {
            agent_id: Some(agent_id.to_string()),
            output,
        }
    }

    async fn complete_from_cache(&self, job: &DispatchJob, output: serde_json::Value) -> DispatchOutcome {
        let run_id = job.run_id;
        let stage_id = job.stage.id.as_str();
        let recorded = output.clone();
        if let Err(e) = self
            .store
            .transition_stage(run_id, stage_id, StageStatus::Completed, |exec| {
                exec.output = Some(recorded);
            })
            .await
        {
            return DispatchOutcome::Failed {
                error: e.to_string(),
            };
        }
        self.log
            .record(
                run_id,
                stage_id,
                None,
                AuditAction::Cached,
                0,
                json!({ "capability": job.stage.agent_capability }),
            )
            .await;
        info!(run_id = %run_id, stage_id = %stage_id, "Stage served from cache");
        DispatchOutcome::Completed {
            agent_id: None,
            output,
        }
    }

    async fn fail_stage(
        &self,
        run_id: Uuid,
        stage_id: &str,
        agent_id: Option<&str>,
        attempt: u32,
        error: String,
    ) -> DispatchOutcome {
        let recorded = error.clone();
        if let Err(e) = self
            .store
            .transition_stage(run_id, stage_id, StageStatus::Failed, |exec| {
                exec.last_error = Some(recorded);
            })
            .await
        {
            warn!(run_id = %run_id, stage_id = %stage_id, error = %e, "Could not mark stage failed");
        }
        self.log
            .record(
                run_id,
                stage_id,
                agent_id,
                AuditAction::Fail,
                attempt,
                json!({ "error": error }),
            )
            .await;
        warn!(run_id = %run_id, stage_id = %stage_id, error = %error, "Stage failed");
        DispatchOutcome::Failed { error }
    }

    /// A stage that already talked to an agent is closed as failed; one that
    /// never left `ready` is left untouched.
    async fn cancel_stage(&self, run_id: Uuid, stage_id: &str) -> DispatchOutcome {
        let touched = self
            .store
            .stage(run_id, stage_id)
            .await
            .is_some_and(|exec| matches!(exec.status, StageStatus::Dispatched | StageStatus::Retrying));
        if touched {
            let _ = self
                .store
                .transition_stage(run_id, stage_id, StageStatus::Failed, |exec| {
                    exec.last_error = Some("run cancelled".into());
                })
                .await;
        }
        info!(run_id = %run_id, stage_id = %stage_id, "Dispatch cancelled");
        DispatchOutcome::Cancelled
    }
}
