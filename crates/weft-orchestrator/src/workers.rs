use crate::dispatch::{DispatchJob, DispatchOutcome, Dispatcher};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;
use weft_core::{WeftError, WeftResult};

struct WorkItem {
    job: DispatchJob,
    reply: oneshot::Sender<DispatchOutcome>,
}

/// Fixed set of workers consuming ready stages from one shared queue.
///
/// The pool size is the global dispatch concurrency limit, independent of
/// per-agent ceilings. Each worker owns one dispatch from start to outcome.
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<WorkItem>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one). Must be called inside a Tokio runtime.
    pub fn spawn(size: usize, dispatcher: Arc<Dispatcher>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<WorkItem>();
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..size.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    loop {
                        let item = rx.lock().await.recv().await;
                        let Some(item) = item else {
                            break;
                        };
                        debug!(
                            worker,
                            run_id = %item.job.run_id,
                            stage_id = %item.job.stage.id,
                            "Worker picked up stage"
                        );
                        let outcome = dispatcher.dispatch(item.job).await;
                        // The submitter may have stopped waiting; the outcome is
                        // already recorded in the run store.
                        let _ = item.reply.send(outcome);
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();
        Self { tx, handles }
    }

    /// Queue a job; the receiver yields its outcome.
    pub fn submit(&self, job: DispatchJob) -> WeftResult<oneshot::Receiver<DispatchOutcome>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkItem { job, reply })
            .map_err(|_| WeftError::Orchestrator("worker pool is shut down".into()))?;
        Ok(rx)
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting work and wait for queued jobs to drain.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::ExecutionLog;
    use crate::client::HttpAgentTransport;
    use crate::dispatch::DispatchConfig;
    use crate::monitor::AgentMonitor;
    use crate::registry::InMemoryRegistry;
    use crate::store::RunStore;
    use crate::types::StageDefinition;
    use std::sync::atomic::AtomicBool;
    use uuid::Uuid;

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(HttpAgentTransport::new()),
            Arc::new(AgentMonitor::new()),
            Arc::new(ExecutionLog::new()),
            Arc::new(RunStore::new()),
            DispatchConfig::default(),
        ))
    }

    fn orphan_job() -> DispatchJob {
        DispatchJob {
            run_id: Uuid::new_v4(),
            stage: StageDefinition::new("s", "x"),
            workflow_input: serde_json::Value::Null,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn test_pool_size_has_floor_of_one() {
        let pool = WorkerPool::spawn(0, dispatcher());
        assert_eq!(pool.size(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_every_submission_gets_an_outcome() {
        let pool = WorkerPool::spawn(3, dispatcher());
        let receivers: Vec<_> = (0..5).map(|_| pool.submit(orphan_job()).unwrap()).collect();
        for rx in receivers {
            // Unknown runs cannot be recorded, so each job fails fast.
            assert!(matches!(rx.await.unwrap(), DispatchOutcome::Failed { .. }));
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_job_is_reported() {
        let pool = WorkerPool::spawn(1, dispatcher());
        let job = orphan_job();
        job.cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        let outcome = pool.submit(job).unwrap().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Cancelled);
        pool.shutdown().await;
    }
}
