use std::sync::Arc;

use tracing::{debug, info};

use super::{EngineError, WorkflowExecutionRunnable, WorkflowRunnableRepository};
use crate::models::StopPath;

/// Front door for lifecycle requests against live runnables.
#[derive(Clone)]
pub struct WorkflowEngine {
    repository: Arc<WorkflowRunnableRepository>,
}

impl WorkflowEngine {
    pub fn new(repository: Arc<WorkflowRunnableRepository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<WorkflowRunnableRepository> {
        &self.repository
    }

    /// Register `runnable` and start it. A failed start leaves no trace in
    /// the repository.
    pub async fn trigger_workflow(
        &self,
        runnable: Arc<dyn WorkflowExecutionRunnable>,
    ) -> Result<(), EngineError> {
        let id = runnable.workflow_instance_id();
        if !self.repository.insert(Arc::clone(&runnable)) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Err(err) = runnable.start().await {
            self.repository.remove_if_same(id, &runnable);
            return Err(err.into());
        }
        info!(workflow_instance_id = id, "workflow triggered");
        Ok(())
    }

    pub async fn pause_workflow(&self, id: i64) -> Result<(), EngineError> {
        let runnable = self.lookup(id)?;
        runnable.pause().await?;
        info!(workflow_instance_id = id, "workflow pause requested");
        Ok(())
    }

    pub async fn resume_workflow(&self, id: i64) -> Result<(), EngineError> {
        let runnable = self.lookup(id)?;
        runnable.resume().await?;
        info!(workflow_instance_id = id, "workflow resumed");
        Ok(())
    }

    pub async fn stop_workflow(&self, id: i64) -> Result<(), EngineError> {
        let runnable = self.lookup(id)?;
        let status = runnable.status();
        let Some(path) = status.stop_path() else {
            return Err(EngineError::IllegalState {
                id,
                operation: "stop",
                status,
            });
        };
        runnable.kill().await?;
        match path {
            StopPath::DirectDb => info!(workflow_instance_id = id, "workflow stopped in store"),
            StopPath::Live => info!(workflow_instance_id = id, "workflow stop sent to workers"),
        }
        Ok(())
    }

    pub async fn kill_workflow(&self, id: i64) -> Result<(), EngineError> {
        self.stop_workflow(id).await
    }

    /// Drop the runnable for `id`; a no-op when it is already gone.
    pub fn finalize_workflow(&self, id: i64) {
        if self.repository.remove(id).is_some() {
            debug!(workflow_instance_id = id, "workflow finalized");
        }
    }

    fn lookup(&self, id: i64) -> Result<Arc<dyn WorkflowExecutionRunnable>, EngineError> {
        self.repository.get(id).ok_or(EngineError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::StubRunnable;
    use crate::models::WorkflowExecutionStatus;

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(Arc::new(WorkflowRunnableRepository::new()))
    }

    #[tokio::test]
    async fn trigger_inserts_and_starts() {
        let engine = engine();
        let runnable = Arc::new(StubRunnable::new(1, WorkflowExecutionStatus::Submitted));
        engine
            .trigger_workflow(runnable.clone())
            .await
            .expect("trigger");
        assert!(engine.repository().contains(1));
        assert_eq!(runnable.calls(), vec!["start"]);
    }

    #[tokio::test]
    async fn duplicate_trigger_is_rejected_and_keeps_original() {
        let engine = engine();
        let first = Arc::new(StubRunnable::new(1, WorkflowExecutionStatus::Submitted));
        let second = Arc::new(StubRunnable::new(1, WorkflowExecutionStatus::Submitted));
        engine.trigger_workflow(first.clone()).await.expect("trigger");

        let err = engine
            .trigger_workflow(second.clone())
            .await
            .expect_err("duplicate");
        assert!(matches!(err, EngineError::AlreadyExists(1)));
        assert!(second.calls().is_empty(), "duplicate never started");
        assert_eq!(engine.repository().len(), 1);

        engine.pause_workflow(1).await.expect("pause original");
        assert_eq!(first.calls(), vec!["start", "pause"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_for_one_id_admit_one() {
        for _ in 0..50 {
            let engine = engine();
            let runnables: Vec<Arc<StubRunnable>> = (0..4)
                .map(|_| Arc::new(StubRunnable::new(9, WorkflowExecutionStatus::Submitted)))
                .collect();
            let tasks: Vec<_> = runnables
                .iter()
                .map(|runnable| {
                    let engine = engine.clone();
                    let runnable: Arc<dyn WorkflowExecutionRunnable> = runnable.clone();
                    tokio::spawn(async move { engine.trigger_workflow(runnable).await })
                })
                .collect();

            let mut admitted = 0;
            for task in tasks {
                match task.await.expect("join") {
                    Ok(()) => admitted += 1,
                    Err(err) => assert!(matches!(err, EngineError::AlreadyExists(9))),
                }
            }
            assert_eq!(admitted, 1);
            assert_eq!(engine.repository().len(), 1);
            let started = runnables
                .iter()
                .filter(|runnable| runnable.calls() == vec!["start"])
                .count();
            assert_eq!(started, 1, "only the admitted runnable starts");
        }
    }

    #[tokio::test]
    async fn failed_start_rolls_back_insert() {
        let engine = engine();
        let err = engine
            .trigger_workflow(Arc::new(StubRunnable::failing_start(5)))
            .await
            .expect_err("start fails");
        assert!(matches!(err, EngineError::Runnable(_)));
        assert!(!engine.repository().contains(5));
        assert!(engine.repository().is_empty());
    }

    #[tokio::test]
    async fn missing_instance_reports_not_found() {
        let engine = engine();
        let err = engine.pause_workflow(999).await.expect_err("absent");
        assert_eq!(err.to_string(), "WorkflowExecuteRunnable not found: [id=999]");
        assert!(matches!(
            engine.stop_workflow(999).await,
            Err(EngineError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn pause_outside_running_is_rejected_by_runnable() {
        let engine = engine();
        let runnable = Arc::new(StubRunnable::new(3, WorkflowExecutionStatus::Paused));
        assert!(engine.repository().insert(runnable));
        let err = engine.pause_workflow(3).await.expect_err("not running");
        assert!(matches!(
            err,
            EngineError::Runnable(crate::engine::RunnableError::IllegalState { .. })
        ));
    }

    #[tokio::test]
    async fn stop_legality_over_every_status() {
        for status in WorkflowExecutionStatus::ALL {
            let engine = engine();
            let runnable = Arc::new(StubRunnable::new(7, status));
            assert!(engine.repository().insert(runnable.clone()));

            let result = engine.stop_workflow(7).await;
            if status.can_stop() {
                assert!(result.is_ok(), "{status} should be stoppable");
                assert_eq!(runnable.calls(), vec!["kill"]);
            } else {
                match result {
                    Err(EngineError::IllegalState {
                        status: reported, ..
                    }) => assert_eq!(reported, status),
                    other => panic!("{status}: expected IllegalState, got {other:?}"),
                }
                assert!(runnable.calls().is_empty());
            }
        }
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let engine = engine();
        let runnable = Arc::new(StubRunnable::new(2, WorkflowExecutionStatus::Running));
        assert!(engine.repository().insert(runnable));
        engine.finalize_workflow(2);
        engine.finalize_workflow(2);
        assert!(engine.repository().is_empty());
    }

    #[test]
    fn remove_if_same_ignores_other_runnables() {
        let repository = WorkflowRunnableRepository::new();
        let stored: Arc<dyn WorkflowExecutionRunnable> =
            Arc::new(StubRunnable::new(4, WorkflowExecutionStatus::Running));
        let other: Arc<dyn WorkflowExecutionRunnable> =
            Arc::new(StubRunnable::new(4, WorkflowExecutionStatus::Running));
        assert!(repository.insert(Arc::clone(&stored)));
        assert!(!repository.insert(Arc::clone(&other)));
        assert!(!repository.remove_if_same(4, &other));
        assert!(repository.remove_if_same(4, &stored));
        assert!(repository.ids().is_empty());
    }
}
