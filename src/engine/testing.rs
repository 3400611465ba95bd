use std::sync::Mutex;

use async_trait::async_trait;

use super::{RunnableError, WorkflowExecutionRunnable};
use crate::events::StateEvent;
use crate::models::WorkflowExecutionStatus;

/// Runnable double that records calls and received events.
pub(crate) struct StubRunnable {
    id: i64,
    status: Mutex<WorkflowExecutionStatus>,
    fail_start: bool,
    calls: Mutex<Vec<&'static str>>,
    events: Mutex<Vec<StateEvent>>,
}

impl StubRunnable {
    pub(crate) fn new(id: i64, status: WorkflowExecutionStatus) -> Self {
        Self {
            id,
            status: Mutex::new(status),
            fail_start: false,
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_start(id: i64) -> Self {
        Self {
            fail_start: true,
            ..Self::new(id, WorkflowExecutionStatus::Submitted)
        }
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("calls").clone()
    }

    pub(crate) fn events(&self) -> Vec<StateEvent> {
        self.events.lock().expect("events").clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().expect("calls").push(call);
    }

    fn set_status(&self, status: WorkflowExecutionStatus) {
        *self.status.lock().expect("status") = status;
    }
}

#[async_trait]
impl WorkflowExecutionRunnable for StubRunnable {
    fn workflow_instance_id(&self) -> i64 {
        self.id
    }

    fn status(&self) -> WorkflowExecutionStatus {
        *self.status.lock().expect("status")
    }

    async fn start(&self) -> Result<(), RunnableError> {
        self.record("start");
        if self.fail_start {
            return Err(RunnableError::PersistFailed {
                entity: "workflow instance",
                id: self.id,
                status: WorkflowExecutionStatus::Running.to_string(),
            });
        }
        self.set_status(WorkflowExecutionStatus::Running);
        Ok(())
    }

    async fn pause(&self) -> Result<(), RunnableError> {
        self.record("pause");
        let status = self.status();
        if status != WorkflowExecutionStatus::Running {
            return Err(RunnableError::IllegalState {
                id: self.id,
                operation: "pause",
                status,
            });
        }
        self.set_status(WorkflowExecutionStatus::ReadyPause);
        Ok(())
    }

    async fn resume(&self) -> Result<(), RunnableError> {
        self.record("resume");
        self.set_status(WorkflowExecutionStatus::Running);
        Ok(())
    }

    async fn kill(&self) -> Result<(), RunnableError> {
        self.record("kill");
        self.set_status(WorkflowExecutionStatus::Stopped);
        Ok(())
    }

    fn submit_event(&self, event: StateEvent) -> Result<(), RunnableError> {
        self.events.lock().expect("events").push(event);
        Ok(())
    }
}
