//! State change events reported by workers and peers, and the sharded
//! pipeline that routes them to their workflow runnables.

use thiserror::Error;

use crate::messages::proto::StateChangeNotification;
use crate::models::{ParseEnumError, TaskExecutionStatus, WorkflowExecutionStatus};

mod handler;
mod pipeline;

pub use handler::MasterRpcHandler;
pub use pipeline::StateEventPipeline;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid status in state change: {0}")]
    InvalidStatus(#[from] ParseEnumError),
    #[error("state event pipeline is shut down")]
    PipelineClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEventType {
    WorkflowStateChange,
    TaskStateChange,
    /// Internal re-evaluation tick, e.g. after a dispatch found no host.
    WakeUp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStateEvent {
    pub workflow_instance_id: i64,
    pub event_type: StateEventType,
    pub status: WorkflowExecutionStatus,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStateEvent {
    pub workflow_instance_id: i64,
    pub task_instance_id: i64,
    pub status: TaskExecutionStatus,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    Workflow(WorkflowStateEvent),
    Task(TaskStateEvent),
}

impl StateEvent {
    /// A notification without a task id targets the destination workflow;
    /// when it comes from another instance (a finished sub-workflow) the
    /// destination is told to keep running.
    pub fn from_notification(notification: &StateChangeNotification) -> Result<Self, EventError> {
        if notification.dest_task_instance_id == 0 {
            let status = if notification.source_workflow_instance_id
                != notification.dest_workflow_instance_id
            {
                WorkflowExecutionStatus::Running
            } else {
                notification.source_status.parse()?
            };
            return Ok(StateEvent::Workflow(WorkflowStateEvent {
                workflow_instance_id: notification.dest_workflow_instance_id,
                event_type: StateEventType::WorkflowStateChange,
                status,
                key: notification.key.clone(),
            }));
        }
        Ok(StateEvent::Task(TaskStateEvent {
            workflow_instance_id: notification.dest_workflow_instance_id,
            task_instance_id: notification.dest_task_instance_id,
            status: notification.source_status.parse()?,
            key: notification.key.clone(),
        }))
    }

    pub fn task(
        workflow_instance_id: i64,
        task_instance_id: i64,
        status: TaskExecutionStatus,
        key: impl Into<String>,
    ) -> Self {
        StateEvent::Task(TaskStateEvent {
            workflow_instance_id,
            task_instance_id,
            status,
            key: key.into(),
        })
    }

    pub fn wake_up(workflow_instance_id: i64) -> Self {
        StateEvent::Workflow(WorkflowStateEvent {
            workflow_instance_id,
            event_type: StateEventType::WakeUp,
            status: WorkflowExecutionStatus::Running,
            key: String::new(),
        })
    }

    pub fn workflow_instance_id(&self) -> i64 {
        match self {
            StateEvent::Workflow(event) => event.workflow_instance_id,
            StateEvent::Task(event) => event.workflow_instance_id,
        }
    }

    pub fn task_instance_id(&self) -> Option<i64> {
        match self {
            StateEvent::Workflow(_) => None,
            StateEvent::Task(event) => Some(event.task_instance_id),
        }
    }

    pub fn event_type(&self) -> StateEventType {
        match self {
            StateEvent::Workflow(event) => event.event_type,
            StateEvent::Task(_) => StateEventType::TaskStateChange,
        }
    }

    /// Idempotency key; empty when the sender did not provide one.
    pub fn key(&self) -> &str {
        match self {
            StateEvent::Workflow(event) => &event.key,
            StateEvent::Task(event) => &event.key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(source: i64, dest: i64, task: i64, status: &str) -> StateChangeNotification {
        StateChangeNotification {
            source_workflow_instance_id: source,
            dest_workflow_instance_id: dest,
            dest_task_instance_id: task,
            source_status: status.to_string(),
            key: format!("{source}-{dest}-{task}-{status}"),
        }
    }

    #[test]
    fn task_id_zero_yields_workflow_event() {
        let event = StateEvent::from_notification(&notification(4, 4, 0, "SUCCESS"))
            .expect("valid notification");
        assert_eq!(event.event_type(), StateEventType::WorkflowStateChange);
        assert_eq!(event.task_instance_id(), None);
        match event {
            StateEvent::Workflow(event) => {
                assert_eq!(event.status, WorkflowExecutionStatus::Success)
            }
            StateEvent::Task(_) => panic!("expected workflow event"),
        }
    }

    #[test]
    fn cross_instance_workflow_event_is_forced_running() {
        let event = StateEvent::from_notification(&notification(9, 4, 0, "SUCCESS"))
            .expect("valid notification");
        assert_eq!(event.workflow_instance_id(), 4);
        assert!(matches!(
            event,
            StateEvent::Workflow(WorkflowStateEvent {
                status: WorkflowExecutionStatus::Running,
                ..
            })
        ));
    }

    #[test]
    fn task_notification_yields_task_event() {
        let event = StateEvent::from_notification(&notification(4, 4, 12, "RUNNING"))
            .expect("valid notification");
        assert_eq!(event.task_instance_id(), Some(12));
        assert_eq!(event.key(), "4-4-12-RUNNING");
        assert!(matches!(
            event,
            StateEvent::Task(TaskStateEvent {
                status: TaskExecutionStatus::Running,
                ..
            })
        ));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = StateEvent::from_notification(&notification(4, 4, 12, "EXPLODED"))
            .expect_err("bad status");
        assert!(matches!(err, EventError::InvalidStatus(_)));
    }
}
