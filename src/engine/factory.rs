use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{EngineError, RunnableContext, WorkflowExecuteRunnable, WorkflowExecutionRunnable};
use crate::models::{Command, CommandType, TaskExecutionStatus, TaskInstance};

/// Turns a pending command into a runnable ready to be triggered.
#[async_trait]
pub trait WorkflowRunnableFactory: Send + Sync {
    async fn create(&self, command: &Command) -> Result<Arc<dyn WorkflowExecutionRunnable>, EngineError>;
}

pub struct DefaultWorkflowRunnableFactory {
    context: RunnableContext,
}

impl DefaultWorkflowRunnableFactory {
    pub fn new(context: RunnableContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl WorkflowRunnableFactory for DefaultWorkflowRunnableFactory {
    async fn create(&self, command: &Command) -> Result<Arc<dyn WorkflowExecutionRunnable>, EngineError> {
        let backend = &self.context.backend;
        if let Some(existing_id) = command.workflow_instance_id
            && self.context.engine.repository().contains(existing_id)
        {
            return Err(EngineError::AlreadyExists(existing_id));
        }
        // Load the definition before consuming the command so a bad definition
        // leaves nothing behind.
        let dag = backend
            .load_dag(
                command.workflow_definition_code,
                command.workflow_definition_version,
            )
            .await?;
        let instance = backend
            .create_workflow_instance(command, &self.context.master_address)
            .await?;

        let tasks = if command.command_type == CommandType::Recover {
            recovered_tasks(backend.list_task_instances(instance.id).await?)
        } else {
            Vec::new()
        };
        info!(
            command_id = command.id,
            workflow_instance_id = instance.id,
            command_type = %command.command_type,
            recovered_tasks = tasks.len(),
            "created workflow runnable"
        );
        Ok(Arc::new(WorkflowExecuteRunnable::new(
            instance,
            dag,
            tasks,
            self.context.clone(),
        )))
    }
}

/// Latest row per task code. Succeeded and still-running tasks are kept;
/// everything else is queued for dispatch again.
fn recovered_tasks(rows: Vec<TaskInstance>) -> Vec<TaskInstance> {
    let mut latest: HashMap<i64, TaskInstance> = HashMap::new();
    for row in rows {
        match latest.get(&row.task_code) {
            Some(existing) if existing.id >= row.id => {}
            _ => {
                latest.insert(row.task_code, row);
            }
        }
    }
    let mut tasks: Vec<TaskInstance> = latest
        .into_values()
        .map(|mut task| {
            if !matches!(
                task.status,
                TaskExecutionStatus::Success | TaskExecutionStatus::Running
            ) {
                task.status = TaskExecutionStatus::Submitted;
                task.host = None;
                task.start_time = None;
                task.end_time = None;
            }
            task
        })
        .collect();
    tasks.sort_by_key(|task| task.id);
    tasks
}
