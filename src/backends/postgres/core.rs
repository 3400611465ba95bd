use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::PostgresBackend;
use crate::backends::base::{
    BackendError, BackendResult, WorkflowDefinitionBackend, WorkflowInstanceBackend,
};
use crate::models::{TaskInstance, WorkflowDag, WorkflowInstance};
use crate::observability::obs;

pub(super) fn workflow_instance_from_row(row: &PgRow) -> BackendResult<WorkflowInstance> {
    let status: String = row.get("status");
    let command_type: String = row.get("command_type");
    Ok(WorkflowInstance {
        id: row.get("id"),
        workflow_definition_code: row.get("workflow_definition_code"),
        workflow_definition_version: row.get("workflow_definition_version"),
        status: PostgresBackend::parse_enum(&status)?,
        command_type: PostgresBackend::parse_enum(&command_type)?,
        host: row.get("host"),
        worker_group: row.get("worker_group"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        restart_time: row.get("restart_time"),
    })
}

fn task_instance_from_row(row: &PgRow) -> BackendResult<TaskInstance> {
    let status: String = row.get("status");
    let retry_times: i32 = row.get("retry_times");
    let max_retry_times: i32 = row.get("max_retry_times");
    Ok(TaskInstance {
        id: row.get("id"),
        workflow_instance_id: row.get("workflow_instance_id"),
        task_code: row.get("task_code"),
        task_version: row.get("task_version"),
        name: row.get("name"),
        task_type: row.get("task_type"),
        status: PostgresBackend::parse_enum(&status)?,
        host: row.get("host"),
        retry_times: retry_times.max(0) as u32,
        max_retry_times: max_retry_times.max(0) as u32,
        worker_group: row.get("worker_group"),
        submit_time: row.get("submit_time"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
    })
}

#[async_trait]
impl WorkflowInstanceBackend for PostgresBackend {
    async fn get_workflow_instance(&self, id: i64) -> BackendResult<Option<WorkflowInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_definition_code, workflow_definition_version, status,
                   command_type, host, worker_group, start_time, end_time, restart_time
            FROM workflow_instances
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(workflow_instance_from_row).transpose()
    }

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> BackendResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $2,
                command_type = $3,
                host = $4,
                worker_group = $5,
                start_time = $6,
                end_time = $7,
                restart_time = $8
            WHERE id = $1
            "#,
        )
        .bind(instance.id)
        .bind(instance.status.as_str())
        .bind(instance.command_type.as_str())
        .bind(&instance.host)
        .bind(&instance.worker_group)
        .bind(instance.start_time)
        .bind(instance.end_time)
        .bind(instance.restart_time)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_task_instance(&self, task: &TaskInstance) -> BackendResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO task_instances
                (workflow_instance_id, task_code, task_version, name, task_type, status,
                 host, retry_times, max_retry_times, worker_group, submit_time,
                 start_time, end_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            "#,
        )
        .bind(task.workflow_instance_id)
        .bind(task.task_code)
        .bind(task.task_version)
        .bind(&task.name)
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(&task.host)
        .bind(task.retry_times as i32)
        .bind(task.max_retry_times as i32)
        .bind(&task.worker_group)
        .bind(task.submit_time)
        .bind(task.start_time)
        .bind(task.end_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    async fn update_task_instance(&self, task: &TaskInstance) -> BackendResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = $2,
                host = $3,
                retry_times = $4,
                submit_time = $5,
                start_time = $6,
                end_time = $7
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.status.as_str())
        .bind(&task.host)
        .bind(task.retry_times as i32)
        .bind(task.submit_time)
        .bind(task.start_time)
        .bind(task.end_time)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> BackendResult<Vec<TaskInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_instance_id, task_code, task_version, name, task_type,
                   status, host, retry_times, max_retry_times, worker_group,
                   submit_time, start_time, end_time
            FROM task_instances
            WHERE workflow_instance_id = $1
            ORDER BY id
            "#,
        )
        .bind(workflow_instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_instance_from_row).collect()
    }
}

#[async_trait]
impl WorkflowDefinitionBackend for PostgresBackend {
    async fn load_dag(&self, code: i64, version: i32) -> BackendResult<WorkflowDag> {
        let row = sqlx::query(
            r#"
            SELECT dag
            FROM workflow_definitions
            WHERE code = $1 AND version = $2
            "#,
        )
        .bind(code)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BackendError::Message(format!("workflow definition {code}:{version} not found"))
        })?;
        let dag: Value = row.get("dag");
        Ok(serde_json::from_value(dag)?)
    }
}

impl PostgresBackend {
    /// Store a definition graph, replacing any previous one.
    #[obs]
    pub async fn upsert_workflow_definition(
        &self,
        code: i64,
        version: i32,
        dag: &WorkflowDag,
    ) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (code, version, dag)
            VALUES ($1, $2, $3)
            ON CONFLICT (code, version) DO UPDATE SET dag = EXCLUDED.dag
            "#,
        )
        .bind(code)
        .bind(version)
        .bind(serde_json::to_value(dag)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
