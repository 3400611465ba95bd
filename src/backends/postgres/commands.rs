use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};

use super::PostgresBackend;
use super::core::workflow_instance_from_row;
use crate::backends::base::{BackendError, BackendResult, CommandBackend};
use crate::command::SlotPredicate;
use crate::models::{Command, CommandType, WorkflowExecutionStatus, WorkflowInstance};
use crate::observability::obs;

fn command_from_row(row: &PgRow) -> BackendResult<Command> {
    let command_type: String = row.get("command_type");
    Ok(Command {
        id: row.get("id"),
        command_type: PostgresBackend::parse_enum(&command_type)?,
        workflow_definition_code: row.get("workflow_definition_code"),
        workflow_definition_version: row.get("workflow_definition_version"),
        workflow_instance_id: row.get("workflow_instance_id"),
        worker_group: row.get("worker_group"),
        params: row.get::<Value, _>("params"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl CommandBackend for PostgresBackend {
    async fn list_pending_commands(
        &self,
        slot: SlotPredicate,
        limit: usize,
    ) -> BackendResult<Vec<Command>> {
        let rows = sqlx::query(
            r#"
            SELECT id, command_type, workflow_definition_code, workflow_definition_version,
                   workflow_instance_id, worker_group, params, created_at
            FROM commands
            WHERE id % $1 = $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(slot.id_step())
        .bind(slot.slot_index())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    async fn create_workflow_instance(
        &self,
        command: &Command,
        host: &str,
    ) -> BackendResult<WorkflowInstance> {
        let mut tx = self.pool.begin().await?;

        let consumed = sqlx::query("DELETE FROM commands WHERE id = $1")
            .bind(command.id)
            .execute(&mut *tx)
            .await?;
        if consumed.rows_affected() == 0 {
            return Err(BackendError::Message(format!(
                "command {} already consumed",
                command.id
            )));
        }

        let now = Utc::now();
        let row = match (command.command_type, command.workflow_instance_id) {
            (CommandType::Recover | CommandType::Rerun, Some(existing_id)) => {
                self.ensure_takeover(&mut tx, command, existing_id, host).await?;
                sqlx::query(
                    r#"
                    UPDATE workflow_instances
                    SET status = $2, command_type = $3, host = $4, restart_time = $5,
                        end_time = NULL
                    WHERE id = $1
                    RETURNING id, workflow_definition_code, workflow_definition_version, status,
                              command_type, host, worker_group, start_time, end_time, restart_time
                    "#,
                )
                .bind(existing_id)
                .bind(WorkflowExecutionStatus::Submitted.as_str())
                .bind(command.command_type.as_str())
                .bind(host)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    BackendError::Message(format!(
                        "workflow instance {existing_id} not found for command {}",
                        command.id
                    ))
                })?
            }
            _ => {
                sqlx::query(
                    r#"
                    INSERT INTO workflow_instances
                        (workflow_definition_code, workflow_definition_version, status,
                         command_type, host, worker_group, start_time)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING id, workflow_definition_code, workflow_definition_version, status,
                              command_type, host, worker_group, start_time, end_time, restart_time
                    "#,
                )
                .bind(command.workflow_definition_code)
                .bind(command.workflow_definition_version)
                .bind(WorkflowExecutionStatus::Submitted.as_str())
                .bind(command.command_type.as_str())
                .bind(host)
                .bind(&command.worker_group)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        let instance = workflow_instance_from_row(&row)?;
        tx.commit().await?;
        Ok(instance)
    }

    async fn move_to_error_command(&self, command: &Command, message: &str) -> BackendResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_error_command(&mut tx, command, message).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fail_workflow_instance(
        &self,
        command: &Command,
        workflow_instance_id: i64,
        message: &str,
    ) -> BackendResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $2, end_time = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workflow_instance_id)
        .bind(WorkflowExecutionStatus::Failure.as_str())
        .execute(&mut *tx)
        .await?;
        insert_error_command(&mut tx, command, message).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn insert_error_command(
    tx: &mut Transaction<'_, Postgres>,
    command: &Command,
    message: &str,
) -> BackendResult<()> {
    sqlx::query(
        r#"
        INSERT INTO error_commands
            (id, command_type, workflow_definition_code, workflow_definition_version,
             workflow_instance_id, worker_group, params, created_at, message)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET message = EXCLUDED.message, failed_at = NOW()
        "#,
    )
    .bind(command.id)
    .bind(command.command_type.as_str())
    .bind(command.workflow_definition_code)
    .bind(command.workflow_definition_version)
    .bind(command.workflow_instance_id)
    .bind(&command.worker_group)
    .bind(&command.params)
    .bind(command.created_at)
    .bind(message)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM commands WHERE id = $1")
        .bind(command.id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

impl PostgresBackend {
    /// Lock the instance row and refuse the takeover while a live master
    /// other than `host` still owns a non-terminal instance.
    async fn ensure_takeover(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        command: &Command,
        workflow_instance_id: i64,
        host: &str,
    ) -> BackendResult<()> {
        let row = sqlx::query(
            "SELECT status, host FROM workflow_instances WHERE id = $1 FOR UPDATE",
        )
        .bind(workflow_instance_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| {
            BackendError::Message(format!(
                "workflow instance {workflow_instance_id} not found for command {}",
                command.id
            ))
        })?;
        let status: WorkflowExecutionStatus = Self::parse_enum(&row.get::<String, _>("status"))?;
        let owner: Option<String> = row.get("host");
        let Some(owner) = owner.filter(|owner| owner != host) else {
            return Ok(());
        };
        if status.is_terminal() {
            return Ok(());
        }
        let live: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM registry_masters
                WHERE address = $1
                  AND heartbeat_at > NOW() - make_interval(secs => $2)
            )
            "#,
        )
        .bind(&owner)
        .bind(self.liveness_secs())
        .fetch_one(&mut **tx)
        .await?;
        if live {
            return Err(BackendError::Message(format!(
                "workflow instance {workflow_instance_id} is {status} on live master {owner}"
            )));
        }
        Ok(())
    }

    /// Enqueue a command and return its id.
    #[obs]
    pub async fn insert_command(&self, command: &Command) -> BackendResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO commands
                (command_type, workflow_definition_code, workflow_definition_version,
                 workflow_instance_id, worker_group, params, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(command.command_type.as_str())
        .bind(command.workflow_definition_code)
        .bind(command.workflow_definition_version)
        .bind(command.workflow_instance_id)
        .bind(&command.worker_group)
        .bind(&command.params)
        .bind(command.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    #[obs]
    pub async fn count_error_commands(&self) -> BackendResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM error_commands")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }
}
