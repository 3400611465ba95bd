//! Postgres backend for workflow instances, commands and the registry.

mod commands;
mod core;
mod registry;

use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;

use crate::db;
use crate::models::ParseEnumError;
use crate::observability::obs;

use super::base::{BackendError, BackendResult};

/// Registry rows older than this are treated as dead.
const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    liveness_window: Duration,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
        }
    }

    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    #[obs]
    pub async fn connect(dsn: &str) -> BackendResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete every row, for tests.
    #[obs]
    pub async fn clear_all(&self) -> BackendResult<()> {
        sqlx::query(
            r#"
            TRUNCATE commands,
                     error_commands,
                     workflow_definitions,
                     task_instances,
                     workflow_instances,
                     registry_hosts,
                     registry_masters
            RESTART IDENTITY
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(super) fn parse_enum<T>(value: &str) -> Result<T, BackendError>
    where
        T: FromStr<Err = ParseEnumError>,
    {
        value
            .parse()
            .map_err(|err: ParseEnumError| BackendError::Message(err.to_string()))
    }

    pub(super) fn liveness_secs(&self) -> f64 {
        self.liveness_window.as_secs_f64()
    }
}
