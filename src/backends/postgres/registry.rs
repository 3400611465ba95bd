use async_trait::async_trait;
use sqlx::Row;

use super::PostgresBackend;
use crate::backends::base::{BackendResult, RegistryBackend};
use crate::models::{Host, HostWorkload};
use crate::observability::obs;

#[async_trait]
impl RegistryBackend for PostgresBackend {
    async fn list_worker_groups(&self) -> BackendResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT worker_group
            FROM registry_hosts
            WHERE heartbeat_at > NOW() - make_interval(secs => $1)
            ORDER BY worker_group
            "#,
        )
        .bind(self.liveness_secs())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("worker_group")).collect())
    }

    async fn list_hosts(&self, worker_group: &str) -> BackendResult<Vec<Host>> {
        let rows = sqlx::query(
            r#"
            SELECT address, worker_group, weight, cpu_usage, memory_usage, load_average,
                   startup_time
            FROM registry_hosts
            WHERE worker_group = $1
              AND heartbeat_at > NOW() - make_interval(secs => $2)
            ORDER BY address
            "#,
        )
        .bind(worker_group)
        .bind(self.liveness_secs())
        .fetch_all(&self.pool)
        .await?;

        let mut hosts = Vec::with_capacity(rows.len());
        for row in rows {
            let weight: i32 = row.get("weight");
            let cpu_usage: Option<f64> = row.get("cpu_usage");
            let memory_usage: Option<f64> = row.get("memory_usage");
            let load_average: Option<f64> = row.get("load_average");
            let startup_time: Option<chrono::DateTime<chrono::Utc>> = row.get("startup_time");
            let workload = match (cpu_usage, memory_usage, load_average, startup_time) {
                (Some(cpu_usage), Some(memory_usage), Some(load_average), Some(startup_time)) => {
                    Some(HostWorkload {
                        cpu_usage,
                        memory_usage,
                        load_average,
                        startup_time,
                    })
                }
                _ => None,
            };
            hosts.push(Host {
                address: row.get("address"),
                weight: weight.max(0) as u32,
                worker_group: row.get("worker_group"),
                workload,
            });
        }
        Ok(hosts)
    }

    async fn list_masters(&self) -> BackendResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT address
            FROM registry_masters
            WHERE heartbeat_at > NOW() - make_interval(secs => $1)
            ORDER BY address
            "#,
        )
        .bind(self.liveness_secs())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("address")).collect())
    }

    async fn register_master(&self, address: &str) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO registry_masters (address, heartbeat_at)
            VALUES ($1, NOW())
            ON CONFLICT (address) DO UPDATE SET heartbeat_at = NOW()
            "#,
        )
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl PostgresBackend {
    /// Upsert a worker heartbeat.
    #[obs]
    pub async fn upsert_host(&self, host: &Host) -> BackendResult<()> {
        let workload = host.workload.as_ref();
        sqlx::query(
            r#"
            INSERT INTO registry_hosts
                (address, worker_group, weight, cpu_usage, memory_usage, load_average,
                 startup_time, heartbeat_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (address) DO UPDATE
            SET worker_group = EXCLUDED.worker_group,
                weight = EXCLUDED.weight,
                cpu_usage = EXCLUDED.cpu_usage,
                memory_usage = EXCLUDED.memory_usage,
                load_average = EXCLUDED.load_average,
                startup_time = EXCLUDED.startup_time,
                heartbeat_at = NOW()
            "#,
        )
        .bind(&host.address)
        .bind(&host.worker_group)
        .bind(host.weight as i32)
        .bind(workload.map(|w| w.cpu_usage))
        .bind(workload.map(|w| w.memory_usage))
        .bind(workload.map(|w| w.load_average))
        .bind(workload.map(|w| w.startup_time))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
