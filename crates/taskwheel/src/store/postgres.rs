use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::ExecutionStore;
use crate::error::SchedulerError;
use crate::execution::{Execution, ExecutionId};

const COLUMNS: &str = "task_name, task_instance, task_data, execution_time, picked, picked_by, \
                       last_success, last_failure, consecutive_failures, last_heartbeat, version";

/// The execution store backed by a PostgreSQL table.
///
/// The table name is configurable, so statements are assembled at runtime
/// with bind parameters for every value. The name itself is validated at
/// construction since it is embedded in the SQL text.
pub struct PgExecutionStore {
    pool: PgPool,
    table: String,
}

impl PgExecutionStore {
    pub const DEFAULT_TABLE: &'static str = "scheduled_tasks";

    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, SchedulerError> {
        let table = table.into();

        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(SchedulerError::InvalidTableName(table));
        }

        Ok(Self { pool, table })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Column list qualified with the table name, for statements where a
    /// bare column would be ambiguous.
    fn qualified_columns(&self) -> String {
        COLUMNS
            .split(", ")
            .map(|c| format!("{}.{}", self.table, c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Create the table and its due-time index if they do not exist.
    pub async fn create_schema_if_needed(&self) -> Result<(), SchedulerError> {
        let table = &self.table;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                task_name            text NOT NULL,
                task_instance        text NOT NULL,
                task_data            bytea,
                execution_time       timestamptz NOT NULL,
                picked               boolean NOT NULL DEFAULT false,
                picked_by            text,
                last_success         timestamptz,
                last_failure         timestamptz,
                consecutive_failures integer NOT NULL DEFAULT 0,
                last_heartbeat       timestamptz,
                version              bigint NOT NULL DEFAULT 1,
                PRIMARY KEY (task_name, task_instance)
            )"
        ))
        .execute(&self.pool)
        .await?;

        let index = format!("{}_execution_time_idx", table.replace('.', "_"));
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (execution_time) WHERE picked = false"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Execution {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            task_name: row.try_get("task_name")?,
            instance_id: row.try_get("task_instance")?,
            payload: row.try_get("task_data")?,
            execution_time: row.try_get("execution_time")?,
            picked: row.try_get("picked")?,
            picked_by: row.try_get("picked_by")?,
            last_success: row.try_get("last_success")?,
            last_failure: row.try_get("last_failure")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            version: row.try_get("version")?,
        })
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn create_if_not_exists(&self, execution: Execution) -> Result<bool, SchedulerError> {
        // The primary key is the arbiter: of any number of concurrent
        // inserts for one identity, exactly one lands.
        let result = sqlx::query(&format!(
            "INSERT INTO {} (task_name, task_instance, task_data, execution_time)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (task_name, task_instance) DO NOTHING",
            self.table
        ))
        .bind(&execution.task_name)
        .bind(&execution.instance_id)
        .bind(execution.payload.as_deref())
        .bind(execution.execution_time)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let executions = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {COLUMNS} FROM {}
             WHERE picked = false AND execution_time <= $1
             ORDER BY execution_time ASC
             LIMIT $2",
            self.table
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }

    async fn pick(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
        picked_by: &str,
    ) -> Result<Option<Execution>, SchedulerError> {
        let picked = sqlx::query_as::<_, Execution>(&format!(
            "UPDATE {}
             SET picked = true,
                 picked_by = $1,
                 last_heartbeat = $2,
                 version = version + 1
             WHERE task_name = $3
               AND task_instance = $4
               AND version = $5
               AND picked = false
             RETURNING {COLUMNS}",
            self.table
        ))
        .bind(picked_by)
        .bind(now)
        .bind(&execution.task_name)
        .bind(&execution.instance_id)
        .bind(execution.version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(picked)
    }

    async fn pick_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        picked_by: &str,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let table = &self.table;
        let columns = self.qualified_columns();

        let mut picked = sqlx::query_as::<_, Execution>(&format!(
            "WITH selected AS (
                 SELECT task_name, task_instance
                 FROM {table}
                 WHERE picked = false AND execution_time <= $1
                 ORDER BY execution_time ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE {table}
             SET picked = true,
                 picked_by = $3,
                 last_heartbeat = $1,
                 version = version + 1
             FROM selected
             WHERE {table}.task_name = selected.task_name
               AND {table}.task_instance = selected.task_instance
             RETURNING {columns}"
        ))
        .bind(now)
        .bind(limit as i64)
        .bind(picked_by)
        .fetch_all(&self.pool)
        .await?;

        // UPDATE … RETURNING does not promise the CTE's ordering.
        picked.sort_by_key(|e| e.execution_time);
        Ok(picked)
    }

    async fn update_heartbeat(
        &self,
        execution: &Execution,
        heartbeat_time: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET last_heartbeat = $1 WHERE task_name = $2 AND task_instance = $3",
            self.table
        ))
        .bind(heartbeat_time)
        .bind(&execution.task_name)
        .bind(&execution.instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(execution = %execution.id(), "heartbeat update found no row");
        }

        Ok(())
    }

    async fn get_old_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let executions = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {COLUMNS} FROM {}
             WHERE picked = true AND last_heartbeat < $1
             ORDER BY last_heartbeat ASC",
            self.table
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }

    async fn get_failing_longer_than(
        &self,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let boundary = now
            .checked_sub_signed(
                chrono::Duration::from_std(duration)
                    .unwrap_or(chrono::Duration::MAX),
            )
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let executions = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {COLUMNS} FROM {}
             WHERE picked = false
               AND consecutive_failures > 0
               AND (last_success IS NULL OR last_success < $1)
             ORDER BY execution_time ASC",
            self.table
        ))
        .bind(boundary)
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }

    async fn reschedule(
        &self,
        execution: &Execution,
        next_time: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
        consecutive_failures: i32,
        new_payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError> {
        let result = match new_payload {
            None => {
                sqlx::query(&format!(
                    "UPDATE {}
                     SET picked = false,
                         picked_by = NULL,
                         last_heartbeat = NULL,
                         execution_time = $1,
                         last_success = $2,
                         last_failure = $3,
                         consecutive_failures = $4,
                         version = version + 1
                     WHERE task_name = $5 AND task_instance = $6 AND version = $7",
                    self.table
                ))
                .bind(next_time)
                .bind(last_success)
                .bind(last_failure)
                .bind(consecutive_failures)
                .bind(&execution.task_name)
                .bind(&execution.instance_id)
                .bind(execution.version)
                .execute(&self.pool)
                .await?
            }
            Some(payload) => {
                sqlx::query(&format!(
                    "UPDATE {}
                     SET picked = false,
                         picked_by = NULL,
                         last_heartbeat = NULL,
                         execution_time = $1,
                         last_success = $2,
                         last_failure = $3,
                         consecutive_failures = $4,
                         task_data = $5,
                         version = version + 1
                     WHERE task_name = $6 AND task_instance = $7 AND version = $8",
                    self.table
                ))
                .bind(next_time)
                .bind(last_success)
                .bind(last_failure)
                .bind(consecutive_failures)
                .bind(payload)
                .bind(&execution.task_name)
                .bind(&execution.instance_id)
                .bind(execution.version)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, execution: &Execution) -> Result<bool, SchedulerError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE task_name = $1 AND task_instance = $2 AND version = $3",
            self.table
        ))
        .bind(&execution.task_name)
        .bind(&execution.instance_id)
        .bind(execution.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_payload(
        &self,
        execution: &Execution,
        payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError> {
        let result = sqlx::query(&format!(
            "UPDATE {}
             SET task_data = $1, version = version + 1
             WHERE task_name = $2 AND task_instance = $3 AND version = $4",
            self.table
        ))
        .bind(payload)
        .bind(&execution.task_name)
        .bind(&execution.instance_id)
        .bind(execution.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<Execution>, SchedulerError> {
        let execution = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {COLUMNS} FROM {} WHERE task_name = $1 AND task_instance = $2",
            self.table
        ))
        .bind(&id.task_name)
        .bind(&id.instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(execution)
    }

    async fn get_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let executions = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {COLUMNS} FROM {}
             WHERE task_name = $1
             ORDER BY execution_time ASC",
            self.table
        ))
        .bind(task_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }

    async fn get_all_executions(&self) -> Result<Vec<Execution>, SchedulerError> {
        let executions = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {COLUMNS} FROM {} ORDER BY execution_time ASC",
            self.table
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }
}
