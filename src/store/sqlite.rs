//! SQLite implementation of Store.
//!
//! Timestamps are stored as INTEGER milliseconds since the Unix epoch so that
//! eligibility and lease comparisons happen in SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::time::Duration;

use super::records::*;
use super::{Store, StoreError};
use crate::advancer::{AdvancePlan, NewStep, PlanOutcome};
use crate::graph::{NodeId, Transition};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flow_pipelines (
    id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    definition TEXT NOT NULL,
    definition_hash TEXT NOT NULL,
    triggered_at INTEGER NOT NULL,
    started_at INTEGER,
    last_advanced_at INTEGER,
    claimed_for_advancing_at INTEGER,
    completed_at INTEGER
);

CREATE TABLE IF NOT EXISTS flow_steps (
    id INTEGER PRIMARY KEY,
    pipeline_id INTEGER NOT NULL REFERENCES flow_pipelines(id),
    node_id TEXT NOT NULL,
    step_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    transition TEXT NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE TABLE IF NOT EXISTS flow_jobs (
    id INTEGER PRIMARY KEY,
    step_id INTEGER NOT NULL UNIQUE REFERENCES flow_steps(id),
    step_type TEXT NOT NULL,
    input TEXT NOT NULL,
    output TEXT,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE TABLE IF NOT EXISTS flow_executions (
    id INTEGER PRIMARY KEY,
    job_id INTEGER NOT NULL REFERENCES flow_jobs(id),
    retry_count INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    owner_pid INTEGER,
    owner_machine TEXT
);

CREATE TABLE IF NOT EXISTS flow_availabilities (
    id INTEGER PRIMARY KEY,
    execution_id INTEGER NOT NULL UNIQUE REFERENCES flow_executions(id),
    kind TEXT NOT NULL,
    eligible_at INTEGER NOT NULL,
    completed_at INTEGER,
    claimant_pid INTEGER,
    claimant_machine TEXT
);

CREATE TABLE IF NOT EXISTS flow_results (
    id INTEGER PRIMARY KEY,
    execution_id INTEGER NOT NULL UNIQUE REFERENCES flow_executions(id),
    result_type TEXT NOT NULL,
    error_type TEXT,
    error_message TEXT,
    error_trace TEXT,
    recorded_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS flow_tuples (
    id INTEGER PRIMARY KEY,
    pipeline_id INTEGER NOT NULL REFERENCES flow_pipelines(id),
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    first_set_at INTEGER NOT NULL,
    last_set_at INTEGER NOT NULL,
    UNIQUE (pipeline_id, key)
);

CREATE TABLE IF NOT EXISTS flow_heartbeats (
    id INTEGER PRIMARY KEY,
    pid INTEGER NOT NULL,
    machine_id TEXT NOT NULL,
    last_heartbeat_at INTEGER NOT NULL,
    UNIQUE (pid, machine_id)
);

CREATE INDEX IF NOT EXISTS idx_flow_availabilities_eligible ON flow_availabilities(kind, completed_at, eligible_at);
CREATE INDEX IF NOT EXISTS idx_flow_availabilities_claimant ON flow_availabilities(claimant_machine, claimant_pid);
CREATE INDEX IF NOT EXISTS idx_flow_pipelines_advance ON flow_pipelines(status, claimed_for_advancing_at, last_advanced_at);
CREATE INDEX IF NOT EXISTS idx_flow_steps_pipeline ON flow_steps(pipeline_id, status);
CREATE INDEX IF NOT EXISTS idx_flow_executions_job ON flow_executions(job_id)
"#;

const PIPELINE_COLUMNS: &str = "id, kind, status, definition, definition_hash, triggered_at, \
     started_at, last_advanced_at, claimed_for_advancing_at, completed_at";

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn optional_timestamp(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(timestamp).transpose()
}

fn pipeline_from_row(row: &SqliteRow) -> Result<PipelineRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(PipelineRecord {
        id: PipelineId(row.try_get("id")?),
        kind: row.try_get("kind")?,
        status: PipelineStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("pipeline status '{status}'")))?,
        definition: row.try_get("definition")?,
        definition_hash: row.try_get("definition_hash")?,
        triggered_at: timestamp(row.try_get("triggered_at")?)?,
        started_at: optional_timestamp(row.try_get("started_at")?)?,
        last_advanced_at: optional_timestamp(row.try_get("last_advanced_at")?)?,
        claimed_for_advancing_at: optional_timestamp(row.try_get("claimed_for_advancing_at")?)?,
        completed_at: optional_timestamp(row.try_get("completed_at")?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<StepRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let transition: String = row.try_get("transition")?;
    let input: String = row.try_get("input")?;
    let output: Option<String> = row.try_get("output")?;
    let node_id: String = row.try_get("node_id")?;
    Ok(StepRecord {
        id: StepId(row.try_get("id")?),
        pipeline_id: PipelineId(row.try_get("pipeline_id")?),
        node_id: NodeId::from(node_id.as_str()),
        step_type: row.try_get("step_type")?,
        status: StepStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("step status '{status}'")))?,
        transition: Transition::parse(&transition)
            .ok_or_else(|| StoreError::Corrupt(format!("transition '{transition}'")))?,
        started_at: optional_timestamp(row.try_get("started_at")?)?,
        completed_at: optional_timestamp(row.try_get("completed_at")?)?,
        job_id: JobId(row.try_get("job_id")?),
        input: serde_json::from_str(&input)?,
        output: output.as_deref().map(serde_json::from_str).transpose()?,
    })
}

/// Insert a step with its job, first execution and availability.
async fn insert_step(
    conn: &mut SqliteConnection,
    pipeline: PipelineId,
    kind: &str,
    step: &NewStep,
    now: i64,
) -> Result<StepId, StoreError> {
    let step_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO flow_steps (pipeline_id, node_id, step_type, transition)
        VALUES (?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(pipeline.0)
    .bind(step.node_id.as_str())
    .bind(&step.step_type)
    .bind(step.transition.as_str())
    .fetch_one(&mut *conn)
    .await?;

    let job_id: i64 = sqlx::query_scalar(
        "INSERT INTO flow_jobs (step_id, step_type, input) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(step_id)
    .bind(&step.step_type)
    .bind(serde_json::to_string(&step.input)?)
    .fetch_one(&mut *conn)
    .await?;

    insert_execution(conn, JobId(job_id), kind, 0, now, now).await?;

    Ok(StepId(step_id))
}

/// Insert an execution and its availability, eligible from `eligible_at`.
async fn insert_execution(
    conn: &mut SqliteConnection,
    job: JobId,
    kind: &str,
    retry_count: u32,
    now: i64,
    eligible_at: i64,
) -> Result<ExecutionId, StoreError> {
    let execution_id: i64 = sqlx::query_scalar(
        "INSERT INTO flow_executions (job_id, retry_count, started_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(job.0)
    .bind(i64::from(retry_count))
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO flow_availabilities (execution_id, kind, eligible_at) VALUES (?, ?, ?)")
        .bind(execution_id)
        .bind(kind)
        .bind(eligible_at)
        .execute(&mut *conn)
        .await?;

    Ok(ExecutionId(execution_id))
}

async fn insert_result(
    conn: &mut SqliteConnection,
    execution: ExecutionId,
    result_type: ResultType,
    failure: Option<&JobFailure>,
    now: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO flow_results (execution_id, result_type, error_type, error_message, error_trace, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(execution.0)
    .bind(result_type.as_str())
    .bind(failure.map(|f| f.error_type.as_str()))
    .bind(failure.map(|f| f.error_message.as_str()))
    .bind(failure.and_then(|f| f.error_trace.as_deref()))
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SqliteStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run migrations.
    pub async fn from_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run migrations to create the orchestration tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn trigger(&self, pipeline: NewPipeline) -> Result<PipelineId, StoreError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO flow_pipelines (kind, definition, definition_hash, triggered_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&pipeline.kind)
        .bind(&pipeline.definition)
        .bind(&pipeline.definition_hash)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let start = NewStep {
            node_id: pipeline.start_node,
            step_type: pipeline.start_step_type,
            transition: Transition::Start,
            input: pipeline.input,
        };
        insert_step(&mut *tx, PipelineId(id), &pipeline.kind, &start, now).await?;

        tx.commit().await?;
        Ok(PipelineId(id))
    }

    async fn claim_job(
        &self,
        kind: &str,
        claimant: &ProcessIdentity,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let now = now_millis();

        let candidate: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT a.id FROM flow_availabilities a
            JOIN flow_executions e ON e.id = a.execution_id
            JOIN flow_jobs j ON j.id = e.job_id
            JOIN flow_steps s ON s.id = j.step_id
            JOIN flow_pipelines p ON p.id = s.pipeline_id
            WHERE a.kind = ? AND a.completed_at IS NULL AND a.eligible_at <= ?
              AND p.status IN ('pending', 'in_progress')
            ORDER BY a.id
            LIMIT 1
            "#,
        )
        .bind(kind)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(availability_id) = candidate else {
            return Ok(None);
        };

        let mut tx = self.pool.begin().await?;

        // Losing this race to another worker is the normal "no job" outcome.
        // Dropping the transaction rolls it back.
        let claimed = sqlx::query(
            r#"
            UPDATE flow_availabilities
            SET completed_at = ?, claimant_pid = ?, claimant_machine = ?
            WHERE id = ? AND completed_at IS NULL
            "#,
        )
        .bind(now)
        .bind(i64::from(claimant.pid))
        .bind(&claimant.machine_id)
        .bind(availability_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() != 1 {
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT e.id AS execution_id, e.retry_count, j.id AS job_id, j.input,
                   s.id AS step_id, s.step_type, p.id AS pipeline_id, p.kind
            FROM flow_availabilities a
            JOIN flow_executions e ON e.id = a.execution_id
            JOIN flow_jobs j ON j.id = e.job_id
            JOIN flow_steps s ON s.id = j.step_id
            JOIN flow_pipelines p ON p.id = s.pipeline_id
            WHERE a.id = ?
            "#,
        )
        .bind(availability_id)
        .fetch_one(&mut *tx)
        .await?;

        let input: String = row.try_get("input")?;
        let retry_count: i64 = row.try_get("retry_count")?;
        let job = ClaimedJob {
            availability_id: AvailabilityId(availability_id),
            execution_id: ExecutionId(row.try_get("execution_id")?),
            job_id: JobId(row.try_get("job_id")?),
            step_id: StepId(row.try_get("step_id")?),
            pipeline_id: PipelineId(row.try_get("pipeline_id")?),
            kind: row.try_get("kind")?,
            step_type: row.try_get("step_type")?,
            input: serde_json::from_str(&input)?,
            retry_count: u32::try_from(retry_count)
                .map_err(|_| StoreError::Corrupt(format!("retry count {retry_count}")))?,
        };

        sqlx::query(
            "UPDATE flow_steps SET status = 'in_progress', started_at = COALESCE(started_at, ?) WHERE id = ?",
        )
        .bind(now)
        .bind(job.step_id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE flow_pipelines
            SET status = 'in_progress', started_at = COALESCE(started_at, ?)
            WHERE id = ? AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(now)
        .bind(job.pipeline_id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE flow_jobs SET started_at = COALESCE(started_at, ?) WHERE id = ?")
            .bind(now)
            .bind(job.job_id.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE flow_executions SET started_at = ?, owner_pid = ?, owner_machine = ? WHERE id = ?",
        )
        .bind(now)
        .bind(i64::from(claimant.pid))
        .bind(&claimant.machine_id)
        .bind(job.execution_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    async fn record_success(
        &self,
        job: &ClaimedJob,
        output: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE flow_jobs SET output = ?, completed_at = ? WHERE id = ?")
            .bind(serde_json::to_string(output)?)
            .bind(now)
            .bind(job.job_id.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE flow_executions SET completed_at = ? WHERE id = ?")
            .bind(now)
            .bind(job.execution_id.0)
            .execute(&mut *tx)
            .await?;

        insert_result(&mut *tx, job.execution_id, ResultType::Success, None, now).await?;

        sqlx::query("UPDATE flow_steps SET status = 'advancing' WHERE id = ?")
            .bind(job.step_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        job: &ClaimedJob,
        failure: &JobFailure,
        disposition: &FailureDisposition,
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE flow_executions SET completed_at = ? WHERE id = ?")
            .bind(now)
            .bind(job.execution_id.0)
            .execute(&mut *tx)
            .await?;

        insert_result(&mut *tx, job.execution_id, ResultType::Failure, Some(failure), now).await?;

        match disposition {
            FailureDisposition::Retry { eligible_at } => {
                insert_execution(
                    &mut *tx,
                    job.job_id,
                    &job.kind,
                    job.retry_count + 1,
                    now,
                    eligible_at.timestamp_millis(),
                )
                .await?;

                sqlx::query("UPDATE flow_steps SET status = 'pending' WHERE id = ?")
                    .bind(job.step_id.0)
                    .execute(&mut *tx)
                    .await?;
            }
            FailureDisposition::Halt => {
                sqlx::query("UPDATE flow_jobs SET completed_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(job.job_id.0)
                    .execute(&mut *tx)
                    .await?;

                sqlx::query("UPDATE flow_steps SET status = 'failed', completed_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(job.step_id.0)
                    .execute(&mut *tx)
                    .await?;

                sqlx::query("UPDATE flow_pipelines SET status = 'halted', completed_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(job.pipeline_id.0)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn claim_pipeline(&self, lease: Duration) -> Result<Option<PipelineRecord>, StoreError> {
        let now = now_millis();
        let stale_before = now.saturating_sub(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));

        let candidate: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT p.id FROM flow_pipelines p
            WHERE p.status = 'in_progress'
              AND (p.claimed_for_advancing_at IS NULL OR p.claimed_for_advancing_at < ?)
              AND EXISTS (
                  SELECT 1 FROM flow_steps s
                  WHERE s.pipeline_id = p.id AND s.status = 'advancing'
              )
              AND NOT EXISTS (
                  SELECT 1 FROM flow_steps s
                  WHERE s.pipeline_id = p.id AND s.status NOT IN ('completed', 'advancing')
              )
            ORDER BY COALESCE(p.last_advanced_at, 0), p.id
            LIMIT 1
            "#,
        )
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let claimed = sqlx::query(
            r#"
            UPDATE flow_pipelines SET claimed_for_advancing_at = ?
            WHERE id = ? AND (claimed_for_advancing_at IS NULL OR claimed_for_advancing_at < ?)
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        if claimed.rows_affected() != 1 {
            return Ok(None);
        }

        self.pipeline(PipelineId(id)).await
    }

    async fn apply_advance(
        &self,
        pipeline: &PipelineRecord,
        plan: &AdvancePlan,
    ) -> Result<(), StoreError> {
        let claim_lost = || StoreError::ClaimLost {
            pipeline: pipeline.id,
        };
        let token = pipeline
            .claimed_for_advancing_at
            .map(|at| at.timestamp_millis())
            .ok_or_else(claim_lost)?;
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        // Writing first takes the database write lock, so no takeover can
        // land between this check and the commit. Dropping the transaction on
        // any early return rolls the pass back.
        let kind: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE flow_pipelines SET claimed_for_advancing_at = claimed_for_advancing_at
            WHERE id = ? AND claimed_for_advancing_at = ?
            RETURNING kind
            "#,
        )
        .bind(pipeline.id.0)
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?;
        let kind = kind.ok_or_else(claim_lost)?;

        let mut completed = 0;
        for step in &plan.completed {
            completed += sqlx::query(
                "UPDATE flow_steps SET status = 'completed', completed_at = ? WHERE id = ? AND status = 'advancing'",
            )
            .bind(now)
            .bind(step.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        if usize::try_from(completed).ok() != Some(plan.completed.len()) {
            return Err(claim_lost());
        }

        for step in &plan.spawn {
            insert_step(&mut *tx, pipeline.id, &kind, step, now).await?;
        }

        let terminal = match plan.outcome {
            PlanOutcome::Continue => None,
            PlanOutcome::Complete => Some(PipelineStatus::Completed),
            PlanOutcome::Halt(_) => Some(PipelineStatus::Halted),
        };
        if let Some(status) = terminal {
            sqlx::query("UPDATE flow_pipelines SET status = ?, completed_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(now)
                .bind(pipeline.id.0)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn release_pipeline(&self, pipeline: PipelineId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE flow_pipelines SET claimed_for_advancing_at = NULL, last_advanced_at = ? WHERE id = ?",
        )
        .bind(now_millis())
        .bind(pipeline.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tuple(
        &self,
        pipeline: PipelineId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM flow_tuples WHERE pipeline_id = ? AND key = ?")
                .bind(pipeline.0)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.as_deref().map(serde_json::from_str).transpose()?)
    }

    async fn set_tuple(
        &self,
        pipeline: PipelineId,
        key: &str,
        value: serde_json::Value,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let conflict = if overwrite {
            "DO UPDATE SET value = excluded.value, last_set_at = excluded.last_set_at"
        } else {
            "DO NOTHING"
        };
        let sql = format!(
            "INSERT INTO flow_tuples (pipeline_id, key, value, first_set_at, last_set_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT (pipeline_id, key) {conflict}"
        );

        let result = sqlx::query(&sql)
            .bind(pipeline.0)
            .bind(key)
            .bind(serde_json::to_string(&value)?)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TupleExists {
                pipeline,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn beat(&self, process: &ProcessIdentity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flow_heartbeats (pid, machine_id, last_heartbeat_at) VALUES (?, ?, ?)
            ON CONFLICT (pid, machine_id) DO UPDATE SET last_heartbeat_at = excluded.last_heartbeat_at
            "#,
        )
        .bind(i64::from(process.pid))
        .bind(&process.machine_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        process: &ProcessIdentity,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let beat: Option<i64> = sqlx::query_scalar(
            "SELECT last_heartbeat_at FROM flow_heartbeats WHERE pid = ? AND machine_id = ?",
        )
        .bind(i64::from(process.pid))
        .bind(&process.machine_id)
        .fetch_optional(&self.pool)
        .await?;

        optional_timestamp(beat)
    }

    async fn remove_heartbeat(&self, process: &ProcessIdentity) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM flow_heartbeats WHERE pid = ? AND machine_id = ?")
            .bind(i64::from(process.pid))
            .bind(&process.machine_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_claims(&self, process: &ProcessIdentity) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT a.id AS availability_id, j.step_id
            FROM flow_availabilities a
            JOIN flow_executions e ON e.id = a.execution_id
            JOIN flow_jobs j ON j.id = e.job_id
            WHERE a.claimant_pid = ? AND a.claimant_machine = ?
              AND a.completed_at IS NOT NULL AND e.completed_at IS NULL
            "#,
        )
        .bind(i64::from(process.pid))
        .bind(&process.machine_id)
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            let availability_id: i64 = row.try_get("availability_id")?;
            let step_id: i64 = row.try_get("step_id")?;

            sqlx::query(
                r#"
                UPDATE flow_availabilities
                SET completed_at = NULL, claimant_pid = NULL, claimant_machine = NULL
                WHERE id = ?
                "#,
            )
            .bind(availability_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE flow_steps SET status = 'pending' WHERE id = ? AND status = 'in_progress'")
                .bind(step_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(rows.len())
    }

    async fn pipeline(&self, id: PipelineId) -> Result<Option<PipelineRecord>, StoreError> {
        let sql = format!("SELECT {PIPELINE_COLUMNS} FROM flow_pipelines WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(pipeline_from_row).transpose()
    }

    async fn steps(&self, pipeline: PipelineId) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.pipeline_id, s.node_id, s.step_type, s.status, s.transition,
                   s.started_at, s.completed_at, j.id AS job_id, j.input, j.output
            FROM flow_steps s
            JOIN flow_jobs j ON j.step_id = s.id
            WHERE s.pipeline_id = ?
            ORDER BY s.id
            "#,
        )
        .bind(pipeline.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    async fn executions(&self, step: StepId) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.job_id, e.started_at, e.completed_at, e.retry_count,
                   e.owner_pid, e.owner_machine
            FROM flow_executions e
            JOIN flow_jobs j ON j.id = e.job_id
            WHERE j.step_id = ?
            ORDER BY e.id
            "#,
        )
        .bind(step.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ExecutionRecord, StoreError> {
                let retry_count: i64 = row.try_get("retry_count")?;
                let owner_pid: Option<i64> = row.try_get("owner_pid")?;
                let owner_machine: Option<String> = row.try_get("owner_machine")?;
                let owner = match (owner_pid, owner_machine) {
                    (Some(pid), Some(machine)) => u32::try_from(pid)
                        .ok()
                        .map(|pid| ProcessIdentity::new(pid, machine)),
                    _ => None,
                };
                Ok(ExecutionRecord {
                    id: ExecutionId(row.try_get("id")?),
                    job_id: JobId(row.try_get("job_id")?),
                    started_at: timestamp(row.try_get("started_at")?)?,
                    completed_at: optional_timestamp(row.try_get("completed_at")?)?,
                    retry_count: u32::try_from(retry_count)
                        .map_err(|_| StoreError::Corrupt(format!("retry count {retry_count}")))?,
                    owner,
                })
            })
            .collect()
    }

    async fn results(&self, step: StepId) -> Result<Vec<ResultRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.execution_id, r.result_type, r.error_type, r.error_message, r.error_trace
            FROM flow_results r
            JOIN flow_executions e ON e.id = r.execution_id
            JOIN flow_jobs j ON j.id = e.job_id
            WHERE j.step_id = ?
            ORDER BY r.id
            "#,
        )
        .bind(step.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ResultRecord, StoreError> {
                let result_type: String = row.try_get("result_type")?;
                Ok(ResultRecord {
                    execution_id: ExecutionId(row.try_get("execution_id")?),
                    result_type: ResultType::parse(&result_type)
                        .ok_or_else(|| StoreError::Corrupt(format!("result type '{result_type}'")))?,
                    error_type: row.try_get("error_type")?,
                    error_message: row.try_get("error_message")?,
                    error_trace: row.try_get("error_trace")?,
                })
            })
            .collect()
    }

    async fn list_pipelines(
        &self,
        filter: &PipelineFilter,
    ) -> Result<Vec<PipelineRecord>, StoreError> {
        let sql = format!(
            "SELECT {PIPELINE_COLUMNS} FROM flow_pipelines \
             WHERE (? IS NULL OR kind = ?) AND (? IS NULL OR status = ?) \
             ORDER BY id DESC LIMIT ? OFFSET ?"
        );
        let status = filter.status.map(|s| s.as_str());
        let rows = sqlx::query(&sql)
            .bind(filter.kind.as_deref())
            .bind(filter.kind.as_deref())
            .bind(status)
            .bind(status)
            .bind(i64::from(filter.limit))
            .bind(i64::from(filter.offset))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(pipeline_from_row).collect()
    }
}
