//! Postgres-backed job record store.
//!
//! One row per job in `agent_jobs`. The guarded write is a single
//! `UPDATE ... WHERE job_id = $1 AND version = $2 RETURNING ...`; no
//! transaction ever spans more than that one statement.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | Duplicate `create` |
//! | Database (check constraint violation) | `23514` | `Corrupt` | Invalid status/kind text |
//! | Database (other) | Any other | `Unavailable` | Other database errors |
//! | PoolClosed | N/A | `Unavailable` | Connection pool was closed |
//! | Other | N/A | `Unavailable` | Network errors, connection failures, etc. |
//!
//! A guarded update that matches no row is disambiguated with a follow-up read:
//! missing row is `NotFound`, otherwise `VersionConflict` with the found version.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use agentjobs_core::{JobId, Version, WorkerId};

use super::r#trait::{JobRecordStore, StoreError};
use crate::types::{ErrorKind, Job, JobStatus, JobType, LastError};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS agent_jobs (
        job_id UUID PRIMARY KEY,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL
            CHECK (status IN ('queued', 'running', 'completed', 'failed', 'cancelled')),
        payload JSONB NOT NULL,
        due_at TIMESTAMPTZ NOT NULL,
        attempt BIGINT NOT NULL CHECK (attempt >= 0),
        max_attempts BIGINT,
        lease_owner UUID,
        lease_expires_at TIMESTAMPTZ,
        checkpoint_seq BIGINT NOT NULL CHECK (checkpoint_seq >= 0),
        checkpoint_data JSONB,
        last_error_kind TEXT,
        last_error_message TEXT,
        last_error_at TIMESTAMPTZ,
        cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
        scope TEXT,
        version BIGINT NOT NULL CHECK (version > 0),
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS agent_jobs_due_idx
        ON agent_jobs (status, due_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS agent_jobs_scope_idx
        ON agent_jobs (scope, created_at)
        WHERE scope IS NOT NULL
    "#,
];

const COLUMNS: &str = r#"
    job_id, job_type, status, payload, due_at, attempt, max_attempts,
    lease_owner, lease_expires_at, checkpoint_seq, checkpoint_data,
    last_error_kind, last_error_message, last_error_at,
    cancel_requested, scope, version, created_at, updated_at
"#;

/// Postgres-backed job record store.
///
/// `Send + Sync`; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn current_version(&self, job_id: JobId) -> Result<Option<Version>, StoreError> {
        let row = sqlx::query("SELECT version FROM agent_jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_version", e))?;

        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| StoreError::Corrupt(format!("failed to read version: {e}")))?;
                let version = u64::try_from(version)
                    .map_err(|_| StoreError::Corrupt(format!("negative version {version}")))?;
                Ok(Some(Version::new(version)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobRecordStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, mut job: Job) -> Result<Job, StoreError> {
        job.version = Version::INITIAL;
        let (kind, message, at) = split_last_error(&job.last_error);
        let checkpoint_seq = to_bigint("checkpoint_seq", job.checkpoint_seq)?;
        let version = to_bigint("version", job.version.get())?;

        let sql = format!(
            "INSERT INTO agent_jobs ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        );
        sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.job_type.as_str())
            .bind(job.status.as_str())
            .bind(&job.payload)
            .bind(job.due_at)
            .bind(i64::from(job.attempt))
            .bind(job.max_attempts.map(i64::from))
            .bind(job.lease_owner.map(uuid::Uuid::from))
            .bind(job.lease_expires_at)
            .bind(checkpoint_seq)
            .bind(&job.checkpoint_data)
            .bind(kind)
            .bind(message)
            .bind(at)
            .bind(job.cancel_requested)
            .bind(&job.scope)
            .bind(version)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::AlreadyExists(job.id)
                } else {
                    map_sqlx_error("create", e)
                }
            })?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM agent_jobs WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM agent_jobs \
             WHERE (status = 'queued' AND due_at <= $1) \
                OR (status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at < $1)) \
             ORDER BY due_at ASC, job_id ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_due", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_by_scope(&self, scope: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM agent_jobs \
             WHERE scope = $1 \
             ORDER BY created_at ASC, job_id ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(scope)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_scope", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, next), fields(job_id = %job_id, expected = %expected), err)]
    async fn conditional_update(
        &self,
        job_id: JobId,
        expected: Version,
        next: Job,
    ) -> Result<Job, StoreError> {
        if next.id != job_id {
            return Err(StoreError::Corrupt(format!(
                "update for {job_id} carries record {}",
                next.id
            )));
        }

        let (kind, message, at) = split_last_error(&next.last_error);
        let expected_version = to_bigint("version", expected.get())?;
        let checkpoint_seq = to_bigint("checkpoint_seq", next.checkpoint_seq)?;
        let sql = format!(
            "UPDATE agent_jobs SET \
                status = $3, due_at = $4, attempt = $5, max_attempts = $6, \
                lease_owner = $7, lease_expires_at = $8, \
                checkpoint_seq = $9, checkpoint_data = $10, \
                last_error_kind = $11, last_error_message = $12, last_error_at = $13, \
                cancel_requested = $14, scope = $15, updated_at = $16, \
                version = version + 1 \
             WHERE job_id = $1 AND version = $2 \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(expected_version)
            .bind(next.status.as_str())
            .bind(next.due_at)
            .bind(i64::from(next.attempt))
            .bind(next.max_attempts.map(i64::from))
            .bind(next.lease_owner.map(uuid::Uuid::from))
            .bind(next.lease_expires_at)
            .bind(checkpoint_seq)
            .bind(&next.checkpoint_data)
            .bind(kind)
            .bind(message)
            .bind(at)
            .bind(next.cancel_requested)
            .bind(&next.scope)
            .bind(next.updated_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("conditional_update", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.current_version(job_id).await? {
                Some(found) => Err(StoreError::VersionConflict {
                    job_id,
                    expected,
                    found,
                }),
                None => Err(StoreError::NotFound(job_id)),
            },
        }
    }
}

fn split_last_error(
    last_error: &Option<LastError>,
) -> (Option<&'static str>, Option<String>, Option<DateTime<Utc>>) {
    match last_error {
        Some(e) => (
            Some(e.kind.as_str()),
            Some(e.message.clone()),
            Some(e.occurred_at),
        ),
        None => (None, None, None),
    }
}

/// Counters are `BIGINT`; values past `i64::MAX` are refused, never wrapped.
fn to_bigint(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{column} {value} does not fit in BIGINT")))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    read_job(row).map_err(|e| StoreError::Corrupt(format!("failed to deserialize job row: {e}")))
}

fn read_job(row: &sqlx::postgres::PgRow) -> Result<Job, Box<dyn std::error::Error + Send + Sync>> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    let attempt: i64 = row.try_get("attempt")?;
    let max_attempts: Option<i64> = row.try_get("max_attempts")?;
    let lease_owner: Option<uuid::Uuid> = row.try_get("lease_owner")?;
    let checkpoint_seq: i64 = row.try_get("checkpoint_seq")?;
    let version: i64 = row.try_get("version")?;

    let kind: Option<String> = row.try_get("last_error_kind")?;
    let message: Option<String> = row.try_get("last_error_message")?;
    let at: Option<DateTime<Utc>> = row.try_get("last_error_at")?;
    let last_error = match (kind, at) {
        (Some(kind), Some(at)) => Some(LastError::new(
            kind.parse::<ErrorKind>()?,
            message.unwrap_or_default(),
            at,
        )),
        _ => None,
    };

    let job_id: uuid::Uuid = row.try_get("job_id")?;

    Ok(Job {
        id: JobId::from_uuid(job_id),
        job_type: job_type.parse::<JobType>()?,
        status: status.parse::<JobStatus>()?,
        payload: row.try_get("payload")?,
        due_at: row.try_get("due_at")?,
        attempt: u32::try_from(attempt)?,
        max_attempts: max_attempts.map(u32::try_from).transpose()?,
        lease_owner: lease_owner.map(WorkerId::from_uuid),
        lease_expires_at: row.try_get("lease_expires_at")?,
        checkpoint_seq: u64::try_from(checkpoint_seq)?,
        checkpoint_data: row.try_get("checkpoint_data")?,
        last_error,
        cancel_requested: row.try_get("cancel_requested")?,
        scope: row.try_get("scope")?,
        version: Version::new(u64::try_from(version)?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
