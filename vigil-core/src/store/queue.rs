use sqlx::PgPool;

use crate::domain::{PendingScan, QueueEntry, QueueStatus};
use crate::error::{Result, VigilError};

#[derive(Clone, Debug)]
pub struct QueueStore {
    pool: PgPool,
}

impl QueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new `queued` entry for the repository. The partial unique
    /// index on `(repository_id) WHERE status IN ('queued','processing')`
    /// makes this a single atomic statement: a second live entry is
    /// rejected by Postgres and surfaces as `AlreadyQueued`.
    pub async fn enqueue(&self, repository_id: i64, priority: i32) -> Result<i64> {
        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO scan_queue (repository_id, priority, status)
            VALUES ($1, $2, 'queued')
            RETURNING id
            "#,
        )
        .bind(repository_id)
        .bind(priority)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(id) => Ok(id),
            Err(e) => {
                let err = VigilError::from(e);
                if err.is_unique_violation() {
                    Err(VigilError::AlreadyQueued(repository_id))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// True when the repository has an entry in `queued` or `processing`.
    pub async fn has_active(&self, repository_id: i64) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM scan_queue
            WHERE repository_id = $1 AND status IN ('queued', 'processing')
            LIMIT 1
            "#,
        )
        .bind(repository_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    /// Select up to `limit` queued entries in dispatch order. Read-only;
    /// the claim completes when the caller marks the entry `processing`.
    pub async fn claim_queued(&self, limit: i64) -> Result<Vec<PendingScan>> {
        let pending = sqlx::query_as::<_, PendingScan>(
            r#"
            SELECT sq.id AS queue_id, sq.repository_id, r.url, r.owner, r.name
            FROM scan_queue sq
            JOIN repositories r ON r.id = sq.repository_id
            WHERE sq.status = 'queued'
            ORDER BY sq.priority DESC, sq.queued_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(pending)
    }

    /// Transition `queued → processing`, stamping `started_at` and the
    /// cluster job name. Calling again with the same job name is a no-op,
    /// so the dispatcher and the scan job can both take this path.
    pub async fn mark_processing(&self, queue_id: i64, job_name: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE scan_queue
            SET status = 'processing', started_at = NOW(), job_name = $2
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(queue_id)
        .bind(job_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }

        let current = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT status, job_name FROM scan_queue WHERE id = $1",
        )
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;

        match current {
            Some((status, existing))
                if status == "processing" && existing.as_deref() == Some(job_name) =>
            {
                Ok(())
            }
            Some((status, _)) => Err(VigilError::InvalidTransition(
                queue_id,
                format!("cannot transition from '{}' to 'processing'", status),
            )),
            None => Err(VigilError::InvalidTransition(
                queue_id,
                "entry not found".to_string(),
            )),
        }
    }

    /// Terminate an entry as `completed` or `failed`. Failures also bump
    /// the attempt counter; re-enqueueing a failed entry stays an operator
    /// action because the deterministic job name would collide with the
    /// terminal cluster job until its TTL expires.
    pub async fn mark_terminal(
        &self,
        queue_id: i64,
        status: QueueStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(VigilError::InvalidTransition(
                queue_id,
                format!("'{}' is not a terminal status", status.as_str()),
            ));
        }

        sqlx::query(
            r#"
            UPDATE scan_queue
            SET status = $2,
                completed_at = NOW(),
                error_message = $3,
                attempts = attempts + CASE WHEN $2 = 'failed' THEN 1 ELSE 0 END
            WHERE id = $1
            "#,
        )
        .bind(queue_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Locate the live entry for a repository, preferring one the
    /// dispatcher already moved to `processing` over a `queued` one.
    pub async fn find_for_repository(&self, repository_id: i64) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM scan_queue
            WHERE repository_id = $1 AND status IN ('processing', 'queued')
            ORDER BY
                CASE status WHEN 'processing' THEN 1 ELSE 2 END,
                priority DESC, queued_at ASC
            LIMIT 1
            "#,
        )
        .bind(repository_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get(&self, queue_id: i64) -> Result<Option<QueueEntry>> {
        let entry = sqlx::query_as::<_, QueueEntry>(
            r#"
            SELECT id, repository_id, priority, status, attempts, max_attempts,
                   error_message, job_name, queued_at, started_at, completed_at
            FROM scan_queue
            WHERE id = $1
            "#,
        )
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }
}
