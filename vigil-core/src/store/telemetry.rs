use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::ScanAttempt;
use crate::error::Result;

#[derive(Clone, Debug)]
pub struct TelemetryStore {
    pool: PgPool,
}

impl TelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append-only rate limit sample, one per API class per observation.
    pub async fn append_rate_limit_sample(
        &self,
        api_type: &str,
        limit: i32,
        remaining: i32,
        reset_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (api_type, limit_value, remaining, reset_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(api_type)
        .bind(limit)
        .bind(remaining)
        .bind(reset_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record one scan attempt. `started_at` is back-dated by the measured
    /// duration so the row brackets the actual work.
    pub async fn record_scan_history(&self, attempt: &ScanAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_history
                (repository_id, scan_queue_id, status, vulnerabilities_found,
                 duration_seconds, error_message, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6,
                    NOW() - ($7::bigint) * INTERVAL '1 second', NOW())
            "#,
        )
        .bind(attempt.repository_id)
        .bind(attempt.scan_queue_id)
        .bind(attempt.status.as_str())
        .bind(attempt.vulnerabilities_found)
        .bind(attempt.duration_seconds as i32)
        .bind(&attempt.error_message)
        .bind(attempt.duration_seconds)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
