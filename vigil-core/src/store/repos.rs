use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::{Repository, ScanStatus};
use crate::error::Result;

#[derive(Clone, Debug)]
pub struct RepoStore {
    pool: PgPool,
}

impl RepoStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update a repository keyed by `(owner, name)`. On conflict
    /// only the URL is replaced; the returned id is stable across calls.
    pub async fn upsert(
        &self,
        url: &str,
        owner: &str,
        name: &str,
        has_actions: bool,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO repositories (url, owner, name, has_actions)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (owner, name) DO UPDATE
            SET url = EXCLUDED.url, updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(url)
        .bind(owner)
        .bind(name)
        .bind(has_actions)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Repository>> {
        let repo = sqlx::query_as::<_, Repository>(
            r#"
            SELECT id, url, owner, name, has_actions, scan_status, scan_error,
                   first_scanned_at, last_scanned_at
            FROM repositories
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(repo)
    }

    pub async fn last_scanned_at(&self, id: i64) -> Result<Option<DateTime<Utc>>> {
        let stamp = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT last_scanned_at FROM repositories WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stamp.flatten())
    }

    /// Mark the start of a scan: status `scanning`, scan timestamps refreshed.
    pub async fn begin_scan(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repositories
            SET scan_status = $2,
                last_scanned_at = NOW(),
                first_scanned_at = COALESCE(first_scanned_at, NOW()),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(ScanStatus::Scanning.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn finish_scan(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repositories
            SET scan_status = $2, scan_error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(ScanStatus::Completed.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn fail_scan(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repositories
            SET scan_status = $2, scan_error = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(ScanStatus::Failed.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
