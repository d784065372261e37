use sqlx::PgPool;

use crate::domain::{DeduplicatedFinding, FindingStatus, NewFinding, SafeFile};
use crate::error::Result;

#[derive(Clone, Debug)]
pub struct FindingStore {
    pool: PgPool,
}

impl FindingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the branch on first sight; subsequent scans refresh
    /// `last_scanned_at`.
    pub async fn upsert_branch(&self, repository_id: i64, name: &str) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO branches (repository_id, name)
            VALUES ($1, $2)
            ON CONFLICT (repository_id, name) DO UPDATE
            SET last_scanned_at = NOW()
            RETURNING id
            "#,
        )
        .bind(repository_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Plain insert; callers consult `is_file_safe` first.
    pub async fn insert(&self, finding: &NewFinding) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO vulnerabilities
                (repository_id, branch_id, file_path, file_hash,
                 vulnerability_type, severity, title, description, line_number,
                 code_snippet, recommendation, cwe_id, cvss_score)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            "#,
        )
        .bind(finding.repository_id)
        .bind(finding.branch_id)
        .bind(&finding.file_path)
        .bind(&finding.file_hash)
        .bind(&finding.vulnerability_type)
        .bind(finding.severity.as_str())
        .bind(&finding.title)
        .bind(&finding.description)
        .bind(finding.line_number)
        .bind(&finding.code_snippet)
        .bind(&finding.recommendation)
        .bind(&finding.cwe_id)
        .bind(finding.cvss_score)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// True when any allow-list row matches the path, either content-wide
    /// (NULL hash) or for this exact content.
    pub async fn is_file_safe(&self, file_path: &str, file_hash: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM safe_files
            WHERE file_path = $1
              AND (file_hash IS NULL OR file_hash = $2)
            LIMIT 1
            "#,
        )
        .bind(file_path)
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    /// Insert or refresh an allow-list row. On conflict the reason and
    /// marker are replaced and `marked_at` is bumped.
    pub async fn upsert_safe_file(
        &self,
        file_path: &str,
        file_hash: Option<&str>,
        reason: Option<&str>,
        marked_by: Option<&str>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO safe_files (file_path, file_hash, reason, marked_by)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (file_path, file_hash) DO UPDATE
            SET reason = EXCLUDED.reason,
                marked_by = EXCLUDED.marked_by,
                marked_at = NOW()
            RETURNING id
            "#,
        )
        .bind(file_path)
        .bind(file_hash)
        .bind(reason)
        .bind(marked_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn list_safe_files(&self) -> Result<Vec<SafeFile>> {
        let rows = sqlx::query_as::<_, SafeFile>(
            r#"
            SELECT id, file_path, file_hash, reason, marked_by, marked_at
            FROM safe_files
            ORDER BY marked_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn delete_safe_file(&self, id: i64) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM safe_files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }

    /// Retroactively close open findings for a file that was marked safe.
    /// Returns the number of rows flipped to `ignored`.
    pub async fn bulk_ignore_by_file(
        &self,
        file_path: &str,
        file_hash: Option<&str>,
        marker: &str,
    ) -> Result<u64> {
        let note = format!("File marked as safe by {}", marker);

        let flipped = sqlx::query(
            r#"
            UPDATE vulnerabilities
            SET status = $5,
                manual_analysis = COALESCE(manual_analysis || E'\n', '') || $4,
                analyzed_by = $3,
                analyzed_at = NOW(),
                updated_at = NOW()
            WHERE file_path = $1
              AND ($2::text IS NULL OR file_hash = $2)
              AND status = $6
            "#,
        )
        .bind(file_path)
        .bind(file_hash)
        .bind(marker)
        .bind(&note)
        .bind(FindingStatus::Ignored.as_str())
        .bind(FindingStatus::Open.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(flipped)
    }

    /// Read-time grouping that collapses the same issue found on several
    /// branches into one row with the branch names aggregated. Most severe
    /// first, newest detection breaking ties.
    pub async fn deduplicated(
        &self,
        repository_id: Option<i64>,
    ) -> Result<Vec<DeduplicatedFinding>> {
        let rows = sqlx::query_as::<_, DeduplicatedFinding>(
            r#"
            SELECT v.repository_id,
                   v.file_path,
                   v.file_hash,
                   v.vulnerability_type,
                   v.line_number,
                   (ARRAY_AGG(v.severity ORDER BY v.detected_at DESC))[1] AS severity,
                   (ARRAY_AGG(v.title ORDER BY v.detected_at DESC))[1] AS title,
                   COALESCE(
                       ARRAY_AGG(DISTINCT b.name) FILTER (WHERE b.name IS NOT NULL),
                       ARRAY[]::text[]
                   ) AS branches,
                   COUNT(DISTINCT b.name) AS branch_count,
                   MAX(v.detected_at) AS last_detected_at
            FROM vulnerabilities v
            LEFT JOIN branches b ON b.id = v.branch_id
            WHERE ($1::bigint IS NULL OR v.repository_id = $1)
            GROUP BY v.repository_id, v.file_path, v.file_hash,
                     v.vulnerability_type, v.line_number
            ORDER BY
                MIN(CASE v.severity
                    WHEN 'critical' THEN 1
                    WHEN 'high' THEN 2
                    WHEN 'medium' THEN 3
                    WHEN 'low' THEN 4
                    ELSE 5
                END),
                MAX(v.detected_at) DESC
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
