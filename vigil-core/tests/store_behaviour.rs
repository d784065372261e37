//! Behavioural tests for the Postgres store: the invariants the control
//! plane relies on under concurrency.

use anyhow::Result;
use sqlx::PgPool;

use vigil_core::domain::{NewFinding, QueueStatus, ScanAttempt, Severity};
use vigil_core::error::VigilError;
use vigil_core::store::Store;

async fn seed_repository(store: &Store, owner: &str, name: &str) -> Result<i64> {
    let url = format!("https://github.com/{}/{}", owner, name);
    let id = store.repositories().upsert(&url, owner, name, true).await?;
    Ok(id)
}

fn finding(repository_id: i64, branch_id: i64, line: i32) -> NewFinding {
    NewFinding {
        repository_id,
        branch_id: Some(branch_id),
        file_path: ".github/workflows/ci.yml".to_string(),
        file_hash: "abc123".to_string(),
        vulnerability_type: "expression-injection".to_string(),
        severity: Severity::Critical,
        title: "Expression injection".to_string(),
        description: "Expression injection, \"github.head_ref\" is potentially untrusted."
            .to_string(),
        line_number: Some(line),
        code_snippet: Some("  ref: ${{ github.head_ref }}".to_string()),
        recommendation: "Sanitize untrusted input before use in expressions.".to_string(),
        cwe_id: None,
        cvss_score: None,
    }
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn repository_upsert_returns_a_stable_id(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool);

    let first = store
        .repositories()
        .upsert("https://github.com/acme/tool", "acme", "tool", true)
        .await?;
    let second = store
        .repositories()
        .upsert("https://example.org/mirror/tool", "acme", "tool", false)
        .await?;

    assert_eq!(first, second);

    // On conflict only the URL is replaced.
    let repo = store.repositories().get(first).await?.expect("repo exists");
    assert_eq!(repo.url, "https://example.org/mirror/tool");
    assert!(repo.has_actions);

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn concurrent_upserts_resolve_to_one_repository(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool.clone());

    let attempts: Vec<_> = (0..20)
        .map(|_| {
            store
                .repositories()
                .upsert("https://github.com/acme/tool", "acme", "tool", true)
        })
        .collect();
    let ids = futures::future::join_all(attempts).await;

    let first = *ids[0].as_ref().expect("upsert succeeds");
    for id in &ids {
        assert_eq!(*id.as_ref().expect("upsert succeeds"), first);
    }

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repositories")
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 1);

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn concurrent_enqueues_admit_exactly_one(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool);
    let repo_id = seed_repository(&store, "acme", "tool").await?;

    let attempts: Vec<_> = (0..100)
        .map(|i| store.queue().enqueue(repo_id, i))
        .collect();
    let results = futures::future::join_all(attempts).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);

    for rejected in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            rejected,
            Err(VigilError::AlreadyQueued(id)) if *id == repo_id
        ));
    }

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn terminal_entries_free_the_repository_for_re_enqueue(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool);
    let repo_id = seed_repository(&store, "acme", "tool").await?;

    let first = store.queue().enqueue(repo_id, 10).await?;
    assert!(matches!(
        store.queue().enqueue(repo_id, 10).await,
        Err(VigilError::AlreadyQueued(_))
    ));

    store.queue().mark_processing(first, "scan-acme-tool-1").await?;
    assert!(matches!(
        store.queue().enqueue(repo_id, 10).await,
        Err(VigilError::AlreadyQueued(_))
    ));

    store
        .queue()
        .mark_terminal(first, QueueStatus::Completed, None)
        .await?;

    let second = store.queue().enqueue(repo_id, 5).await?;
    assert_ne!(first, second);

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn mark_processing_is_idempotent_per_job_name(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool);
    let repo_id = seed_repository(&store, "acme", "tool").await?;
    let queue_id = store.queue().enqueue(repo_id, 10).await?;

    let job_name = format!("scan-acme-tool-{}", queue_id);
    store.queue().mark_processing(queue_id, &job_name).await?;

    let entry = store.queue().get(queue_id).await?.expect("entry exists");
    assert_eq!(entry.status, "processing");
    assert_eq!(entry.job_name.as_deref(), Some(job_name.as_str()));
    let started_at = entry.started_at.expect("started_at set");
    assert!(started_at >= entry.queued_at);

    // Second claim under the same job identity is a no-op.
    store.queue().mark_processing(queue_id, &job_name).await?;

    // A different job identity is a conflicting writer.
    assert!(matches!(
        store.queue().mark_processing(queue_id, "scan-other-9").await,
        Err(VigilError::InvalidTransition(_, _))
    ));

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn claim_orders_by_priority_then_age(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool.clone());

    let low_new = seed_repository(&store, "acme", "low-new").await?;
    let high = seed_repository(&store, "acme", "high").await?;
    let low_old = seed_repository(&store, "acme", "low-old").await?;

    store.queue().enqueue(low_new, 5).await?;
    store.queue().enqueue(high, 10).await?;
    store.queue().enqueue(low_old, 5).await?;

    sqlx::query(
        "UPDATE scan_queue SET queued_at = NOW() - INTERVAL '1 hour' WHERE repository_id = $1",
    )
    .bind(low_old)
    .execute(&pool)
    .await?;

    let claimed = store.queue().claim_queued(10).await?;
    let order: Vec<i64> = claimed.iter().map(|scan| scan.repository_id).collect();
    assert_eq!(order, vec![high, low_old, low_new]);

    // Claiming is read-only; nothing transitioned.
    assert_eq!(store.queue().claim_queued(10).await?.len(), 3);

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn find_for_repository_prefers_the_claimed_entry(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool);
    let repo_id = seed_repository(&store, "acme", "tool").await?;

    assert_eq!(store.queue().find_for_repository(repo_id).await?, None);

    let queue_id = store.queue().enqueue(repo_id, 10).await?;
    assert_eq!(store.queue().find_for_repository(repo_id).await?, Some(queue_id));

    store
        .queue()
        .mark_processing(queue_id, "scan-acme-tool-1")
        .await?;
    assert_eq!(store.queue().find_for_repository(repo_id).await?, Some(queue_id));

    store
        .queue()
        .mark_terminal(queue_id, QueueStatus::Failed, Some("boom"))
        .await?;
    assert_eq!(store.queue().find_for_repository(repo_id).await?, None);

    let entry = store.queue().get(queue_id).await?.expect("entry exists");
    assert_eq!(entry.status, "failed");
    assert_eq!(entry.attempts, 1);
    assert!(entry.completed_at.expect("completed_at set") >= entry.queued_at);

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn path_wide_safe_files_match_any_hash(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool);

    store
        .findings()
        .upsert_safe_file(".github/workflows/ci.yml", None, Some("approved"), Some("alice"))
        .await?;

    assert!(
        store
            .findings()
            .is_file_safe(".github/workflows/ci.yml", "any-hash-at-all")
            .await?
    );
    assert!(
        store
            .findings()
            .is_file_safe(".github/workflows/ci.yml", "")
            .await?
    );
    assert!(
        !store
            .findings()
            .is_file_safe(".github/workflows/release.yml", "any-hash-at-all")
            .await?
    );

    store
        .findings()
        .upsert_safe_file(".github/workflows/release.yml", Some("deadbeef"), None, None)
        .await?;

    assert!(
        store
            .findings()
            .is_file_safe(".github/workflows/release.yml", "deadbeef")
            .await?
    );
    assert!(
        !store
            .findings()
            .is_file_safe(".github/workflows/release.yml", "cafebabe")
            .await?
    );

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn safe_file_upsert_replaces_the_marker(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool);

    let first = store
        .findings()
        .upsert_safe_file(".github/workflows/ci.yml", None, Some("looks fine"), Some("alice"))
        .await?;
    let second = store
        .findings()
        .upsert_safe_file(".github/workflows/ci.yml", None, Some("re-reviewed"), Some("bob"))
        .await?;

    assert_eq!(first, second);

    let listed = store.findings().list_safe_files().await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].reason.as_deref(), Some("re-reviewed"));
    assert_eq!(listed[0].marked_by.as_deref(), Some("bob"));

    assert!(store.findings().delete_safe_file(first).await?);
    assert!(store.findings().list_safe_files().await?.is_empty());

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn bulk_ignore_flips_matching_open_findings(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool.clone());
    let repo_id = seed_repository(&store, "acme", "tool").await?;
    let branch_id = store.findings().upsert_branch(repo_id, "main").await?;

    store.findings().insert(&finding(repo_id, branch_id, 14)).await?;
    store.findings().insert(&finding(repo_id, branch_id, 30)).await?;

    let mut other = finding(repo_id, branch_id, 14);
    other.file_hash = "different".to_string();
    store.findings().insert(&other).await?;

    let flipped = store
        .findings()
        .bulk_ignore_by_file(".github/workflows/ci.yml", Some("abc123"), "alice")
        .await?;
    assert_eq!(flipped, 2);

    let statuses: Vec<(String, String)> = sqlx::query_as(
        "SELECT status, file_hash FROM vulnerabilities ORDER BY id",
    )
    .fetch_all(&pool)
    .await?;
    assert_eq!(
        statuses,
        vec![
            ("ignored".to_string(), "abc123".to_string()),
            ("ignored".to_string(), "abc123".to_string()),
            ("open".to_string(), "different".to_string()),
        ]
    );

    let audit: Vec<(Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT manual_analysis, analyzed_by FROM vulnerabilities WHERE status = 'ignored'",
    )
    .fetch_all(&pool)
    .await?;
    for (analysis, analyzed_by) in audit {
        assert_eq!(
            analysis.as_deref(),
            Some("File marked as safe by alice")
        );
        assert_eq!(analyzed_by.as_deref(), Some("alice"));
    }

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn dedup_view_aggregates_branches(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool);
    let repo_id = seed_repository(&store, "acme", "tool").await?;

    let main = store.findings().upsert_branch(repo_id, "main").await?;
    let release = store.findings().upsert_branch(repo_id, "release").await?;

    // The same issue on two branches.
    store.findings().insert(&finding(repo_id, main, 14)).await?;
    store.findings().insert(&finding(repo_id, release, 14)).await?;

    // A different issue in the same file.
    let mut runner = finding(repo_id, main, 3);
    runner.vulnerability_type = "runner-label".to_string();
    runner.severity = Severity::Medium;
    store.findings().insert(&runner).await?;

    let rows = store.findings().deduplicated(Some(repo_id)).await?;
    assert_eq!(rows.len(), 2);

    // Critical sorts ahead of medium.
    assert_eq!(rows[0].vulnerability_type, "expression-injection");
    assert_eq!(rows[0].branch_count, 2);
    let mut branches = rows[0].branches.clone();
    branches.sort();
    assert_eq!(branches, vec!["main".to_string(), "release".to_string()]);

    assert_eq!(rows[1].vulnerability_type, "runner-label");
    assert_eq!(rows[1].branch_count, 1);
    assert_eq!(rows[1].branches, vec!["main".to_string()]);

    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn scan_history_brackets_the_measured_duration(pool: PgPool) -> Result<()> {
    let store = Store::from_pool(pool.clone());
    let repo_id = seed_repository(&store, "acme", "tool").await?;
    let queue_id = store.queue().enqueue(repo_id, 10).await?;

    store
        .telemetry()
        .record_scan_history(&ScanAttempt {
            repository_id: repo_id,
            scan_queue_id: Some(queue_id),
            status: QueueStatus::Completed,
            vulnerabilities_found: 3,
            duration_seconds: 42,
            error_message: None,
        })
        .await?;

    let (status, vulns, delta): (String, i32, f64) = sqlx::query_as(
        r#"
        SELECT status, vulnerabilities_found,
               EXTRACT(EPOCH FROM (completed_at - started_at))::float8
        FROM scan_history
        WHERE repository_id = $1
        "#,
    )
    .bind(repo_id)
    .fetch_one(&pool)
    .await?;

    assert_eq!(status, "completed");
    assert_eq!(vulns, 3);
    assert!((delta - 42.0).abs() < 1.0);

    Ok(())
}
