//! Shared domain types for the scanning pipeline.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Repository-level scan lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Never,
    Scanning,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Never => "never",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "never" => Some(ScanStatus::Never),
            "scanning" => Some(ScanStatus::Scanning),
            "completed" => Some(ScanStatus::Completed),
            "failed" => Some(ScanStatus::Failed),
            _ => None,
        }
    }
}

/// Queue entry lifecycle. `queued → processing → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(QueueStatus::Queued),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Sort key used by the deduplicated view: critical first.
    pub fn sort_key(&self) -> i32 {
        match self {
            Severity::Critical => 1,
            Severity::High => 2,
            Severity::Medium => 3,
            Severity::Low => 4,
            Severity::Info => 5,
        }
    }
}

/// Review status of a stored finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingStatus {
    Open,
    Confirmed,
    Ignored,
    FalsePositive,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::Open => "open",
            FindingStatus::Confirmed => "confirmed",
            FindingStatus::Ignored => "ignored",
            FindingStatus::FalsePositive => "false_positive",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Repository {
    pub id: i64,
    pub url: String,
    pub owner: String,
    pub name: String,
    pub has_actions: bool,
    pub scan_status: String,
    pub scan_error: Option<String>,
    pub first_scanned_at: Option<DateTime<Utc>>,
    pub last_scanned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    pub id: i64,
    pub repository_id: i64,
    pub priority: i32,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub job_name: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A queued entry joined with its repository, as handed to the dispatcher.
#[derive(Debug, Clone, FromRow)]
pub struct PendingScan {
    pub queue_id: i64,
    pub repository_id: i64,
    pub url: String,
    pub owner: String,
    pub name: String,
}

/// Insert payload for one analyzer finding.
#[derive(Debug, Clone)]
pub struct NewFinding {
    pub repository_id: i64,
    pub branch_id: Option<i64>,
    pub file_path: String,
    pub file_hash: String,
    pub vulnerability_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub line_number: Option<i32>,
    pub code_snippet: Option<String>,
    pub recommendation: String,
    pub cwe_id: Option<String>,
    pub cvss_score: Option<f32>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SafeFile {
    pub id: i64,
    pub file_path: String,
    pub file_hash: Option<String>,
    pub reason: Option<String>,
    pub marked_by: Option<String>,
    pub marked_at: DateTime<Utc>,
}

/// One row of the read-time deduplicated findings view: the same issue
/// found on several branches collapses into a single row with the branch
/// names aggregated.
#[derive(Debug, Clone, FromRow)]
pub struct DeduplicatedFinding {
    pub repository_id: i64,
    pub file_path: String,
    pub file_hash: String,
    pub vulnerability_type: String,
    pub line_number: Option<i32>,
    pub severity: String,
    pub title: String,
    pub branches: Vec<String>,
    pub branch_count: i64,
    pub last_detected_at: DateTime<Utc>,
}

/// Insert payload for one scan attempt in the history log.
#[derive(Debug, Clone)]
pub struct ScanAttempt {
    pub repository_id: i64,
    pub scan_queue_id: Option<i64>,
    pub status: QueueStatus,
    pub vulnerabilities_found: i32,
    pub duration_seconds: i64,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_status_round_trips() {
        for status in [
            ScanStatus::Never,
            ScanStatus::Scanning,
            ScanStatus::Completed,
            ScanStatus::Failed,
        ] {
            assert_eq!(ScanStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ScanStatus::parse("bogus"), None);
    }

    #[test]
    fn queue_status_round_trips() {
        for status in [
            QueueStatus::Queued,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::Failed,
        ] {
            assert_eq!(QueueStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(QueueStatus::parse("bogus"), None);
    }

    #[test]
    fn severity_sort_key_orders_critical_first() {
        assert_eq!(Severity::Critical.sort_key(), 1);
        assert_eq!(Severity::High.sort_key(), 2);
        assert_eq!(Severity::Medium.sort_key(), 3);
        assert_eq!(Severity::Low.sort_key(), 4);
        assert_eq!(Severity::Info.sort_key(), 5);
    }
}
