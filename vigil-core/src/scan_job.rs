//! Single-shot scan job: clone the repository, fetch its workflows across
//! branches, run the external analyzer, and persist allow-list-filtered
//! findings with terminal queue bookkeeping on every exit path.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::analyzer::{self, RawFinding};
use crate::cluster::derive_job_name;
use crate::domain::{NewFinding, QueueStatus, ScanAttempt};
use crate::error::{Result, VigilError};
use crate::github::{BudgetDecision, GithubClient};
use crate::store::Store;

const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const ANALYZE_TIMEOUT: Duration = Duration::from_secs(600);
const MIN_REMAINING_FOR_SCAN: i64 = 100;

static REPO_URL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"github\.com[:/]([^/]+)/([^/\.]+)").unwrap(),
        Regex::new(r"github\.com/([^/]+)/([^/]+)\.git").unwrap(),
    ]
});

/// Extract `(owner, name)` from a repository URL. The two patterns cover
/// https and ssh remotes, with and without a `.git` suffix.
pub fn parse_repo_url(url: &str) -> Result<(String, String)> {
    for pattern in REPO_URL_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(url) {
            return Ok((caps[1].to_string(), caps[2].to_string()));
        }
    }
    Err(VigilError::InvalidRepoUrl(url.to_string()))
}

#[derive(Debug, Clone)]
pub struct ScanJobConfig {
    pub repo_url: String,
    pub database_url: String,
    pub github_token: Option<String>,
}

pub struct ScanJob {
    repo_url: String,
    owner: String,
    name: String,
    github_token: Option<String>,
    store: Store,
    github: GithubClient,
    clone_dir: PathBuf,
    workflows_dir: PathBuf,
}

impl std::fmt::Debug for ScanJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanJob")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .finish()
    }
}

impl ScanJob {
    pub async fn new(config: ScanJobConfig) -> Result<Self> {
        let (owner, name) = parse_repo_url(&config.repo_url)?;

        let store = Store::connect(&config.database_url).await?;
        let github = GithubClient::new(config.github_token.clone())?
            .with_telemetry(store.telemetry().clone());

        Ok(Self {
            repo_url: config.repo_url,
            owner,
            name,
            github_token: config.github_token,
            store,
            github,
            clone_dir: PathBuf::from("/tmp/repo_clone"),
            workflows_dir: PathBuf::from("/tmp/octoscan-workflows"),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.execute(started).await;
        self.cleanup().await;
        result
    }

    async fn execute(&self, started: Instant) -> Result<()> {
        info!("Checking GitHub API rate limits...");
        if self.github.wait_if_needed(MIN_REMAINING_FOR_SCAN).await == BudgetDecision::SkipCycle {
            return Err(VigilError::Internal(
                "Rate limit budget exhausted, aborting scan".to_string(),
            ));
        }

        let repository_id = self
            .store
            .repositories()
            .upsert(&self.repo_url, &self.owner, &self.name, true)
            .await?;
        self.store.repositories().begin_scan(repository_id).await?;

        // The dispatcher usually claimed the entry already; after a crash
        // between job creation and the claim it is still `queued`, and this
        // transition (under the same deterministic job name) picks it up.
        let queue_id = self.store.queue().find_for_repository(repository_id).await?;
        if let Some(queue_id) = queue_id {
            let job_name = derive_job_name(&self.owner, &self.name, queue_id);
            if let Err(e) = self.store.queue().mark_processing(queue_id, &job_name).await {
                warn!("Could not mark queue entry {} as processing: {}", queue_id, e);
            }
        }

        info!("Cloning repository: {}", self.repo_url);
        if let Err(e) = self.clone_repository().await {
            return self
                .fail(repository_id, queue_id, started, "Failed to clone repository", e)
                .await;
        }

        info!("Downloading workflows from all branches...");
        if let Err(e) = self.download_workflows().await {
            return self
                .fail(repository_id, queue_id, started, "Failed to download workflows", e)
                .await;
        }

        info!("Running workflow analysis...");
        let findings = match self.run_analyzer().await {
            Ok(findings) => findings,
            Err(e) => {
                return self
                    .fail(repository_id, queue_id, started, "Workflow analysis failed", e)
                    .await;
            }
        };

        info!("Found {} potential issues", findings.len());
        self.ingest(repository_id, &findings).await;

        self.store.repositories().finish_scan(repository_id).await?;
        if let Some(queue_id) = queue_id {
            self.store
                .queue()
                .mark_terminal(queue_id, QueueStatus::Completed, None)
                .await?;
        }
        self.store
            .telemetry()
            .record_scan_history(&ScanAttempt {
                repository_id,
                scan_queue_id: queue_id,
                status: QueueStatus::Completed,
                vulnerabilities_found: findings.len() as i32,
                duration_seconds: started.elapsed().as_secs() as i64,
                error_message: None,
            })
            .await?;

        info!("Scan completed successfully");
        Ok(())
    }

    /// Terminal bookkeeping for a failed scan: repository status, queue
    /// entry, and a history row. Bookkeeping errors are logged but never
    /// mask the original failure.
    async fn fail(
        &self,
        repository_id: i64,
        queue_id: Option<i64>,
        started: Instant,
        message: &str,
        cause: VigilError,
    ) -> Result<()> {
        error!("{}: {}", message, cause);

        if let Err(e) = self.store.repositories().fail_scan(repository_id, message).await {
            warn!("Failed to update repository status: {}", e);
        }

        if let Some(queue_id) = queue_id {
            if let Err(e) = self
                .store
                .queue()
                .mark_terminal(queue_id, QueueStatus::Failed, Some(message))
                .await
            {
                warn!("Failed to update queue entry {}: {}", queue_id, e);
            }
        }

        if let Err(e) = self
            .store
            .telemetry()
            .record_scan_history(&ScanAttempt {
                repository_id,
                scan_queue_id: queue_id,
                status: QueueStatus::Failed,
                vulnerabilities_found: 0,
                duration_seconds: started.elapsed().as_secs() as i64,
                error_message: Some(message.to_string()),
            })
            .await
        {
            warn!("Failed to record scan history: {}", e);
        }

        Err(cause)
    }

    /// Shallow clone, with the token injected into the URL when present.
    async fn clone_repository(&self) -> Result<()> {
        let clone_url = match &self.github_token {
            Some(token) => self.repo_url.replace(
                "https://github.com/",
                &format!("https://{}@github.com/", token),
            ),
            None => self.repo_url.clone(),
        };

        let output = timeout(
            CLONE_TIMEOUT,
            Command::new("git")
                .arg("clone")
                .arg("--depth")
                .arg("1")
                .arg(&clone_url)
                .arg(&self.clone_dir)
                .output(),
        )
        .await
        .map_err(|_| VigilError::SubprocessTimeout("git clone", CLONE_TIMEOUT.as_secs()))??;

        if !output.status.success() {
            return Err(VigilError::Internal(format!(
                "git clone failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(())
    }

    /// Fetch workflow files across branches into the staging tree. A
    /// non-zero exit that still produced files counts as success.
    async fn download_workflows(&self) -> Result<()> {
        let mut cmd = Command::new("octoscan");
        cmd.arg("dl")
            .arg("--org")
            .arg(&self.owner)
            .arg("--repo")
            .arg(&self.name)
            .arg("--default-branch")
            .arg("--output-dir")
            .arg(&self.workflows_dir);
        if let Some(token) = &self.github_token {
            cmd.arg("--token").arg(token);
        }

        let output = timeout(DOWNLOAD_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                VigilError::SubprocessTimeout("octoscan dl", DOWNLOAD_TIMEOUT.as_secs())
            })??;

        if !output.status.success() {
            warn!(
                "octoscan dl returned non-zero: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            if directory_has_entries(&self.workflows_dir).await {
                info!("Some workflows were downloaded, continuing...");
                return Ok(());
            }
            return Err(VigilError::Internal(
                "workflow download produced no files".to_string(),
            ));
        }

        Ok(())
    }

    /// Run the analyzer over the staging tree. The analyzer exits non-zero
    /// when it finds issues, so only a timeout or spawn failure is a hard
    /// error; unparseable output degrades to an empty result.
    async fn run_analyzer(&self) -> Result<Vec<RawFinding>> {
        if !self.workflows_dir.exists() {
            info!(
                "No workflows directory found at {}",
                self.workflows_dir.display()
            );
            return Ok(Vec::new());
        }

        let output = timeout(
            ANALYZE_TIMEOUT,
            Command::new("octoscan")
                .arg("scan")
                .arg(&self.workflows_dir)
                .arg("--format")
                .arg("json")
                .arg("--disable-rules")
                .arg("shellcheck,local-action")
                .arg("--filter-run")
                .arg("--filter-triggers")
                .arg("external")
                .output(),
        )
        .await
        .map_err(|_| VigilError::SubprocessTimeout("octoscan scan", ANALYZE_TIMEOUT.as_secs()))??;

        if !output.stderr.is_empty() {
            warn!(
                "Analyzer stderr: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(analyzer::parse_analyzer_output(&stdout))
    }

    /// Persist findings one by one: a single bad entry is logged and
    /// skipped, the rest of the batch still lands.
    async fn ingest(&self, repository_id: i64, findings: &[RawFinding]) -> usize {
        let mut stored = 0usize;
        let mut skipped_safe = 0usize;

        for finding in findings {
            match self.ingest_one(repository_id, finding).await {
                Ok(true) => stored += 1,
                Ok(false) => skipped_safe += 1,
                Err(e) => error!("Error storing finding: {}", e),
            }
        }

        if skipped_safe > 0 {
            info!("Skipped {} findings from globally safe files", skipped_safe);
        }

        stored
    }

    async fn ingest_one(&self, repository_id: i64, finding: &RawFinding) -> Result<bool> {
        let raw_path = finding.filepath.as_str();
        let full_path = if Path::new(raw_path).is_absolute() {
            PathBuf::from(raw_path)
        } else {
            self.workflows_dir.join(raw_path)
        };

        let file_hash = if full_path.exists() {
            analyzer::hash_file(&full_path).await
        } else {
            String::new()
        };

        let clean_path = analyzer::clean_file_path(raw_path);

        if self
            .store
            .findings()
            .is_file_safe(&clean_path, &file_hash)
            .await?
        {
            return Ok(false);
        }

        let kind = finding.kind();
        let branch_name = analyzer::extract_branch(raw_path);
        let branch_id = self
            .store
            .findings()
            .upsert_branch(repository_id, &branch_name)
            .await?;

        let message = finding.message();
        self.store
            .findings()
            .insert(&NewFinding {
                repository_id,
                branch_id: Some(branch_id),
                file_path: clean_path,
                file_hash,
                vulnerability_type: kind.to_string(),
                severity: analyzer::map_severity(kind),
                title: analyzer::derive_title(message),
                description: message.to_string(),
                line_number: finding.line,
                code_snippet: finding.snippet.clone(),
                recommendation: analyzer::recommendation_for(kind).to_string(),
                cwe_id: None,
                cvss_score: None,
            })
            .await?;

        Ok(true)
    }

    /// Remove staging directories. Runs on every exit path.
    async fn cleanup(&self) {
        for dir in [&self.clone_dir, &self.workflows_dir] {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", dir.display(), e);
                }
            }
        }
    }
}

async fn directory_has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_urls_parse() {
        let (owner, name) = parse_repo_url("https://github.com/acme/tool").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(name, "tool");
    }

    #[test]
    fn git_suffix_is_stripped() {
        let (owner, name) = parse_repo_url("https://github.com/acme/tool.git").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(name, "tool");
    }

    #[test]
    fn ssh_remotes_parse() {
        let (owner, name) = parse_repo_url("git@github.com:acme/tool.git").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(name, "tool");
    }

    #[test]
    fn non_github_urls_are_rejected() {
        assert!(matches!(
            parse_repo_url("https://example.com/acme/tool"),
            Err(VigilError::InvalidRepoUrl(_))
        ));
    }
}
