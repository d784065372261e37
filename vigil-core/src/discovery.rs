//! Discovery scheduler: periodically harvests top-ranked repositories,
//! expands the candidate set by owner, and enqueues scan work.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::{Result, VigilError};
use crate::github::{GithubClient, RepoMeta};
use crate::store::Store;

pub const SEARCH_QUERY: &str = "stars:>100 archived:false";

const TOP_PRIORITY: i32 = 10;
const EXPANSION_PRIORITY: i32 = 5;
const RESCAN_WINDOW_DAYS: i64 = 7;
const ERROR_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub scan_interval: Duration,
    pub top_repos_count: usize,
    pub debug_mode: bool,
}

/// Long-lived discovery loop. In debug mode the scheduler holds no store
/// at all, so every write is structurally bypassed and the loop exits
/// after a single sweep.
#[derive(Debug)]
pub struct DiscoveryScheduler {
    github: GithubClient,
    store: Option<Store>,
    config: SchedulerConfig,
}

impl DiscoveryScheduler {
    pub fn new(github: GithubClient, store: Option<Store>, config: SchedulerConfig) -> Self {
        Self {
            github,
            store,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!("Starting discovery scheduler");
        if self.config.debug_mode {
            info!("Running in DEBUG mode - no database operations");
        }
        info!(
            "Scan interval: {}s ({:.1} hours)",
            self.config.scan_interval.as_secs(),
            self.config.scan_interval.as_secs_f64() / 3600.0
        );

        loop {
            let started = std::time::Instant::now();

            if let Err(e) = self.sweep().await {
                error!("Scheduler error: {}", e);
                info!("Waiting {}s before retry...", ERROR_BACKOFF.as_secs());
                tokio::select! {
                    _ = sleep(ERROR_BACKOFF) => {}
                    _ = shutdown.recv() => break,
                }
                continue;
            }

            info!(
                "Scheduling completed in {:.1} seconds",
                started.elapsed().as_secs_f64()
            );

            if self.config.debug_mode {
                info!("Debug mode: exiting after one sweep");
                break;
            }

            info!(
                "Waiting {}s until next sweep...",
                self.config.scan_interval.as_secs()
            );
            tokio::select! {
                _ = sleep(self.config.scan_interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Discovery scheduler stopped");
        Ok(())
    }

    /// One full sweep: search, then owner expansion. A failing candidate
    /// never aborts the sweep.
    async fn sweep(&self) -> Result<()> {
        let count = self.config.top_repos_count;
        info!("Fetching top {} repositories...", count);

        let repos = self
            .github
            .search_top_repositories(SEARCH_QUERY, count)
            .await;
        info!("Found {} repositories", repos.len());

        let mut queued = 0usize;
        let mut owners_seen: HashSet<String> = HashSet::new();

        for repo in &repos {
            match self.process_candidate(repo, TOP_PRIORITY).await {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Error queuing repository {}/{}: {}",
                    repo.owner_login(),
                    repo.name,
                    e
                ),
            }

            let owner = repo.owner_login();
            if !owner.is_empty() {
                owners_seen.insert(owner.to_string());
            }
        }

        info!("Queued {} repositories from search", queued);
        info!(
            "Expanding to repositories from {} owners...",
            owners_seen.len()
        );

        let mut expanded = 0usize;
        for owner in &owners_seen {
            let owner_repos = self.github.list_owner_repositories(owner).await;

            for repo in &owner_repos {
                match self.process_candidate(repo, EXPANSION_PRIORITY).await {
                    Ok(true) => expanded += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        "Error queuing repository {}/{}: {}",
                        repo.owner_login(),
                        repo.name,
                        e
                    ),
                }
            }

            // Bound the expansion so one sweep cannot flood the queue.
            if expanded > count * 2 {
                break;
            }
        }

        info!("Queued {} additional repositories from expansion", expanded);
        info!("Total queued: {}", queued + expanded);

        Ok(())
    }

    /// Filter one candidate and enqueue it when it qualifies. Returns
    /// whether an entry was queued (or, in debug mode, would have been).
    async fn process_candidate(&self, meta: &RepoMeta, priority: i32) -> Result<bool> {
        let owner = meta.owner_login().to_string();
        let name = meta.name.clone();
        let url = meta.html_url.clone();

        if owner.is_empty() || name.is_empty() || url.is_empty() {
            return Ok(false);
        }

        if meta.archived {
            info!("Skipping {}/{} - repository is archived", owner, name);
            return Ok(false);
        }

        if !self.github.has_recent_action_runs(&owner, &name).await {
            info!("Skipping {}/{} - no workflow runs", owner, name);
            return Ok(false);
        }

        let Some(store) = &self.store else {
            info!("[FOUND] {}/{}", owner, name);
            info!("        URL: {}", url);
            info!("        Stars: {}", meta.stargazers_count);
            info!("        Priority: {}", priority);
            return Ok(true);
        };

        let repository_id = store
            .repositories()
            .upsert(&url, &owner, &name, true)
            .await?;

        if store.queue().has_active(repository_id).await? {
            info!("Skipping {}/{} - already queued", owner, name);
            return Ok(false);
        }

        if let Some(last_scanned) = store.repositories().last_scanned_at(repository_id).await? {
            let days_since_scan = (Utc::now() - last_scanned).num_days();
            if days_since_scan < RESCAN_WINDOW_DAYS {
                info!(
                    "Skipping {}/{} - scanned {} days ago",
                    owner, name, days_since_scan
                );
                return Ok(false);
            }
        }

        match store.queue().enqueue(repository_id, priority).await {
            Ok(_) => {
                info!("Queued {}/{} for scanning", owner, name);
                Ok(true)
            }
            // A concurrent enqueue won the race; by design this is a skip.
            Err(VigilError::AlreadyQueued(_)) => {
                info!("Skipping {}/{} - already queued", owner, name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
