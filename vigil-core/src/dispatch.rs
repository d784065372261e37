//! Dispatch worker: drains the scan queue into cluster jobs while
//! honoring the concurrent-job ceiling and the upstream API budget.

use std::time::Duration;

use chrono::{Timelike, Utc};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::cluster::JobManager;
use crate::domain::QueueStatus;
use crate::error::Result;
use crate::github::{BudgetDecision, DEFAULT_REQUESTS_PER_JOB, GithubClient};
use crate::store::Store;

const MIN_REMAINING_FOR_CYCLE: i64 = 500;
const ERROR_BACKOFF: Duration = Duration::from_secs(60);
const JOB_MAX_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
}

/// Admission for one cycle: the smaller of free concurrency slots and
/// budget-funded slots.
fn admission_slots(max_concurrent: usize, active: usize, budget_slots: i64) -> usize {
    let free = max_concurrent.saturating_sub(active);
    free.min(budget_slots.max(0) as usize)
}

pub struct DispatchWorker {
    store: Store,
    github: GithubClient,
    jobs: JobManager,
    config: DispatcherConfig,
    github_token: String,
    database_url: String,
}

impl std::fmt::Debug for DispatchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchWorker")
            .field("jobs", &self.jobs)
            .field("config", &self.config)
            .finish()
    }
}

impl DispatchWorker {
    pub fn new(
        store: Store,
        github: GithubClient,
        jobs: JobManager,
        config: DispatcherConfig,
        github_token: String,
        database_url: String,
    ) -> Self {
        Self {
            store,
            github,
            jobs,
            config,
            github_token,
            database_url,
        }
    }

    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!("Starting dispatch worker");
        info!("Max concurrent jobs: {}", self.config.max_concurrent_jobs);
        info!("Poll interval: {}s", self.config.poll_interval.as_secs());
        info!("Worker image: {}", self.jobs.image());

        loop {
            let cycle_start = Utc::now();

            if let Err(e) = self.cycle().await {
                error!("Dispatch cycle error: {}", e);
                info!("Waiting {}s before retry...", ERROR_BACKOFF.as_secs());
                tokio::select! {
                    _ = sleep(ERROR_BACKOFF) => {}
                    _ = shutdown.recv() => break,
                }
                continue;
            }

            // Crude hourly trigger, good enough for a 24h-old cutoff.
            if cycle_start.minute() == 0 {
                info!("Running cleanup of old jobs...");
                if let Err(e) = self.jobs.cleanup_old_jobs(JOB_MAX_AGE_HOURS).await {
                    warn!("Error cleaning up old jobs: {}", e);
                }
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Dispatch worker stopped");
        Ok(())
    }

    /// One dispatch cycle: gate on budget, compute admission, then drain
    /// that many queued entries in priority order.
    async fn cycle(&self) -> Result<()> {
        if self.github.wait_if_needed(MIN_REMAINING_FOR_CYCLE).await == BudgetDecision::SkipCycle {
            info!("Rate limit too low, skipping this cycle");
            return Ok(());
        }

        let budget_slots = self
            .github
            .calculate_safe_jobs(DEFAULT_REQUESTS_PER_JOB)
            .await;
        if budget_slots <= 0 {
            info!("Rate limit does not allow new jobs, waiting...");
            return Ok(());
        }

        let active = self.jobs.count_active().await?;
        info!(
            "Currently running jobs: {}/{}",
            active, self.config.max_concurrent_jobs
        );

        let slots = admission_slots(self.config.max_concurrent_jobs, active, budget_slots);
        if slots == 0 {
            info!("No available slots (concurrent limit or rate limit), waiting...");
            return Ok(());
        }

        let pending = self.store.queue().claim_queued(slots as i64).await?;
        if pending.is_empty() {
            info!("No pending scans in queue");
            return Ok(());
        }

        info!("Processing {} pending scans...", pending.len());

        for scan in &pending {
            match self
                .jobs
                .create_scan_job(
                    &scan.url,
                    &scan.owner,
                    &scan.name,
                    scan.queue_id,
                    &self.github_token,
                    &self.database_url,
                )
                .await
            {
                Ok(job_name) => {
                    match self
                        .store
                        .queue()
                        .mark_processing(scan.queue_id, &job_name)
                        .await
                    {
                        Ok(()) => info!("Started scan for {}/{}", scan.owner, scan.name),
                        Err(e) => warn!(
                            "Failed to mark entry {} as processing: {}",
                            scan.queue_id, e
                        ),
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to create job for {}/{}: {}",
                        scan.owner, scan.name, e
                    );
                    if let Err(e) = self
                        .store
                        .queue()
                        .mark_terminal(
                            scan.queue_id,
                            QueueStatus::Failed,
                            Some("Failed to create job"),
                        )
                        .await
                    {
                        warn!("Failed to mark entry {} as failed: {}", scan.queue_id, e);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_is_the_min_of_both_constraints() {
        // 3 free concurrency slots, 16 budget slots.
        assert_eq!(admission_slots(10, 7, 16), 3);
        // Budget is the binding constraint.
        assert_eq!(admission_slots(10, 2, 4), 4);
    }

    #[test]
    fn admission_never_goes_negative() {
        assert_eq!(admission_slots(10, 12, 16), 0);
        assert_eq!(admission_slots(10, 0, 0), 0);
        assert_eq!(admission_slots(10, 0, -3), 0);
    }
}
