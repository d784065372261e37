//! GitHub REST client with rate-limit budgeting.
//!
//! One client is constructed per process and passed by reference. Every
//! rate-limit observation is also persisted as an append-only sample when
//! the client carries a telemetry handle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::TelemetryStore;

const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("vigil-scanner/", env!("CARGO_PKG_VERSION"));

/// GitHub search never returns more than this many results per query.
const SEARCH_RESULT_CEILING: usize = 1000;
const PAGE_SIZE: usize = 100;

/// Requests held back from the budget when sizing job admission.
const RATE_LIMIT_BUFFER: i64 = 500;
pub const DEFAULT_REQUESTS_PER_JOB: i64 = 50;

/// Past this many seconds until reset, callers skip the cycle instead of
/// sleeping through it.
const MAX_BUDGET_SLEEP_SECS: i64 = 900;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RateWindow {
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub remaining: i64,
    #[serde(default)]
    pub reset: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSnapshot {
    pub core: RateWindow,
    pub search: RateWindow,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateWindow,
    search: RateWindow,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoOwner {
    #[serde(default)]
    pub login: String,
}

/// Repository metadata as returned by search and list endpoints. The
/// payloads are duck-typed; every field tolerates absence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub stargazers_count: i64,
    #[serde(default)]
    pub owner: Option<RepoOwner>,
}

impl RepoMeta {
    pub fn owner_login(&self) -> &str {
        self.owner.as_ref().map(|o| o.login.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<RepoMeta>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRuns {
    #[serde(default)]
    total_count: i64,
}

/// Outcome of the non-blocking budget gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Proceed,
    SkipCycle,
}

/// What the budget arithmetic says to do, before any sleeping happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BudgetAction {
    Proceed,
    Sleep(Duration),
    Skip,
}

/// Pure decision for `wait_if_needed`: below the threshold we sleep
/// through a near reset (plus a small buffer) but skip the cycle when the
/// reset is more than `MAX_BUDGET_SLEEP_SECS` away.
fn decide_budget(remaining: i64, min_remaining: i64, seconds_until_reset: i64) -> BudgetAction {
    if remaining >= min_remaining {
        return BudgetAction::Proceed;
    }
    if seconds_until_reset > MAX_BUDGET_SLEEP_SECS {
        return BudgetAction::Skip;
    }
    if seconds_until_reset > 0 {
        return BudgetAction::Sleep(Duration::from_secs(seconds_until_reset as u64 + 5));
    }
    // Reset already passed; the next observation will show a fresh window.
    BudgetAction::Proceed
}

/// Number of jobs the remaining budget can fund, with a fixed buffer of
/// requests held back.
fn safe_jobs(remaining: i64, requests_per_job: i64) -> i64 {
    let available = (remaining - RATE_LIMIT_BUFFER).max(0);
    available / requests_per_job.max(1)
}

#[derive(Debug, Clone, Copy)]
enum ApiClass {
    Core,
    Search,
}

#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    token: Option<String>,
    telemetry: Option<TelemetryStore>,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClient")
            .field("authenticated", &self.token.is_some())
            .field("persists_samples", &self.telemetry.is_some())
            .finish()
    }
}

impl GithubClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        if token.is_none() {
            warn!("No GitHub token provided. Rate limits will be very restrictive.");
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            token,
            telemetry: None,
        })
    }

    /// Attach a telemetry handle so rate-limit observations are persisted.
    pub fn with_telemetry(mut self, telemetry: TelemetryStore) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.get(url);
        if let Some(token) = &self.token {
            builder = builder
                .header(reqwest::header::AUTHORIZATION, format!("token {}", token))
                .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json");
        }
        builder
    }

    /// Fetch the current rate limit and persist one sample per API class.
    pub async fn fetch_rate_limit(&self) -> Result<RateLimitSnapshot> {
        let response: RateLimitResponse = self
            .request(&format!("{}/rate_limit", GITHUB_API_BASE))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let snapshot = RateLimitSnapshot {
            core: response.resources.core,
            search: response.resources.search,
        };

        if let Some(telemetry) = &self.telemetry {
            for (api_type, window) in [("core", snapshot.core), ("search", snapshot.search)] {
                let reset_at = DateTime::<Utc>::from_timestamp(window.reset, 0)
                    .unwrap_or_else(Utc::now);
                if let Err(e) = telemetry
                    .append_rate_limit_sample(
                        api_type,
                        window.limit as i32,
                        window.remaining as i32,
                        reset_at,
                    )
                    .await
                {
                    warn!("Failed to store {} rate limit sample: {}", api_type, e);
                }
            }
        }

        Ok(snapshot)
    }

    /// Non-blocking budget gate used by the dispatcher. A short wait is
    /// absorbed here; a long one turns into `SkipCycle` so the caller can
    /// re-evaluate on its next tick.
    pub async fn wait_if_needed(&self, min_remaining: i64) -> BudgetDecision {
        let snapshot = match self.fetch_rate_limit().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Could not check rate limit, proceeding anyway: {}", e);
                return BudgetDecision::Proceed;
            }
        };

        let core = snapshot.core;
        let until_reset = core.reset - Utc::now().timestamp();

        match decide_budget(core.remaining, min_remaining, until_reset) {
            BudgetAction::Proceed => BudgetDecision::Proceed,
            BudgetAction::Skip => {
                info!(
                    "Rate limit low ({} remaining), reset in {}s. Skipping this cycle.",
                    core.remaining, until_reset
                );
                BudgetDecision::SkipCycle
            }
            BudgetAction::Sleep(wait) => {
                info!(
                    "Rate limit low ({} remaining). Waiting {}s...",
                    core.remaining,
                    wait.as_secs()
                );
                sleep(wait).await;
                BudgetDecision::Proceed
            }
        }
    }

    /// How many scan jobs the current core budget can fund.
    pub async fn calculate_safe_jobs(&self, requests_per_job: i64) -> i64 {
        let (remaining, limit) = match self.fetch_rate_limit().await {
            Ok(snapshot) => (snapshot.core.remaining, snapshot.core.limit),
            Err(e) => {
                warn!("Could not check rate limit, assuming full budget: {}", e);
                (5000, 5000)
            }
        };

        let jobs = safe_jobs(remaining, requests_per_job);
        info!(
            "Rate limit: {}/{} remaining, can safely run {} jobs",
            remaining, limit, jobs
        );
        jobs
    }

    /// Sleep until reset when the relevant window is nearly exhausted.
    async fn pace_before_page(&self, class: ApiClass) {
        let snapshot = match self.fetch_rate_limit().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Error checking rate limit: {}", e);
                return;
            }
        };

        let window = match class {
            ApiClass::Core => snapshot.core,
            ApiClass::Search => snapshot.search,
        };

        if window.remaining < 10 {
            let wait = window.reset - Utc::now().timestamp();
            if wait > 0 {
                info!("Rate limit almost exhausted. Waiting {}s...", wait);
                sleep(Duration::from_secs(wait as u64 + 1)).await;
            }
        }
    }

    /// Page through the search API, stars-descending. Stops at
    /// `max_results`, at the service's absolute result ceiling, or at the
    /// first short page. Transport errors end the search with whatever has
    /// been accumulated.
    pub async fn search_top_repositories(
        &self,
        query: &str,
        max_results: usize,
    ) -> Vec<RepoMeta> {
        let mut repos: Vec<RepoMeta> = Vec::new();
        let mut page: u32 = 1;
        let stop_at = SEARCH_RESULT_CEILING.min(max_results);

        while repos.len() < max_results {
            self.pace_before_page(ApiClass::Search).await;

            let response = self
                .request(&format!("{}/search/repositories", GITHUB_API_BASE))
                .query(&[
                    ("q", query.to_string()),
                    ("sort", "stars".to_string()),
                    ("order", "desc".to_string()),
                    ("per_page", PAGE_SIZE.to_string()),
                    ("page", page.to_string()),
                ])
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!("Error searching repositories: {}", e);
                    break;
                }
            };

            if response.status() == StatusCode::FORBIDDEN {
                warn!("Rate limit exceeded. Waiting...");
                sleep(Duration::from_secs(60)).await;
                continue;
            }

            let body: SearchResponse = match response
                .error_for_status()
                .map(|r| r.json::<SearchResponse>())
            {
                Ok(json) => match json.await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Error parsing search response: {}", e);
                        break;
                    }
                },
                Err(e) => {
                    warn!("Search request failed: {}", e);
                    break;
                }
            };

            if body.items.is_empty() {
                break;
            }

            let batch = body.items.len();
            repos.extend(body.items);
            debug!("Search page {} returned {} repositories", page, batch);

            if batch < PAGE_SIZE || repos.len() >= stop_at {
                break;
            }

            page += 1;
            sleep(Duration::from_secs(1)).await;
        }

        repos.truncate(max_results);
        repos
    }

    /// List every repository owned by a user; a 404 retries the owner as
    /// an organization.
    pub async fn list_owner_repositories(&self, owner: &str) -> Vec<RepoMeta> {
        let mut repos: Vec<RepoMeta> = Vec::new();
        let mut page: u32 = 1;

        loop {
            self.pace_before_page(ApiClass::Core).await;

            let page_param = page.to_string();
            let query = [("per_page", PAGE_SIZE.to_string()), ("page", page_param)];

            let response = self
                .request(&format!("{}/users/{}/repos", GITHUB_API_BASE, owner))
                .query(&query)
                .send()
                .await;

            let mut response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!("Error listing repositories for {}: {}", owner, e);
                    break;
                }
            };

            if response.status() == StatusCode::NOT_FOUND {
                response = match self
                    .request(&format!("{}/orgs/{}/repos", GITHUB_API_BASE, owner))
                    .query(&query)
                    .send()
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Error listing repositories for org {}: {}", owner, e);
                        break;
                    }
                };
            }

            if response.status() == StatusCode::FORBIDDEN {
                warn!("Rate limit exceeded. Waiting...");
                sleep(Duration::from_secs(60)).await;
                continue;
            }

            let items: Vec<RepoMeta> = match response
                .error_for_status()
                .map(|r| r.json::<Vec<RepoMeta>>())
            {
                Ok(json) => match json.await {
                    Ok(items) => items,
                    Err(e) => {
                        warn!("Error parsing repository list for {}: {}", owner, e);
                        break;
                    }
                },
                Err(e) => {
                    warn!("Repository list request failed for {}: {}", owner, e);
                    break;
                }
            };

            if items.is_empty() {
                break;
            }

            let batch = items.len();
            repos.extend(items);

            if batch < PAGE_SIZE {
                break;
            }

            page += 1;
            sleep(Duration::from_millis(500)).await;
        }

        repos
    }

    /// True when the repository has at least one workflow run. Errs on the
    /// side of `false`: a missing or forbidden endpoint means the scan
    /// would find nothing useful anyway.
    pub async fn has_recent_action_runs(&self, owner: &str, name: &str) -> bool {
        let response = self
            .request(&format!(
                "{}/repos/{}/{}/actions/runs",
                GITHUB_API_BASE, owner, name
            ))
            .query(&[("per_page", "1")])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!("Error checking workflow runs for {}/{}: {}", owner, name, e);
                return false;
            }
        };

        match response.status() {
            StatusCode::NOT_FOUND => return false,
            StatusCode::FORBIDDEN => {
                sleep(Duration::from_secs(2)).await;
                return false;
            }
            _ => {}
        }

        match response
            .error_for_status()
            .map(|r| r.json::<WorkflowRuns>())
        {
            Ok(json) => match json.await {
                Ok(runs) => runs.total_count > 0,
                Err(e) => {
                    warn!("Error parsing workflow runs for {}/{}: {}", owner, name, e);
                    false
                }
            },
            Err(e) => {
                warn!("Workflow runs request failed for {}/{}: {}", owner, name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_jobs_holds_back_the_buffer() {
        assert_eq!(safe_jobs(1300, 50), 16);
        assert_eq!(safe_jobs(500, 50), 0);
        assert_eq!(safe_jobs(400, 50), 0);
        assert_eq!(safe_jobs(5000, 50), 90);
    }

    #[test]
    fn budget_proceeds_when_above_threshold() {
        assert_eq!(decide_budget(600, 500, 1200), BudgetAction::Proceed);
    }

    #[test]
    fn budget_sleeps_through_a_near_reset() {
        assert_eq!(
            decide_budget(400, 500, 60),
            BudgetAction::Sleep(Duration::from_secs(65))
        );
    }

    #[test]
    fn budget_skips_the_cycle_on_a_distant_reset() {
        assert_eq!(decide_budget(400, 500, 1200), BudgetAction::Skip);
    }

    #[test]
    fn budget_proceeds_once_the_reset_passed() {
        assert_eq!(decide_budget(0, 500, -10), BudgetAction::Proceed);
    }
}
