//! Thin capability over the Kubernetes batch-job primitive: create scan
//! jobs, count the ones still running, and garbage-collect old ones.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use tracing::{info, warn};

use crate::error::{Result, VigilError};

pub const APP_LABEL: &str = "github-scanner";
pub const COMPONENT_LABEL: &str = "worker";

/// Label selector matching every scan job this pipeline owns.
pub const WORKER_SELECTOR: &str = "app=github-scanner,component=worker";

const JOB_BACKOFF_LIMIT: i32 = 3;
const JOB_TTL_SECONDS: i32 = 3600;
const JOB_NAME_MAX_LEN: usize = 63;

/// Derive the deterministic cluster job name for a queue entry. The same
/// `(owner, name, queue_id)` always maps to the same name, which is what
/// makes re-submission after a dispatcher crash idempotent.
pub fn derive_job_name(owner: &str, name: &str, queue_id: i64) -> String {
    let raw = format!("scan-{}-{}-{}", owner, name, queue_id).to_lowercase();

    let mut sanitized = String::with_capacity(raw.len());
    let mut prev_dash = false;
    for c in raw.chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' {
            if prev_dash {
                continue;
            }
            prev_dash = true;
        } else {
            prev_dash = false;
        }
        sanitized.push(c);
    }

    sanitized.truncate(JOB_NAME_MAX_LEN);
    sanitized.trim_matches('-').to_string()
}

/// Condensed job status as reported by the cluster.
#[derive(Debug, Clone, Default)]
pub struct JobStatusSummary {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct JobManager {
    jobs: Api<Job>,
    namespace: String,
    image: String,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("namespace", &self.namespace)
            .field("image", &self.image)
            .finish()
    }
}

impl JobManager {
    /// Connect using in-cluster config, falling back to the local
    /// kubeconfig.
    pub async fn new(namespace: &str, image: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        let jobs = Api::namespaced(client, namespace);

        Ok(Self {
            jobs,
            namespace: namespace.to_string(),
            image: image.to_string(),
        })
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn build_job(
        &self,
        job_name: &str,
        repo_url: &str,
        queue_id: i64,
        github_token: &str,
        database_url: &str,
    ) -> Job {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), APP_LABEL.to_string());
        labels.insert("component".to_string(), COMPONENT_LABEL.to_string());
        labels.insert("scan-id".to_string(), queue_id.to_string());

        let mut pod_labels = BTreeMap::new();
        pod_labels.insert("app".to_string(), APP_LABEL.to_string());
        pod_labels.insert("component".to_string(), COMPONENT_LABEL.to_string());

        let env = vec![
            EnvVar {
                name: "REPO_URL".to_string(),
                value: Some(repo_url.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "DATABASE_URL".to_string(),
                value: Some(database_url.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "GITHUB_TOKEN".to_string(),
                value: Some(github_token.to_string()),
                ..Default::default()
            },
        ];

        let requests = BTreeMap::from([
            ("cpu".to_string(), Quantity("500m".to_string())),
            ("memory".to_string(), Quantity("1Gi".to_string())),
        ]);
        let limits = BTreeMap::from([
            ("cpu".to_string(), Quantity("2".to_string())),
            ("memory".to_string(), Quantity("4Gi".to_string())),
        ]);

        Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(JOB_BACKOFF_LIMIT),
                ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "scanner".to_string(),
                            image: Some(self.image.clone()),
                            image_pull_policy: Some("Always".to_string()),
                            env: Some(env),
                            resources: Some(ResourceRequirements {
                                requests: Some(requests),
                                limits: Some(limits),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Submit the scan job for one queue entry. An HTTP 409 means a prior
    /// submission already materialized this entry; that is success.
    pub async fn create_scan_job(
        &self,
        repo_url: &str,
        owner: &str,
        name: &str,
        queue_id: i64,
        github_token: &str,
        database_url: &str,
    ) -> Result<String> {
        let job_name = derive_job_name(owner, name, queue_id);
        let job = self.build_job(&job_name, repo_url, queue_id, github_token, database_url);

        match self.jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!("Created job {} for {}/{}", job_name, owner, name);
                Ok(job_name)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!("Job {} already exists", job_name);
                Ok(job_name)
            }
            Err(e) => Err(VigilError::Cluster(e)),
        }
    }

    /// List every job matching the worker label selector.
    pub async fn list(&self) -> Result<Vec<Job>> {
        let params = ListParams::default().labels(WORKER_SELECTOR);
        let jobs = self.jobs.list(&params).await?;
        Ok(jobs.items)
    }

    /// Number of scan jobs with at least one active pod.
    pub async fn count_active(&self) -> Result<usize> {
        let active = self
            .list()
            .await?
            .iter()
            .filter(|job| {
                job.status
                    .as_ref()
                    .and_then(|status| status.active)
                    .unwrap_or(0)
                    > 0
            })
            .count();

        Ok(active)
    }

    pub async fn read_status(&self, job_name: &str) -> Result<Option<JobStatusSummary>> {
        let job = self.jobs.get_opt(job_name).await?;

        Ok(job.and_then(|job| job.status).map(|status| JobStatusSummary {
            active: status.active.unwrap_or(0),
            succeeded: status.succeeded.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
            start_time: status.start_time.map(|t| t.0),
            completion_time: status.completion_time.map(|t| t.0),
        }))
    }

    pub async fn delete(&self, job_name: &str, params: &DeleteParams) -> Result<()> {
        self.jobs.delete(job_name, params).await?;
        Ok(())
    }

    /// Delete scan jobs whose completion time is older than `max_age_hours`.
    /// Returns the number of jobs removed.
    pub async fn cleanup_old_jobs(&self, max_age_hours: i64) -> Result<usize> {
        let jobs = self.list().await?;
        let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours);

        let mut removed = 0;
        for job in jobs {
            let Some(name) = job.metadata.name.clone() else {
                continue;
            };
            let completed_at = job
                .status
                .as_ref()
                .and_then(|status| status.completion_time.as_ref())
                .map(|t| t.0);

            if let Some(completed_at) = completed_at {
                if completed_at < cutoff {
                    match self.delete(&name, &DeleteParams::foreground()).await {
                        Ok(()) => {
                            info!("Cleaned up old job: {}", name);
                            removed += 1;
                        }
                        Err(e) => {
                            warn!("Error deleting job {}: {}", name, e);
                        }
                    }
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_name_is_deterministic_and_sanitized() {
        assert_eq!(
            derive_job_name("AcmeCo", "My_Repo.Tool", 42),
            "scan-acmeco-my-repo-tool-42"
        );
    }

    #[test]
    fn job_name_collapses_runs_of_dashes() {
        assert_eq!(
            derive_job_name("a__b", "c..d", 1),
            "scan-a-b-c-d-1"
        );
    }

    #[test]
    fn job_name_is_bounded_and_trimmed() {
        let owner = "o".repeat(40);
        let name = "n".repeat(40);
        let derived = derive_job_name(&owner, &name, 7);

        assert!(derived.len() <= 63);
        assert!(!derived.starts_with('-'));
        assert!(!derived.ends_with('-'));
        assert!(derived.starts_with("scan-"));
    }
}
