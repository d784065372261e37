pub mod analyzer;
pub mod cluster;
pub mod discovery;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod github;
pub mod scan_job;
pub mod store;

pub use cluster::{JobManager, derive_job_name};
pub use discovery::{DiscoveryScheduler, SchedulerConfig};
pub use dispatch::{DispatchWorker, DispatcherConfig};
pub use domain::*;
pub use error::{Result, VigilError};
pub use github::{BudgetDecision, GithubClient, RepoMeta};
pub use scan_job::{ScanJob, ScanJobConfig, parse_repo_url};
pub use store::Store;

/// Embedded schema migrations, shared by the binaries and the test suite.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
