//! Postgres-backed queue store. The store is the only shared mutable state
//! between the scheduler, the dispatcher, and the scan jobs.

mod findings;
mod queue;
mod repos;
mod telemetry;

pub use findings::FindingStore;
pub use queue::QueueStore;
pub use repos::RepoStore;
pub use telemetry::TelemetryStore;

use sqlx::{
    PgPool,
    postgres::PgPoolOptions,
};
use std::fmt;
use tracing::info;

use crate::error::{Result, VigilError};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    repositories: RepoStore,
    queue: QueueStore,
    findings: FindingStore,
    telemetry: TelemetryStore,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(5);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .test_before_acquire(true)
            .connect(database_url)
            .await
            .map_err(|e| {
                VigilError::Internal(format!("Database connection failed: {}", e))
            })?;

        info!(
            "Database pool initialized with max_connections={}",
            max_connections
        );

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        let repositories = RepoStore::new(pool.clone());
        let queue = QueueStore::new(pool.clone());
        let findings = FindingStore::new(pool.clone());
        let telemetry = TelemetryStore::new(pool.clone());

        Store {
            pool,
            repositories,
            queue,
            findings,
            telemetry,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn repositories(&self) -> &RepoStore {
        &self.repositories
    }

    pub fn queue(&self) -> &QueueStore {
        &self.queue
    }

    pub fn findings(&self) -> &FindingStore {
        &self.findings
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    /// Run migrations after a preflight health check.
    pub async fn initialize_schema(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                VigilError::Internal(format!("Postgres health check failed: {}", e))
            })?;

        crate::MIGRATOR.run(&self.pool).await?;

        Ok(())
    }
}
