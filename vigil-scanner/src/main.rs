//! Scan job entry point: one invocation analyzes one repository and exits.

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::{ScanJob, ScanJobConfig};

#[derive(Parser, Debug)]
#[command(name = "vigil-scanner")]
#[command(about = "Clones a repository, runs the workflow analyzer, and persists findings")]
struct Args {
    /// Repository to scan
    #[arg(long, env = "REPO_URL")]
    repo_url: String,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// GitHub API token for cloning and workflow downloads
    #[arg(long, env = "GITHUB_TOKEN")]
    github_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting scan of {}", args.repo_url);

    let job = ScanJob::new(ScanJobConfig {
        repo_url: args.repo_url,
        database_url: args.database_url,
        github_token: args.github_token,
    })
    .await?;

    job.run().await?;
    Ok(())
}
