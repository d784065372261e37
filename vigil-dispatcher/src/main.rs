//! Dispatch worker entry point.

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::{DispatchWorker, DispatcherConfig, GithubClient, JobManager, Store};

const DEFAULT_WORKER_IMAGE: &str = "ghcr.io/vigil-scan/vigil-scanner:main";

#[derive(Parser, Debug)]
#[command(name = "vigil-dispatcher")]
#[command(about = "Drains the scan queue into Kubernetes jobs under admission control")]
struct Args {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// GitHub API token, forwarded into every scan job
    #[arg(long, env = "GITHUB_TOKEN")]
    github_token: String,

    /// Namespace the scan jobs run in
    #[arg(long, env = "KUBERNETES_NAMESPACE")]
    namespace: Option<String>,

    /// Ceiling on concurrently running scan jobs
    #[arg(long, env = "MAX_CONCURRENT_JOBS", default_value_t = 10)]
    max_concurrent_jobs: usize,

    /// Seconds between dispatch cycles
    #[arg(long, env = "POLL_INTERVAL", default_value_t = 30)]
    poll_interval: u64,

    /// Container image for scan jobs
    #[arg(long, env = "WORKER_IMAGE", default_value = DEFAULT_WORKER_IMAGE)]
    worker_image: String,
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

    let namespace = args
        .namespace
        .or_else(|| std::env::var("KUEUE_NAMESPACE").ok())
        .unwrap_or_else(|| "default".to_string());

    let store = Store::connect(&args.database_url).await?;
    store.initialize_schema().await?;

    let github =
        GithubClient::new(Some(args.github_token.clone()))?.with_telemetry(store.telemetry().clone());
    let jobs = JobManager::new(&namespace, &args.worker_image).await?;

    let config = DispatcherConfig {
        max_concurrent_jobs: args.max_concurrent_jobs,
        poll_interval: std::time::Duration::from_secs(args.poll_interval),
    };

    let worker = DispatchWorker::new(
        store,
        github,
        jobs,
        config,
        args.github_token,
        args.database_url,
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, stopping at the next cycle boundary");
            let _ = shutdown_tx.send(()).await;
        }
    });

    worker.run(shutdown_rx).await?;
    Ok(())
}
