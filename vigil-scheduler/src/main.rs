//! Discovery scheduler entry point.

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::{DiscoveryScheduler, GithubClient, SchedulerConfig, Store};

#[derive(Parser, Debug)]
#[command(name = "vigil-scheduler")]
#[command(about = "Harvests candidate repositories and queues them for scanning")]
struct Args {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// GitHub API token; without one the upstream budget is tiny
    #[arg(long, env = "GITHUB_TOKEN")]
    github_token: Option<String>,

    /// Seconds between discovery sweeps
    #[arg(long, env = "SCAN_INTERVAL", default_value_t = 86_400)]
    scan_interval: u64,

    /// How many top-ranked repositories to harvest per sweep
    #[arg(long, env = "TOP_REPOS_COUNT", default_value_t = 10_000)]
    top_repos_count: usize,

    /// Log decisions without touching the database and exit after one sweep
    #[arg(long, env = "DEBUG_MODE", default_value_t = false)]
    debug_mode: bool,
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

    let store = if args.debug_mode {
        None
    } else {
        let database_url = args.database_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "DATABASE_URL is required (set DEBUG_MODE=true to run without a database)"
            )
        })?;
        let store = Store::connect(database_url).await?;
        store.initialize_schema().await?;
        Some(store)
    };

    let mut github = GithubClient::new(args.github_token)?;
    if let Some(store) = &store {
        github = github.with_telemetry(store.telemetry().clone());
    }

    let config = SchedulerConfig {
        scan_interval: std::time::Duration::from_secs(args.scan_interval),
        top_repos_count: args.top_repos_count,
        debug_mode: args.debug_mode,
    };

    let scheduler = DiscoveryScheduler::new(github, store, config);

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, stopping at the next loop boundary");
            let _ = shutdown_tx.send(()).await;
        }
    });

    scheduler.run(shutdown_rx).await?;
    Ok(())
}
