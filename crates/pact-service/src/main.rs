use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use pact_adapters::{AlwaysFailProvider, MockProvider};
use pact_core::PaymentProvider;
use pact_service::worker::{run_job, spawn_schedulers, WorkerConfig, ALL_JOBS};
use pact_service::{build_router, ServiceConfig, ServiceState, StoreConfig};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderMode {
    /// Deterministic in-process adapter for local mode.
    Mock,
    /// Every call fails at the transport level; for drills and outages.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// REST API only.
    Api,
    /// Periodic batch jobs only.
    Worker,
    /// API and worker in one process.
    All,
}

#[derive(Debug, Parser)]
#[command(name = "pactd", version, about = "Pact settlement service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
    /// Store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StoreMode::Auto, env = "PACT_STORE")]
    store: StoreMode,
    /// PostgreSQL connection url.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "PACT_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Payment-provider adapter. The production wire adapter plugs in here.
    #[arg(long, value_enum, default_value_t = ProviderMode::Mock, env = "PACT_PROVIDER")]
    provider: ProviderMode,
    /// Secret behind the session-token MAC key.
    #[arg(long, env = "SESSION_SECRET", default_value = "insecure-dev-secret")]
    session_secret: String,
    /// Which surfaces this process runs.
    #[arg(long, value_enum, default_value_t = Role::All)]
    role: Role,
    /// Run one job to completion and exit (see --help for names).
    #[arg(long)]
    job: Option<String>,
    /// Seconds between payout reconciliation sweeps.
    #[arg(long, default_value_t = 60, env = "PACT_RECONCILE_SECS")]
    reconcile_secs: u64,
    /// Payouts examined per reconciliation sweep.
    #[arg(long, default_value_t = 100, env = "PACT_RECONCILE_BATCH")]
    reconcile_batch: i64,
}

fn resolve_store(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let store = match cli.store {
        StoreMode::Memory => StoreConfig::Memory,
        StoreMode::Postgres => {
            let database_url = cli.database_url.clone().ok_or_else(|| {
                anyhow::anyhow!("store=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StoreMode::Auto => match cli.database_url.clone() {
            Some(database_url) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            None => StoreConfig::Memory,
        },
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pact_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        store: resolve_store(&cli)?,
        session_secret: cli.session_secret.clone(),
        ..ServiceConfig::default()
    };
    let provider: Arc<dyn PaymentProvider> = match cli.provider {
        ProviderMode::Mock => Arc::new(MockProvider::new()),
        ProviderMode::Fail => Arc::new(AlwaysFailProvider::new("provider disabled")),
    };
    let state = ServiceState::bootstrap(config, provider).await?;
    info!(
        store = state.store_backend(),
        provider = state.engine.provider_mode(),
        "pact-service bootstrapped"
    );

    if let Some(job) = cli.job.as_deref() {
        if !ALL_JOBS.contains(&job) {
            anyhow::bail!("unknown job '{job}'; expected one of: {}", ALL_JOBS.join(", "));
        }
        run_job(&state.engine, job, cli.reconcile_batch).await?;
        return Ok(());
    }

    let worker_config = WorkerConfig {
        reconcile_interval: Duration::from_secs(cli.reconcile_secs.max(1)),
        reconcile_batch: cli.reconcile_batch,
        ..WorkerConfig::default()
    };

    let worker_tasks = match cli.role {
        Role::Api => Vec::new(),
        Role::Worker | Role::All => spawn_schedulers(state.engine.clone(), worker_config),
    };

    if cli.role == Role::Worker {
        info!("pact-service worker running");
        for task in worker_tasks {
            task.await?;
        }
        return Ok(());
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("pact-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
