//! chemistd — the chemist control-plane daemon.
//!
//! Watches a fleet of monitoring agents ("flasks") scraping a dynamic
//! population of application instances ("targets"): reacts to cloud
//! lifecycle events, keeps every target assigned to exactly one live flask,
//! listens to flask telemetry, and investigates flasks suspected dead.
//!
//! # Usage
//!
//! ```text
//! chemistd --config /etc/chemist/chemist.toml
//! chemistd --config ./chemist.toml --port 9000
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::info;

use chemist_api::{build_router, ApiState};
use chemist_core::ChemistConfig;
use chemist_discovery::StaticDiscovery;
use chemist_investigator::{Investigator, InvestigatorConfig};
use chemist_lifecycle::{run_lifecycle_loop, InMemoryQueue, Interpreter, RunnerContext};
use chemist_metrics::ControlMetrics;
use chemist_sharding::{spawn_distribute_workers, Distributor};
use chemist_state::Repository;
use chemist_telemetry::Subscriber;
use chemistd::bootstrap;

/// Concurrent distribute jobs.
const DISTRIBUTE_WORKERS: usize = 16;

#[derive(Parser)]
#[command(name = "chemistd", about = "Chemist control-plane daemon")]
struct Cli {
    /// Path to the chemist.toml configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Override the admin HTTP port from the configuration.
    #[arg(long)]
    port: Option<u16>,

    /// Tracing filter, e.g. "info,chemist_lifecycle=trace". Takes
    /// precedence over RUST_LOG.
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = cli
        .log_filter
        .as_deref()
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chemistd=debug,chemist=debug".parse().unwrap())
        });
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    let config = ChemistConfig::from_file(&cli.config)?;
    run(config, cli.port).await
}

async fn run(config: ChemistConfig, port_override: Option<u16>) -> anyhow::Result<()> {
    info!("chemist control plane starting");

    // ── Core state ─────────────────────────────────────────────
    let repo = Arc::new(Repository::new());
    let metrics = Arc::new(ControlMetrics::new());
    let strategy = bootstrap::build_strategy(config.sharding_strategy);
    info!(strategy = strategy.name(), "sharding strategy selected");

    // ── Channels and shutdown ──────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (suspects_tx, suspects_rx) = mpsc::channel(1024);
    let (synthetic_tx, synthetic_rx) = mpsc::channel(64);
    let (new_keys_tx, mut new_keys_rx) = mpsc::channel(1024);

    // ── Distribution ───────────────────────────────────────────
    let distributor = Arc::new(Distributor::new(
        repo.clone(),
        config.command_timeout(),
        suspects_tx.clone(),
    )?);
    let (distribute_tx, distribute_handle) = spawn_distribute_workers(
        distributor.clone(),
        metrics.clone(),
        DISTRIBUTE_WORKERS,
        shutdown_rx.clone(),
    );

    // ── Seeds ──────────────────────────────────────────────────
    let discovery = Arc::new(StaticDiscovery::new());
    bootstrap::seed_repository(&repo, &discovery, &config).await?;
    let seed_delta = bootstrap::initial_distribution(&repo, strategy.as_ref()).await;
    if !seed_delta.is_empty() {
        let _ = distribute_tx.send(seed_delta).await;
    }

    // ── Lifecycle loop ─────────────────────────────────────────
    let queue = InMemoryQueue::new();
    let interpreter = Arc::new(Interpreter::new(
        repo.clone(),
        discovery,
        strategy.clone(),
        config.network.funnel_port,
        config.target_resource_templates.clone(),
    ));
    let runner_ctx = RunnerContext {
        interpreter,
        repo: repo.clone(),
        distributor: distributor.clone(),
        distribute_tx: distribute_tx.clone(),
        metrics: metrics.clone(),
    };
    let lifecycle_handle = tokio::spawn(run_lifecycle_loop(
        Arc::new(queue.clone()),
        runner_ctx,
        synthetic_rx,
        shutdown_rx.clone(),
    ));

    // ── Telemetry fan-in ───────────────────────────────────────
    let subscriber = Arc::new(Subscriber::new(
        repo.clone(),
        new_keys_tx,
        suspects_tx.clone(),
    ));
    let subscriber_handle = tokio::spawn(subscriber.run(shutdown_rx.clone()));

    // ── Investigator ───────────────────────────────────────────
    let investigator = Arc::new(Investigator::new(
        repo.clone(),
        synthetic_tx,
        metrics.clone(),
        InvestigatorConfig {
            base_delay: config.investigation_base_delay(),
            max_delay: config.investigation_max_delay(),
            max_retries: config.max_investigating_retries,
            probe_timeout: config.command_timeout(),
        },
    ));
    let investigator_handle = tokio::spawn(investigator.run(suspects_rx, shutdown_rx.clone()));

    // ── New-key drain ──────────────────────────────────────────
    let key_metrics = metrics.clone();
    let mut key_shutdown = shutdown_rx.clone();
    let keys_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = key_shutdown.changed() => break,
                new_key = new_keys_rx.recv() => {
                    let Some(new_key) = new_key else { break };
                    key_metrics.record_new_key();
                    info!(flask = %new_key.flask, key = %new_key.key.name, "new telemetry key");
                }
            }
        }
    });

    // ── Admin HTTP ─────────────────────────────────────────────
    let router = build_router(ApiState {
        repo,
        strategy,
        distribute_tx,
        metrics,
        queue: Some(queue),
    });

    let port = port_override.unwrap_or(config.network.port);
    let listener =
        tokio::net::TcpListener::bind((config.network.host.as_str(), port)).await?;
    info!(host = %config.network.host, port, "admin server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Every loop stops at its next suspension point.
    let _ = lifecycle_handle.await;
    let _ = subscriber_handle.await;
    let _ = investigator_handle.await;
    let _ = keys_handle.await;
    let _ = distribute_handle.await;

    info!("chemist stopped");
    Ok(())
}
