//! flannel-glue hook entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use tokio::signal;
use tokio::sync::watch;

use flannel_glue::command::{CommandRunner, SystemRunner};
use flannel_glue::config::FigmentStore;
use flannel_glue::etcd::{CoordinationEndpoint, CoordinationStore, EtcdClient};
use flannel_glue::peer::RelationChannel;
use flannel_glue::{Event, Orchestrator, RunOutcome};

/// Bootstraps flannel overlay networking for the local container runtime
#[derive(Parser)]
#[command(name = "flannel-glue")]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Hook event being delivered
    #[arg(value_enum)]
    event: Hook,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Hook {
    ConfigChanged,
    DbRelationChanged,
    #[value(alias = "network-relation-joined")]
    NetworkRelationChanged,
}

impl From<Hook> for Event {
    fn from(hook: Hook) -> Self {
        match hook {
            Hook::ConfigChanged => Event::ConfigChanged,
            Hook::DbRelationChanged => Event::PeerDataChanged,
            Hook::NetworkRelationChanged => Event::NetworkPeersChanged,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose > 0 { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // Load configuration
    let store = FigmentStore::load(cli.config.as_deref());
    let settings = store.settings()?;
    info!("Starting flannel-glue for {:?} with config: {:?}", cli.event, settings);

    // Graceful shutdown stops the lease wait
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        }
    });

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let peers = Arc::new(RelationChannel::new(runner.clone()));
    let connect = Arc::new(|endpoint: &CoordinationEndpoint| {
        Arc::new(EtcdClient::new(endpoint.clone())) as Arc<dyn CoordinationStore>
    });

    let mut orchestrator =
        Orchestrator::new(settings, Arc::new(store), runner, peers, connect, shutdown_rx)?;

    let event = Event::from(cli.event);
    match orchestrator.handle(event).await {
        Ok(RunOutcome::Skipped(reason)) => info!("{}: nothing to do ({})", event, reason),
        Ok(outcome) => info!("{} complete: {:?}", event, outcome),
        Err(e) => {
            if e.is_retryable() {
                warn!("{} did not finish and will be retried on the next event: {}", event, e);
            }
            return Err(e).with_context(|| format!("{event} failed"));
        }
    }

    Ok(())
}
