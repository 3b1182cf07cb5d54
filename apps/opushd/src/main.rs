//! `opushd`: OBEX object push daemon.
//!
//! `opushd [serve]` listens for inbound pushes; `opushd send <addr> <file>...`
//! pushes files to a peer as one batch and exits when every file is done.

mod config;
mod confirm;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use opush_coordinator::{Coordinator, CoordinatorEvent, Services};
use opush_files::FsResolver;
use opush_obex::{TcpConnector, TcpTransportListener};
use opush_share::{MemoryRepository, NewShare, ShareId, ShareRepository};

use config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "opushd", version, about = "OBEX object push daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Listen for inbound pushes (the default)
    Serve,
    /// Push files to a peer as one batch
    Send {
        #[arg(help = "Peer address as host:port")]
        destination: String,
        #[arg(required = true, help = "Files to send")]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::load()?;
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Send { destination, files } => send(config, &destination, &files).await,
    }
}

fn services(config: &DaemonConfig, repo: Arc<MemoryRepository>) -> Services {
    let mut resolver = FsResolver::new(&config.inbound_dir);
    if let Some(limit) = config.max_inbound_bytes {
        resolver = resolver.with_max_inbound_bytes(limit);
    }
    Services::new(repo, Arc::new(resolver), Arc::new(TcpConnector))
        .with_policy(config.policy.clone())
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    let repo = Arc::new(MemoryRepository::new());
    let listener = TcpTransportListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        name = %config.name,
        addr = %listener.local_addr()?,
        inbound_dir = %config.inbound_dir.display(),
        auto_accept = config.auto_accept,
        config = %config.file_path().display(),
        "opushd listening"
    );

    let coordinator = Coordinator::start(services(&config, repo.clone()), config.coordinator());
    let events = tokio::spawn(log_events(coordinator.take_events().await));
    let confirmer = tokio::spawn(confirm::run(repo.clone(), config.auto_accept));

    tokio::select! {
        _ = coordinator.serve(listener) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupted, shutting down");
        }
    }

    confirmer.abort();
    coordinator.shutdown().await;
    events.abort();
    Ok(())
}

async fn send(config: DaemonConfig, destination: &str, files: &[PathBuf]) -> anyhow::Result<()> {
    let repo = Arc::new(MemoryRepository::new());
    let timestamp = chrono::Utc::now().timestamp_millis();
    let mut ids = Vec::with_capacity(files.len());
    for file in files {
        let path = std::path::absolute(file)
            .with_context(|| format!("invalid path {}", file.display()))?;
        let share = NewShare::outbound(path.to_string_lossy(), destination, timestamp);
        ids.push(repo.insert(share)?);
    }

    let coordinator = Coordinator::start(services(&config, repo.clone()), config.coordinator());
    let events = tokio::spawn(log_events(coordinator.take_events().await));

    let finished = tokio::select! {
        result = wait_terminal(repo.as_ref(), &ids) => Some(result?),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            None
        }
    };
    coordinator.shutdown().await;
    events.abort();

    let Some(()) = finished else {
        bail!("interrupted");
    };
    let mut failed = 0;
    for (id, file) in ids.iter().zip(files) {
        let Some(share) = repo.get(*id)? else {
            continue;
        };
        if share.status.is_success() {
            info!(share_id = id, file = %file.display(), "sent");
        } else {
            warn!(share_id = id, file = %file.display(), status = ?share.status, code = share.status.code(), "not sent");
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} files were not sent", files.len());
    }
    Ok(())
}

/// Waits until every share in `ids` reaches a terminal status.
async fn wait_terminal(repo: &dyn ShareRepository, ids: &[ShareId]) -> anyhow::Result<()> {
    let mut changes = repo.subscribe();
    loop {
        let mut done = true;
        for id in ids {
            if let Some(share) = repo.get(*id)?
                && !share.status.is_terminal()
            {
                done = false;
                break;
            }
        }
        if done {
            return Ok(());
        }
        changes
            .changed()
            .await
            .context("share repository closed")?;
    }
}

async fn log_events(events: Option<mpsc::Receiver<CoordinatorEvent>>) {
    let Some(mut events) = events else {
        return;
    };
    while let Some(event) = events.recv().await {
        match event {
            CoordinatorEvent::BatchStarted {
                batch_id,
                direction,
                destination,
            } => info!(batch_id, ?direction, peer = %destination, "batch started"),
            CoordinatorEvent::BatchFinished {
                batch_id,
                direction,
                state,
            } => info!(batch_id, ?direction, ?state, "batch finished"),
            CoordinatorEvent::IncomingAccepted { peer } => info!(%peer, "connection accepted"),
            CoordinatorEvent::IncomingQueued { peer, attempt } => {
                info!(%peer, attempt, "connection queued")
            }
            CoordinatorEvent::IncomingRejected { peer } => warn!(%peer, "connection rejected"),
            CoordinatorEvent::MediaScanned { share_id, indexed } => {
                info!(share_id, indexed, "media scan finished")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_command_means_serve() {
        let cli = Cli::try_parse_from(["opushd"]).unwrap();
        assert_eq!(cli.command, None);
        let cli = Cli::try_parse_from(["opushd", "serve"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Serve));
    }

    #[test]
    fn send_takes_destination_and_files() {
        let cli = Cli::try_parse_from(["opushd", "send", "10.0.0.2:650", "a.txt", "b.png"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Send {
                destination: "10.0.0.2:650".into(),
                files: vec![PathBuf::from("a.txt"), PathBuf::from("b.png")],
            })
        );
    }

    #[test]
    fn send_without_files_is_rejected() {
        assert!(Cli::try_parse_from(["opushd", "send", "10.0.0.2:650"]).is_err());
        assert!(Cli::try_parse_from(["opushd", "send"]).is_err());
        assert!(Cli::try_parse_from(["opushd", "bogus"]).is_err());
    }
}
