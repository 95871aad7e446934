//! fleetdock Server
//!
//! Keeps a fleet of agent threads (git worktree + tmux sessions) alive and
//! serves the control socket.

mod agent_trust;
mod ai_naming;
mod cmd_install_hooks;
mod cmd_status;
mod completion;
mod config;
mod control;
mod error;
mod git;
mod health;
mod lifecycle;
mod logging;
mod mux;
mod naming;
mod orchestrator;
mod pane_classifier;
mod paths;
mod persistence;
mod process;
mod reconcile;
mod recreate;
mod rename;
mod sections;
mod session_names;
mod session_naming;
mod state;
mod tabs;
#[cfg(test)]
mod testing;
mod thread;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai_naming::CommandSlugGenerator;
use crate::config::Settings;
use crate::control::ControlContext;
use crate::git::GitCli;
use crate::health::MuxHealth;
use crate::mux::TmuxCli;
use crate::orchestrator::{Collaborators, FleetEvent, Orchestrator};
use crate::persistence::{PersistenceCollaborator, SqliteStore};
use crate::reconcile::ReconciliationLoop;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Self-healing worktree + tmux fleets for AI coding agents
#[derive(Parser)]
#[command(name = "fleetdock")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory (default: ~/.fleetdock)
    #[arg(long, global = true, env = "FLEETDOCK_DATA_DIR", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Start {
        /// Control socket path (default: <data dir>/control.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Import a settings JSON file, replacing the stored settings
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Check whether the server is running
    Status {
        /// Control socket path (default: <data dir>/control.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },
    /// Add the completion hook to the agent's settings file
    InstallHooks {
        /// Settings file to edit (default: ~/.claude/settings.json)
        #[arg(long, value_name = "FILE")]
        settings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Start { socket, config } => {
            let socket = socket.unwrap_or_else(paths::socket_path);
            start(&data_dir, &socket, config.as_deref()).await
        }
        Commands::Status { socket } => {
            let socket = socket.unwrap_or_else(paths::socket_path);
            cmd_status::run(&data_dir, &socket).await
        }
        Commands::InstallHooks { settings } => cmd_install_hooks::run(settings.as_deref()),
    }
}

async fn start(data_dir: &Path, socket: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let logging = logging::init_logging(&paths::log_dir())?;
    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        version = VERSION,
        data_dir = %data_dir.display(),
        "Starting fleetdock"
    );

    let pid_path = paths::pid_file_path();
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let store = Arc::new(SqliteStore::open(&paths::db_path())?);
    let settings = match config {
        Some(path) => {
            let settings: Settings = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            store.save_settings(&settings).await?;
            info!(
                component = "server",
                event = "server.settings_imported",
                path = %path.display(),
                projects = settings.projects.len(),
                "Imported settings file"
            );
            settings
        }
        None => store.load_settings().await?.unwrap_or_default(),
    };
    let threads = store.load_threads().await?;

    let collaborators = Collaborators {
        git: Arc::new(GitCli::default()),
        mux: Arc::new(TmuxCli::new(
            settings.tmux_socket.clone(),
            paths::completion_log_path(),
        )),
        store,
        slugger: Arc::new(CommandSlugGenerator::new(settings.slug_command.clone())),
    };
    let orchestrator = Orchestrator::new(collaborators, settings, threads);
    orchestrator.restore().await?;

    let health = MuxHealth::new(Arc::clone(&orchestrator));
    let cancel = CancellationToken::new();
    tokio::spawn(log_events(orchestrator.subscribe(), cancel.clone()));
    let reconcile = tokio::spawn(
        ReconciliationLoop::new(Arc::clone(&orchestrator), Arc::clone(&health)).run(cancel.clone()),
    );

    let ctx = Arc::new(ControlContext {
        orchestrator,
        health,
    });
    let mut server = tokio::spawn({
        let socket = socket.to_path_buf();
        let cancel = cancel.clone();
        async move { control::serve(ctx, &socket, cancel).await }
    });

    let served = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server => Some(result),
    };
    info!(
        component = "server",
        event = "server.stopping",
        "Shutting down"
    );
    cancel.cancel();

    if let Err(e) = reconcile.await {
        warn!(component = "server", event = "server.reconcile_join_failed", error = %e);
    }
    let served = match served {
        Some(result) => result,
        None => server.await,
    };
    let _ = std::fs::remove_file(&pid_path);
    served??;
    Ok(())
}

/// Record fleet events in the server log. Delivery to the user (banners,
/// sounds) belongs to whichever client subscribes.
async fn log_events(mut events: broadcast::Receiver<FleetEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(FleetEvent::ThreadsChanged) => {}
            Ok(event) => info!(
                component = "events",
                event = "events.fleet",
                detail = ?event,
                "Fleet event"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(
                component = "events",
                event = "events.lagged",
                skipped,
                "Event logger fell behind"
            ),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(component = "server", event = "server.sigterm_unavailable", error = %e);
            let _ = ctrl_c.await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = term.recv() => {}
    }
}
