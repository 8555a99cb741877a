//! Swarm Trainer - decentralized collaborative training peer
//!
//! This is the main entry point for the swarm-trainer binary.
//! A peer joins the directory, accumulates gradients with its local
//! trainer and averages them with whichever peers are alive at each step.

mod averaging;
mod cli;
mod config;
mod coordinator;
mod dht;
mod error;
mod logging;
mod matchmaking;
mod monitor;
mod peer;
mod protocol;
mod service;
mod transport;
mod version;

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::averaging::{AllReduceEngine, EngineConfig};
use crate::cli::{Cli, Commands};
use crate::config::{PeerSettings, SwarmConfig, TelemetrySettings};
use crate::coordinator::{
    spawn_consumer, ChannelSink, CoordinatorConfig, NullSink, StateSync, StepCoordinator,
    SyntheticConfig, SyntheticTrainer, TelemetrySink,
};
use crate::dht::{DhtConfig, DhtNode, PeerId};
use crate::error::{Error, Result};
use crate::logging::LogGuards;
use crate::matchmaking::{Matchmaker, MatchmakerConfig};
use crate::monitor::{MonitorConfig, TrainingMonitor};
use crate::peer::{LivenessTracker, TrackerConfig};
use crate::service::PeerService;
use crate::transport::{TcpTransport, Transport};

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // For commands that don't need full logging, use simple setup
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        _ => {}
    }

    let config_path = match &cli.command {
        Commands::Run { config, .. } | Commands::Monitor { config, .. } => config.clone(),
        _ => None,
    };

    let config = match load_with_overrides(config_path.as_deref(), &cli.command) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = init_logging_from_config(&config, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting Swarm Trainer"
    );

    let result = match cli.command {
        Commands::Run { .. } => run_trainer(config),
        Commands::Monitor { .. } => run_monitor(config),
        Commands::Version | Commands::Config { .. } => {
            // Already handled above
            unreachable!();
        }
    };

    if let Err(e) = result {
        error!("{}", e.format_for_log());
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }

    Ok(())
}

/// Load configuration and apply command-line overrides
fn load_with_overrides(path: Option<&str>, command: &Commands) -> Result<SwarmConfig> {
    let mut config = SwarmConfig::load(path)?;

    let overrides = match command {
        Commands::Run { port, initial_peers, .. } => Some((*port, initial_peers)),
        Commands::Monitor { initial_peers, .. } => Some((None, initial_peers)),
        _ => None,
    };
    if let Some((port, initial_peers)) = overrides {
        if let Some(port) = port {
            config.peer.listen_port = port;
        }
        if !initial_peers.is_empty() {
            config.peer.initial_peers = initial_peers.clone();
        }
        config.validate()?;
    }

    Ok(config)
}

/// Initialize logging from configuration
fn init_logging_from_config(config: &SwarmConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    logging::init_logging(&config.logging, verbose, quiet)
}

/// Build the async runtime and run `future` on it
fn block_on<F>(config: &SwarmConfig, future: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(config.worker_threads())
        .thread_name("swarm-trainer")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(future)
}

/// Run a training peer until ctrl-c or a local compute failure
fn run_trainer(config: SwarmConfig) -> Result<()> {
    info!(
        run_id = %config.averaging.run_id,
        target_batch_size = config.training.target_batch_size,
        target_group_size = config.averaging.target_group_size,
        weighting = ?config.averaging.weighting,
        client_mode = config.peer.client_mode,
        "Configuration loaded"
    );

    block_on(&config, async_trainer_main(config.clone()))
}

/// Run the passive monitor until ctrl-c
fn run_monitor(config: SwarmConfig) -> Result<()> {
    info!(
        run_id = %config.averaging.run_id,
        refresh_period_ms = config.monitor.refresh_period_ms,
        "Configuration loaded"
    );

    block_on(&config, async_monitor_main(config.clone()))
}

/// Bind the transport and join the directory
async fn join_directory(config: &SwarmConfig) -> Result<(Arc<TcpTransport>, Arc<DhtNode>)> {
    let peer_id = resolve_identity(&config.peer)?;
    let (bind_addr, announce) = listen_addresses(&config.peer)?;

    let transport = Arc::new(TcpTransport::bind(peer_id, bind_addr, announce).await?);
    let dht = DhtNode::new(
        transport.clone(),
        DhtConfig::from_settings(&config.dht, config.peer.request_timeout()),
    );

    info!(
        peer_id = %peer_id,
        name = %peer_name(&config.peer),
        addr = %transport.local_contact().addr,
        "Peer identity ready"
    );
    Ok((transport, dht))
}

async fn bootstrap(config: &SwarmConfig, dht: &DhtNode) -> Result<()> {
    let initial = config.peer.bootstrap_peers()?;
    if initial.is_empty() {
        info!("No initial peers configured, starting a new swarm");
        return Ok(());
    }

    let reached = dht.bootstrap(&initial).await;
    if reached == 0 {
        warn!(
            initial_peers = initial.len(),
            "No initial peer answered; will keep retrying in the background"
        );
    } else {
        info!(reached = reached, known_peers = dht.peer_count(), "Joined the swarm");
    }
    Ok(())
}

/// Async trainer main loop
async fn async_trainer_main(config: SwarmConfig) -> Result<()> {
    let (transport, dht) = join_directory(&config).await?;
    let engine = AllReduceEngine::new(transport.clone(), EngineConfig::from_settings(&config.averaging));
    let state = StateSync::new(transport.clone(), config.peer.request_timeout());
    transport.serve(PeerService::new(dht.clone(), engine.clone(), state.clone()))?;
    bootstrap(&config, &dht).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = dht.spawn_maintenance(shutdown_rx.clone());

    let tracker = LivenessTracker::new(TrackerConfig::from_config(&config), dht.clone());
    let tracker_task = tracker.spawn(shutdown_rx.clone());

    let telemetry = telemetry_sink(&config.telemetry);
    let matchmaker = Matchmaker::new(MatchmakerConfig::from_settings(&config.averaging), dht.clone());
    let trainer = SyntheticTrainer::new(SyntheticConfig::from_settings(&config.training));
    let coordinator = StepCoordinator::new(
        CoordinatorConfig::from_config(&config),
        Box::new(trainer),
        tracker.clone(),
        matchmaker,
        engine,
        state,
        telemetry,
    );
    let mut training = tokio::spawn(coordinator.clone().run(shutdown_rx));

    // Set up graceful shutdown on Ctrl+C
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let mut status_timer = tokio::time::interval(status_interval(&config));
    status_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    status_timer.tick().await;

    info!("Trainer event loop started");

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break Ok(());
            }

            joined = &mut training => {
                break match joined {
                    Ok(result) => result,
                    Err(e) => Err(Error::Internal(format!("training task failed: {}", e))),
                };
            }

            _ = status_timer.tick() => {
                let status = coordinator.status();
                info!(
                    step = status.local_step,
                    state = %status.state,
                    loss = ?status.last_loss,
                    group_size = ?status.last_group_size,
                    peers = tracker.registry().peer_count(),
                    samples = status.samples_accumulated,
                    "Training status"
                );
            }
        }
    };

    let _ = shutdown_tx.send(true);
    if !training.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut training).await;
    }
    let _ = tracker_task.await;
    let _ = maintenance.await;

    let status = coordinator.status();
    info!(
        step = status.local_step,
        rounds_completed = status.rounds_completed,
        rounds_failed = status.rounds_failed,
        "Trainer shutting down"
    );
    outcome
}

/// Async monitor main loop
async fn async_monitor_main(config: SwarmConfig) -> Result<()> {
    let (transport, dht) = join_directory(&config).await?;
    transport.serve(PeerService::directory_only(dht.clone()))?;
    bootstrap(&config, &dht).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = dht.spawn_maintenance(shutdown_rx.clone());

    // Read-only: the monitor's tracker never reports progress
    let tracker = LivenessTracker::new(TrackerConfig::from_config(&config), dht);
    let monitor = TrainingMonitor::new(
        MonitorConfig::from_config(&config),
        tracker,
        telemetry_sink(&config.telemetry),
    );
    let monitoring = tokio::spawn(monitor.run(shutdown_rx));

    info!("Monitor started");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for the shutdown signal");
    }
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = monitoring.await;
    let _ = maintenance.await;
    Ok(())
}

/// Telemetry sink from settings; the consumer runs until every sender is gone
fn telemetry_sink(settings: &TelemetrySettings) -> Arc<dyn TelemetrySink> {
    if !settings.enabled {
        return Arc::new(NullSink);
    }
    let (sink, rx) = ChannelSink::new(settings.queue_size);
    spawn_consumer(rx, settings.file.as_ref().map(PathBuf::from));
    Arc::new(sink)
}

fn status_interval(config: &SwarmConfig) -> Duration {
    Duration::from_millis(config.monitor.refresh_period_ms).max(Duration::from_secs(1))
}

/// Fixed, persisted or fresh peer identity
fn resolve_identity(settings: &PeerSettings) -> Result<PeerId> {
    if let Some(ref id) = settings.id {
        return id
            .parse()
            .map_err(|e: String| Error::config_field_invalid("peer.id", e));
    }

    let Some(ref path) = settings.identity_path else {
        return Ok(PeerId::random());
    };
    let path = Path::new(path);

    if path.exists() {
        let raw = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let id = raw
            .trim()
            .parse()
            .map_err(|e: String| Error::config_field_invalid("peer.identity_path", e))?;
        debug!(path = %path.display(), "Loaded peer identity");
        return Ok(id);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let id = PeerId::random();
    fs::write(path, id.to_hex()).map_err(|e| Error::IoWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    info!(path = %path.display(), "Generated new peer identity");
    Ok(id)
}

/// Bind address and optional advertised address
fn listen_addresses(settings: &PeerSettings) -> Result<(SocketAddr, Option<SocketAddr>)> {
    let bind = format!("{}:{}", settings.listen_host, settings.listen_port)
        .parse::<SocketAddr>()
        .map_err(|e| Error::config_field_invalid("peer.listen_host", e.to_string()))?;
    let announce = settings
        .announce_addr
        .as_deref()
        .map(|a| {
            a.parse::<SocketAddr>()
                .map_err(|e| Error::config_field_invalid("peer.announce_addr", e.to_string()))
        })
        .transpose()?;
    Ok((bind, announce))
}

/// Configured name, or the hostname
fn peer_name(settings: &PeerSettings) -> String {
    settings.name.clone().unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "swarm-peer".to_string())
    })
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: cli::ConfigSubcommand) -> Result<()> {
    use cli::ConfigSubcommand;

    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = SwarmConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => match SwarmConfig::load(config.as_deref()) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PeerSettings {
            identity_path: Some(dir.path().join("keys/identity").to_string_lossy().into_owned()),
            ..Default::default()
        };

        let first = resolve_identity(&settings).unwrap();
        let second = resolve_identity(&settings).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fixed_identity_wins() {
        let id = PeerId::random();
        let settings = PeerSettings {
            id: Some(id.to_hex()),
            identity_path: Some("/nonexistent/identity".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_identity(&settings).unwrap(), id);
    }

    #[test]
    fn test_listen_addresses() {
        let settings = PeerSettings {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 4000,
            announce_addr: Some("203.0.113.7:31337".to_string()),
            ..Default::default()
        };
        let (bind, announce) = listen_addresses(&settings).unwrap();
        assert_eq!(bind.port(), 4000);
        assert_eq!(announce.unwrap().port(), 31337);

        let broken = PeerSettings {
            listen_host: "not a host".to_string(),
            ..Default::default()
        };
        assert!(listen_addresses(&broken).is_err());
    }
}
