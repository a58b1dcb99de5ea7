//! Onion Manager
//!
//! Runs a local Tor daemon and reports when an anonymized path is ready.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use manager::config::{default_config_path, Config};
use manager::delegate::{ChannelDelegate, ConnectionEvent};
use manager::orchestrator::{ConnectionOrchestrator, OrchestratorEvent};
use manager::session::SessionHandle;
use manager::torrc::TorConfiguration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Onion Manager - supervises a local Tor daemon.
#[derive(Parser, Debug)]
#[command(name = "onion-manager")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and wait for a circuit
    Run {
        /// Fetch this URL through the proxy once connected
        #[arg(long, value_name = "URL")]
        probe_url: Option<String>,

        /// Print connection events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print the daemon command line without starting it
    Args,

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Commands::InitConfig { force } = cli.command {
        return init_config(&config_path, force);
    }

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let _guard = init_tracing(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Run { probe_url, json } => run(config, probe_url, json).await,
        Commands::Args => {
            let tor = TorConfiguration::from_settings(&config);
            println!("{}", tor.binary.display());
            for arg in tor.arguments() {
                println!("  {}", arg);
            }
            Ok(())
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

/// Sets up the subscriber. Logs go to stderr, or to `daemon.log_file` when set.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(directory)
                .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Starts the daemon and reports events until a signal or a hard failure.
async fn run(config: Config, probe_url: Option<String>, json: bool) -> anyhow::Result<()> {
    let orchestrator = ConnectionOrchestrator::new(config);

    let mut states = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = states.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {}", state);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let (delegate, mut events) = ChannelDelegate::new();
    orchestrator.start(delegate).await?;

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            signal = &mut shutdown => break signal,
            event = events.recv() => {
                let Some(event) = event else { break Ok(()) };
                print_event(&event, json)?;
                match event {
                    ConnectionEvent::Connected { session } => {
                        if let Some(url) = &probe_url {
                            probe(session, url).await;
                        }
                    }
                    ConnectionEvent::ConnectionError { message } => {
                        break Err(anyhow::anyhow!(message));
                    }
                    _ => {}
                }
            }
        }
    };

    orchestrator.stop().await;
    outcome
}

fn print_event(event: &ConnectionEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        ConnectionEvent::Progress { percent } => println!("Bootstrapped {}%", percent),
        ConnectionEvent::PortsOpened => println!("Control port open"),
        ConnectionEvent::Connected { session } => println!("Connected, proxy at {}", session),
        ConnectionEvent::HandshakeError { message } => eprintln!("Handshake: {}", message),
        ConnectionEvent::ConnectionError { message } => eprintln!("Failed: {}", message),
    }
    Ok(())
}

/// Fetches `url` through the proxy and logs the response status.
async fn probe(session: SessionHandle, url: &str) {
    let client = match session.http_client() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("Failed to build proxied client: {}", e);
            return;
        }
    };
    match client.get(url).send().await {
        Ok(response) => tracing::info!("Probe {} returned {}", url, response.status()),
        Err(e) => tracing::warn!("Probe {} failed: {}", url, e),
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
