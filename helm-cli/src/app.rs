use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use helm_config::{load_config, AppConfig};
use helm_events::EventBus;
use tracing::info;

use crate::runtime::{Collaborators, ControlPlane, ShutdownSignal};
use crate::state;
use crate::telemetry::{init_tracing, parse_forward_level, LogForwarding};

#[derive(Parser)]
#[command(author, version, about = "Helm trading control plane")]
pub struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane until interrupted
    Serve(ServeArgs),
    /// Inspect persisted runtime state
    State {
        #[command(subcommand)]
        action: StateCommand,
    },
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// Print a summary of the persisted state snapshot
    Inspect(StateInspectArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Overrides `server.ws_addr`
    #[arg(long)]
    ws_addr: Option<String>,
    /// Overrides `server.http_addr`
    #[arg(long)]
    http_addr: Option<String>,
}

#[derive(Args)]
pub struct StateInspectArgs {
    /// Path to the snapshot file (defaults to `state.path`)
    #[arg(long)]
    path: Option<PathBuf>,
    /// Emit the raw JSON snapshot
    #[arg(long)]
    raw: bool,
}

impl ServeArgs {
    fn apply(self, config: &mut AppConfig) {
        if let Some(addr) = self.ws_addr {
            config.server.ws_addr = addr;
        }
        if let Some(addr) = self.http_addr {
            config.server.http_addr = addr;
        }
    }
}

impl StateInspectArgs {
    fn resolved_path(&self, config: &AppConfig) -> PathBuf {
        self.path.clone().unwrap_or_else(|| config.state.path.clone())
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(Some(&cli.env)).context("failed to load configuration")?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });

    let bus = EventBus::new(config.bus.history_limit);
    let forward = match &cli.command {
        Commands::Serve(_) => parse_forward_level(&config.telemetry.forward_level)?
            .map(|level| LogForwarding {
                bus: bus.clone(),
                level,
            }),
        Commands::State { .. } => None,
    };
    let log_path = match &cli.command {
        Commands::Serve(_) => config.telemetry.log_path.clone(),
        Commands::State { .. } => None,
    };
    init_tracing(&filter, log_path.as_deref(), forward).context("failed to initialize logging")?;

    match cli.command {
        Commands::Serve(args) => {
            args.apply(&mut config);
            serve(config, bus).await?
        }
        Commands::State {
            action: StateCommand::Inspect(args),
        } => state::inspect_state(args.resolved_path(&config), args.raw).await?,
    }

    Ok(())
}

async fn serve(config: AppConfig, bus: EventBus) -> Result<()> {
    let collaborators = Collaborators::paper(&config.paper);
    let plane = ControlPlane::start(&config, collaborators, bus, ShutdownSignal::with_ctrl_c())
        .await
        .context("failed to start control plane")?;
    info!(
        ws = %plane.ws_addr(),
        http = %plane.http_addr(),
        "control plane ready"
    );
    plane.run_until_shutdown().await
}
