//! turntable - relay a capture process to HTTP audio clients
//!
//! Subcommands:
//! - `turntable serve` - Run the relay (default)
//! - `turntable config` - Print the effective configuration

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tableconf::TurntableConfig;
use tracing::{info, warn};
use turntable::backend::CommandBackendFactory;
use turntable::signals::ShutdownSignals;
use turntable::{telemetry, ServerLifecycle};

/// Exit status after a forced exit (128 + SIGINT)
const FORCED_EXIT: i32 = 130;

#[derive(Parser)]
#[command(name = "turntable")]
#[command(about = "Jitter-absorbing relay from a capture process to HTTP audio clients")]
#[command(version)]
struct Cli {
    /// Config file replacing ./turntable.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, global = true)]
    host: Option<String>,

    /// HTTP port to bind
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Capture source node or device
    #[arg(short, long, global = true)]
    target: Option<String>,

    /// Log level or filter directive (e.g. "debug", "info,turntable=trace")
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run the relay
    Serve,
    /// Print the effective configuration as TOML
    Config,
}

impl Cli {
    fn apply(&self, config: &mut TurntableConfig) {
        if let Some(host) = &self.host {
            config.bind.host = host.clone();
        }
        if let Some(port) = self.port {
            config.bind.port = port;
        }
        if let Some(target) = &self.target {
            config.capture.target = Some(target.clone());
        }
        if let Some(level) = &self.log_level {
            config.telemetry.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (mut config, sources) = TurntableConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    cli.apply(&mut config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config => {
            print!("{}", config.to_toml());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve => {
            telemetry::init(&config.telemetry)?;
            for file in &sources.files {
                info!("📄 Loaded config from {}", file.display());
            }
            if !sources.env_overrides.is_empty() {
                info!("Environment overrides: {}", sources.env_overrides.join(", "));
            }
            let code = serve(config).await;
            telemetry::shutdown();
            code
        }
    }
}

async fn serve(config: TurntableConfig) -> Result<ExitCode> {
    info!("🎵 turntable {} starting", env!("CARGO_PKG_VERSION"));

    let force_exit = config.force_exit();
    let factory = Arc::new(CommandBackendFactory::new(config.capture.clone()));
    let lifecycle = Arc::new(ServerLifecycle::new(config, factory));
    let mut signals = ShutdownSignals::install().context("Failed to install signal handlers")?;

    let interrupt = async {
        let name = signals.recv().await;
        warn!("{} during start-up", name);
    };
    let started = lifecycle
        .start_until(interrupt)
        .await
        .context("Failed to start relay")?;
    if started.is_none() {
        return Ok(ExitCode::from(FORCED_EXIT as u8));
    }

    signals.recv().await;

    tokio::select! {
        _ = lifecycle.shutdown() => {}
        _ = signals.recv() => {
            warn!("Second signal, exiting immediately");
            std::process::exit(FORCED_EXIT);
        }
        _ = tokio::time::sleep(force_exit) => {
            warn!("Shutdown exceeded {:?}, forcing exit", force_exit);
            std::process::exit(FORCED_EXIT);
        }
    }

    Ok(ExitCode::SUCCESS)
}
