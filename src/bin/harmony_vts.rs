//! Command-line entry point for the Harmony Link adapter.

use clap::{Parser, Subcommand};
use harmony_vts::audio::capture::{AudioInput, CpalInput};
use harmony_vts::audio::playback::{AudioOutput, CpalOutput};
use harmony_vts::connector::WebSocketTransport;
use harmony_vts::entity::EntityDeps;
use harmony_vts::lipsync::TracingMouthActuator;
use harmony_vts::session::{EntityFactory, HarmonySession};
use harmony_vts::{HarmonyConfig, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Connects local microphone and speakers to Harmony Link entities.
#[derive(Parser)]
#[command(name = "harmony-vts", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the session until Ctrl+C.
    Run,

    /// List available audio devices.
    Devices,

    /// Write the default configuration to the config path.
    InitConfig,
}

/// Real devices and one WebSocket connection per entity.
struct LiveFactory {
    endpoint: String,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
}

impl EntityFactory for LiveFactory {
    fn deps(&self, entity_id: &str) -> Result<EntityDeps> {
        Ok(EntityDeps {
            transport: Arc::new(WebSocketTransport::new(&self.endpoint)?),
            input: Arc::clone(&self.input),
            output: Arc::clone(&self.output),
            actuator: Arc::new(TracingMouthActuator::new(entity_id)),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("harmony_vts=info,tungstenite=warn")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli
        .config
        .unwrap_or_else(HarmonyConfig::default_config_path);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(load_config(&path)?).await,
        Command::Devices => list_devices(),
        Command::InitConfig => {
            HarmonyConfig::default().save_to_file(&path)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<HarmonyConfig> {
    if path.exists() {
        info!(path = %path.display(), "loading configuration");
        Ok(HarmonyConfig::from_file(path)?)
    } else {
        warn!(path = %path.display(), "no configuration file, using defaults");
        Ok(HarmonyConfig::default())
    }
}

async fn run(config: HarmonyConfig) -> anyhow::Result<()> {
    println!("harmony-vts v{}", env!("CARGO_PKG_VERSION"));

    let factory = LiveFactory {
        endpoint: config.connector.ws_endpoint.clone(),
        input: Arc::new(CpalInput::new(&config.stt.microphone)?),
        output: Arc::new(CpalOutput::new(&config.tts.speaker)?),
    };

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });

    println!("Connecting to {}. Press Ctrl+C to stop.", config.connector.ws_endpoint);
    HarmonySession::new(config, Arc::new(factory))
        .run(cancel)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "session exited with error");
            anyhow::anyhow!("harmony-vts failed: {e}")
        })?;

    info!("shut down cleanly");
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalInput::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalOutput::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
