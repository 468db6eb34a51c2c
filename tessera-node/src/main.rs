//! Tessera node entry point.
//!
//! ```text
//! tessera-node                   Run with tessera-node.toml (or defaults)
//! tessera-node --config <path>   Load a custom config TOML
//! tessera-node --role source     Override the configured role
//! tessera-node --gen-config      Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessera_node::config::{NodeConfig, NodeRole};
use tessera_node::service::NodeService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tessera-node", about = "Tessera distributed compositing node")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tessera-node.toml")]
    config: PathBuf,

    /// Role to run, overriding the configuration.
    #[arg(long, value_enum)]
    role: Option<NodeRole>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&NodeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let mut config = NodeConfig::load(&cli.config);
    if let Some(role) = cli.role {
        config.node.role = role;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::File::create(&config.logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }

    info!("tessera-node v{}", env!("CARGO_PKG_VERSION"));
    info!("node id: {}", config.node.id);
    info!("role: {:?}", config.node.role);
    match config.node.role {
        NodeRole::Sink => {
            info!("listen port: {}", config.network.listen_port);
            info!("inputs per frame: {}", config.compositing.inputs);
        }
        NodeRole::Source => {
            info!("peers: {}", config.network.peers.len());
            info!("frame: {}x{}", config.frame.width, config.frame.height);
        }
    }

    let service = NodeService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
