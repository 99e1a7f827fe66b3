use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use qshare_core::{FileOutcome, Node, QShareConfig, TransferSummary};

#[derive(Parser, Debug)]
#[command(name = "qshare", version, about = "QShare - quick LAN file transfer")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory holding config.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Name to announce instead of the configured one
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a config file with the current settings
    Init {
        /// Directory received files are saved in
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },

    /// Listen for announcements and list the peers found
    Discover {
        /// How long to listen, in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send files to a discovered peer
    Send {
        /// Name the peer announces itself as
        #[arg(long)]
        to: String,

        /// How long to wait for the peer to be discovered, in seconds
        #[arg(long, default_value_t = 3)]
        wait: u64,

        /// Files to send, in order
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Receive files until Ctrl+C
    Receive {
        /// Output directory for received files
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".qshare")
    });
    let config_path = data_dir.join("config.json");

    let mut cfg = QShareConfig::load_or_default(&config_path)?;
    tracing::debug!("Loaded config from {}", config_path.display());
    if let Some(name) = cli.name {
        cfg.device_name = name;
    }

    match cli.cmd {
        Commands::Init { save_dir } => {
            if let Some(dir) = save_dir {
                cfg.save_dir = dir;
            }
            cfg.save(&config_path)?;

            println!("✓ Config written to {}", config_path.display());
            println!("  Device name: {}", cfg.device_name);
            println!("  Save directory: {}", cfg.save_dir.display());
            println!("  Ports: discovery {}, transfer {}", cfg.discovery_port, cfg.transfer_port);
            println!("  Key fingerprint: {}", cfg.key().fingerprint());
        }

        Commands::Discover { timeout, json } => {
            discover_devices(cfg, timeout, json).await?;
        }

        Commands::Send { to, wait, paths } => {
            send_files(cfg, &to, wait, &paths).await?;
        }

        Commands::Receive { output } => {
            let output_dir = output.unwrap_or_else(|| cfg.save_dir.clone());
            receive_files(cfg, &output_dir).await?;
        }
    }

    Ok(())
}

async fn discover_devices(cfg: QShareConfig, timeout: u64, json: bool) -> Result<()> {
    let own_name = cfg.device_name.clone();
    let node = Node::start(cfg).await.context("Failed to start discovery")?;

    tokio::time::sleep(Duration::from_secs(timeout)).await;
    let peers: Vec<_> = node
        .discover()
        .into_iter()
        .filter(|p| p.name != own_name)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&peers)?);
    } else if peers.is_empty() {
        println!("No devices found.");
    } else {
        println!("Discovered {} device(s):", peers.len());
        for (i, peer) in peers.iter().enumerate() {
            println!("  {}. {} @ {}", i + 1, peer.name, peer.addr);
        }
    }

    node.shutdown();
    Ok(())
}

async fn send_files(cfg: QShareConfig, target: &str, wait: u64, paths: &[PathBuf]) -> Result<()> {
    let node = Node::start(cfg).await.context("Failed to start discovery")?;

    println!("Looking for {}...", target);
    let addr = node
        .wait_for_peer(target, Duration::from_secs(wait))
        .await
        .ok_or_else(|| anyhow::anyhow!("Device '{}' not found on the network", target))?;
    println!("✓ Found {} at {}", target, addr);

    let summary = node.send(paths, target).await?;
    print_summary(&summary);

    node.shutdown();
    Ok(())
}

fn print_summary(summary: &TransferSummary) {
    for report in &summary.files {
        match &report.outcome {
            FileOutcome::Sent { bytes } => {
                println!("✓ Sent {} ({} bytes)", report.path.display(), bytes)
            }
            FileOutcome::Truncated { read, declared } => println!(
                "! Sent {} incomplete ({} of {} bytes read)",
                report.path.display(),
                read,
                declared
            ),
            FileOutcome::Skipped(reason) => {
                println!("✗ Skipped {}: {:?}", report.path.display(), reason)
            }
        }
    }
    println!(
        "{} of {} file(s) sent to {}, {} bytes",
        summary.sent_count(),
        summary.files.len(),
        summary.peer,
        summary.bytes
    );
}

async fn receive_files(cfg: QShareConfig, output_dir: &Path) -> Result<()> {
    let node = Node::start(cfg).await.context("Failed to start discovery")?;
    let serving = node.spawn_serve(output_dir).await?;

    println!(
        "✓ Ready to receive files as '{}' on {}",
        node.config().device_name,
        serving.local_addr()
    );
    println!("  Files will be saved in: {}", output_dir.display());
    println!("  Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nStopping receiver...");
    serving.cancel_serve().await?;

    node.shutdown();
    Ok(())
}
