// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rmesh_config::{RelayConfig, seed_is_valid};
use rmesh_router::{Router, RouterOptions};

/// Environment variable overriding the bridge script location.
const BRIDGE_JS_ENV: &str = "RMESH_BRIDGE_JS";

#[derive(Parser, Debug)]
#[command(name = "rmesh-router", version, about = "Multi-identity overlay relay router")]
struct Cli {
    /// Path to the relay config file.
    #[arg(long, default_value = "relay_config.json")]
    config: PathBuf,

    /// Disable the periodic status printout.
    #[arg(long)]
    no_ui: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

fn binary_on_path(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
}

fn print_status(router: &Router) {
    for node in router.node_snapshots() {
        println!(
            "{:<10} addr:{:<48} in:{} out:{} err:{} queue:{}",
            node.name,
            node.address.as_deref().unwrap_or("—"),
            node.incoming,
            node.outgoing,
            node.errors,
            node.queue_depth,
        );
    }
    for row in router.board().services() {
        println!(
            "{:<12} → node:{:<10} addr:{:<48} status:{}",
            row.service,
            row.assigned_node.as_deref().unwrap_or("—"),
            row.assigned_addr.as_deref().unwrap_or("—"),
            row.status,
        );
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    // Fatal preconditions, checked before any side effects.
    if !binary_on_path("node") {
        bail!("Node.js binary 'node' not found; install Node.js to run the router.");
    }
    if !binary_on_path("git") {
        bail!("git is required for the service watchdog; please install git");
    }

    let config_path = if cli.config.is_absolute() {
        cli.config.clone()
    } else {
        std::env::current_dir()?.join(&cli.config)
    };
    let base_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let cfg = RelayConfig::load_or_create(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    for node in &cfg.nodes {
        if !seed_is_valid(&node.seed_hex) {
            bail!(
                "node '{}' has a malformed seed (expected 64 hex chars)",
                node.name
            );
        }
    }

    let bridge_js = std::env::var_os(BRIDGE_JS_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir.join("bridge-node").join("nkn_bridge.js"));

    let router = Router::new(
        cfg,
        RouterOptions {
            config_path: config_path.clone(),
            base_dir: base_dir.clone(),
            bridge_program: "node".into(),
            bridge_args: vec![bridge_js.display().to_string()],
            bridge_cwd: Some(base_dir),
            open_log_terminals: !cli.no_ui,
            sentinel_path: None,
        },
    )?;

    router
        .ensure_sources()
        .await
        .context("acquiring backend service sources")?;

    if let Some(daemon) = router.daemon_status() {
        info!(target: "rmesh_router", path = %daemon.path, "daemon sentinel present");
    }

    router.start();
    info!(target: "rmesh_router", config = %config_path.display(), "router started");

    // Periodic status lines stand in for the dashboard unless disabled.
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if !cli.no_ui {
                    print_status(&router);
                }
            }
        }
    }

    router.shutdown().await;
    info!(target: "rmesh_router", "clean shutdown");
    Ok(())
}
