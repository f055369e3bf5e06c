// SPDX-License-Identifier: MIT OR Apache-2.0
//! The supervisor that wires identities, sidecars, workers, and the watchdog.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use rmesh_config::{DaemonSentinel, RelayConfig, SentinelInfo};
use rmesh_http::HttpTuning;
use rmesh_node::{AssignmentLookup, NodeSettings, NodeSnapshot, RelayNode};
use rmesh_sidecar::{SidecarConfig, SidecarSupervisor};
use rmesh_watchdog::{ServiceWatchdog, WatchdogConfig, default_definitions};

use super::assignment::AssignmentRouter;
use super::status::{ServiceStatusRow, StatusBoard};

/// How often the watchdog and identities are sampled onto the status board.
const STATUS_SAMPLE_EVERY: Duration = Duration::from_secs(5);

/// Errors from router construction.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The config declares no identities.
    #[error("no relay identities configured")]
    NoNodes,

    /// Config persistence failure.
    #[error(transparent)]
    Config(#[from] rmesh_config::ConfigError),

    /// Watchdog setup failure.
    #[error(transparent)]
    Watchdog(#[from] rmesh_watchdog::WatchdogError),
}

/// Everything the router needs beyond the config file.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Where the config lives (rewritten on assignment changes).
    pub config_path: PathBuf,
    /// Base directory for watchdog state and logs.
    pub base_dir: PathBuf,
    /// Program that runs the overlay bridge, e.g. `node`.
    pub bridge_program: String,
    /// Arguments for the bridge program, e.g. the bridge script path.
    pub bridge_args: Vec<String>,
    /// Working directory for bridge children.
    pub bridge_cwd: Option<PathBuf>,
    /// Open detached terminals tailing service logs.
    pub open_log_terminals: bool,
    /// Override for the daemon sentinel location (tests).
    pub sentinel_path: Option<PathBuf>,
}

/// Owns one relay identity per configured node plus the shared services.
pub struct Router {
    config: Arc<Mutex<RelayConfig>>,
    options: RouterOptions,
    assignment: Arc<AssignmentRouter>,
    watchdog: Arc<ServiceWatchdog>,
    nodes: Vec<Arc<RelayNode>>,
    supervisors: Vec<SidecarSupervisor>,
    board: Arc<StatusBoard>,
    sentinel: DaemonSentinel,
    stop_tx: watch::Sender<bool>,
    sampler: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn tuning_for(cfg: &RelayConfig, node: &rmesh_config::NodeConfig) -> HttpTuning {
    let http = &cfg.http;
    HttpTuning {
        max_body_b: node.max_body_b.unwrap_or(http.max_body_b),
        verify_default: node.verify_default.unwrap_or(http.verify_default),
        chunk_raw_b: http.chunk_raw_b,
        heartbeat: Duration::from_secs_f64(http.heartbeat_s),
        batch_lines: http.batch_lines,
        batch_latency: Duration::from_secs_f64(http.batch_latency),
        retries: http.retries,
        retry_backoff: Duration::from_secs_f64(http.retry_backoff),
        retry_cap: Duration::from_secs_f64(http.retry_cap),
    }
}

fn sidecar_config(
    cfg: &RelayConfig,
    node: &rmesh_config::NodeConfig,
    options: &RouterOptions,
) -> SidecarConfig {
    let bridge = &cfg.bridge;
    SidecarConfig {
        program: options.bridge_program.clone(),
        args: options.bridge_args.clone(),
        cwd: options.bridge_cwd.clone(),
        identifier: node.name.clone(),
        seed_hex: node.seed_hex.clone(),
        num_subclients: node.num_subclients.unwrap_or(bridge.num_subclients),
        seed_ws: node
            .seed_ws
            .clone()
            .unwrap_or_else(|| bridge.seed_ws.clone()),
        self_probe_ms: node.self_probe_ms.unwrap_or(bridge.self_probe_ms),
        self_probe_fails: node.self_probe_fails.unwrap_or(bridge.self_probe_fails),
    }
}

impl Router {
    /// Wire everything up. Nothing is spawned onto the network or the
    /// process table until [`start`](Router::start).
    pub fn new(mut cfg: RelayConfig, options: RouterOptions) -> Result<Self, RouterError> {
        cfg.fill_node_names();
        if cfg.nodes.is_empty() {
            return Err(RouterError::NoNodes);
        }

        let watchdog = Arc::new(ServiceWatchdog::new(
            WatchdogConfig {
                open_log_terminals: options.open_log_terminals,
                ..WatchdogConfig::under(&options.base_dir)
            },
            default_definitions(),
        )?);

        let node_names = cfg.node_names();
        let assignments = cfg.service_assignments.clone();
        let config = Arc::new(Mutex::new(cfg));

        let persist = {
            let config = config.clone();
            let path = options.config_path.clone();
            move |map: &std::collections::BTreeMap<String, String>| {
                let mut cfg = config.lock().expect("config lock poisoned");
                cfg.service_assignments = map.clone();
                match cfg.save_atomic(&path) {
                    Ok(()) => info!(target: "rmesh_router", path = %path.display(), "config saved"),
                    Err(err) => {
                        warn!(target: "rmesh_router", %err, "failed to persist config")
                    }
                }
            }
        };
        let assignment = Arc::new(AssignmentRouter::new(
            assignments,
            node_names,
            Box::new(persist),
        ));
        assignment.ensure_assignments(&watchdog.service_names());

        let board = Arc::new(StatusBoard::new());
        let cfg_snapshot = config.lock().expect("config lock poisoned").clone();
        let mut nodes = Vec::new();
        let mut supervisors = Vec::new();
        for node_cfg in &cfg_snapshot.nodes {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let supervisor = SidecarSupervisor::new(
                sidecar_config(&cfg_snapshot, node_cfg, &options),
                events_tx,
            );
            let handle = supervisor.handle();
            let lookup: Arc<dyn AssignmentLookup> = assignment.clone();
            let address_cb = {
                let assignment = assignment.clone();
                Arc::new(move |name: &str, addr: Option<&str>| {
                    assignment.set_address(name, addr);
                })
            };
            let node = RelayNode::new(
                NodeSettings {
                    name: node_cfg.name.clone(),
                    targets: cfg_snapshot.targets_for(node_cfg),
                    workers: node_cfg.workers.unwrap_or(cfg_snapshot.http.workers),
                    tuning: tuning_for(&cfg_snapshot, node_cfg),
                },
                Arc::new(handle),
                lookup,
                address_cb,
            );
            node.spawn(events_rx);
            nodes.push(node);
            supervisors.push(supervisor);
        }

        let sentinel = DaemonSentinel::new(
            options
                .sentinel_path
                .clone()
                .unwrap_or_else(DaemonSentinel::default_path),
        );
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            options,
            assignment,
            watchdog,
            nodes,
            supervisors,
            board,
            sentinel,
            stop_tx,
            sampler: Mutex::new(None),
        })
    }

    /// Fetch backend sources that are not present yet.
    pub async fn ensure_sources(&self) -> Result<(), RouterError> {
        self.watchdog.ensure_sources().await?;
        Ok(())
    }

    /// Launch the watchdog, the sidecars, and the status sampler.
    pub fn start(&self) {
        info!(target: "rmesh_router", "starting services via watchdog");
        self.watchdog.start_all();
        for supervisor in &self.supervisors {
            supervisor.start();
        }
        self.assignment.persist_if_dirty();

        let mut sampler = self.sampler.lock().expect("sampler lock poisoned");
        if sampler.is_none() {
            let watchdog = self.watchdog.clone();
            let assignment = self.assignment.clone();
            let nodes = self.nodes.clone();
            let board = self.board.clone();
            let stop_rx = self.stop_tx.subscribe();
            *sampler = Some(tokio::spawn(status_sampler(
                watchdog, assignment, nodes, board, stop_rx,
            )));
        }
    }

    /// Cooperative shutdown: identities first, then sidecars, then services.
    pub async fn shutdown(&self) {
        info!(target: "rmesh_router", "shutting down router");
        let _ = self.stop_tx.send(true);
        for node in &self.nodes {
            node.stop();
        }
        for supervisor in &self.supervisors {
            supervisor.shutdown().await;
        }
        self.watchdog.shutdown().await;
        self.assignment.persist_if_dirty();
        if let Some(handle) = self.sampler.lock().expect("sampler lock poisoned").take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    /// Cycle a service to the next identity; persists the config.
    pub fn rotate_service(&self, service: &str) -> Option<String> {
        self.assignment.rotate(service)
    }

    /// The current assignment map.
    pub fn assignments(&self) -> std::collections::BTreeMap<String, String> {
        self.assignment.assignments()
    }

    /// The relay identities, in config order.
    pub fn nodes(&self) -> &[Arc<RelayNode>] {
        &self.nodes
    }

    /// The status board fed by the 5-second sampler.
    pub fn board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    /// Per-identity snapshots.
    pub fn node_snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(|n| n.snapshot()).collect()
    }

    /// Current daemon sentinel contents, if the sentinel exists.
    pub fn daemon_status(&self) -> Option<SentinelInfo> {
        self.sentinel.check()
    }

    /// Create the daemon sentinel.
    pub fn daemon_enable(&self) -> Result<SentinelInfo, RouterError> {
        let info = self
            .sentinel
            .enable(&self.options.base_dir, &self.options.config_path)?;
        info!(target: "rmesh_router", path = %self.sentinel.path().display(), "daemon sentinel created");
        Ok(info)
    }

    /// Remove the daemon sentinel.
    pub fn daemon_disable(&self) -> Result<(), RouterError> {
        self.sentinel.disable()?;
        info!(target: "rmesh_router", "daemon sentinel removed");
        Ok(())
    }

    /// A copy of the live config.
    pub fn config_snapshot(&self) -> RelayConfig {
        self.config.lock().expect("config lock poisoned").clone()
    }
}

async fn status_sampler(
    watchdog: Arc<ServiceWatchdog>,
    assignment: Arc<AssignmentRouter>,
    nodes: Vec<Arc<RelayNode>>,
    board: Arc<StatusBoard>,
    mut stop_rx: watch::Receiver<bool>,
) {
    while !*stop_rx.borrow() {
        for snap in watchdog.snapshot() {
            let a = assignment.lookup(&snap.name);
            board.update_service(ServiceStatusRow {
                service: snap.name,
                assigned_node: a.node,
                assigned_addr: a.addr,
                status: snap.status,
                running: snap.running,
                fallback: snap.fallback,
            });
        }
        for node in &nodes {
            board.update_node(node.snapshot());
        }
        tokio::select! {
            () = tokio::time::sleep(STATUS_SAMPLE_EVERY) => {}
            _ = stop_rx.changed() => {}
        }
    }
}
