// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lifetime management for one bridge sidecar process.

use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use rmesh_proto::{BridgeCommand, BridgeEvent, DmOptions, DmSink, JsonlCodec, OutboundDm};

use super::backoff::RestartBackoff;
use super::queue::{DmQueue, QueuedDm, SEND_QUEUE_MAX};
use super::stop::StopToken;
use super::SidecarError;

/// Poll interval while the bridge child is absent or its stdin is broken.
const WRITE_RETRY_POLL: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything needed to spawn one identity's bridge process.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Program to execute, e.g. `node`.
    pub program: String,
    /// Program arguments, e.g. the bridge script path.
    pub args: Vec<String>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Identity name, exported as the overlay identifier.
    pub identifier: String,
    /// 64-hex private seed.
    pub seed_hex: String,
    /// Sub-clients per identity.
    pub num_subclients: u32,
    /// Comma-separated bootstrap websocket endpoints.
    pub seed_ws: String,
    /// Self-probe interval in milliseconds.
    pub self_probe_ms: u64,
    /// Consecutive probe failures before the bridge exits.
    pub self_probe_fails: u32,
}

impl SidecarConfig {
    /// Environment variables carrying the identity to the bridge.
    pub fn env(&self) -> Vec<(String, String)> {
        let seed = self
            .seed_hex
            .trim()
            .to_ascii_lowercase()
            .trim_start_matches("0x")
            .to_string();
        vec![
            ("NKN_SEED_HEX".into(), seed),
            ("NKN_IDENTIFIER".into(), self.identifier.clone()),
            ("NKN_NUM_SUBCLIENTS".into(), self.num_subclients.to_string()),
            ("NKN_BRIDGE_SEED_WS".into(), self.seed_ws.clone()),
            ("NKN_SELF_PROBE_MS".into(), self.self_probe_ms.to_string()),
            (
                "NKN_SELF_PROBE_FAILS".into(),
                self.self_probe_fails.to_string(),
            ),
        ]
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What the supervisor reports to its owning relay identity.
#[derive(Debug, Clone, PartialEq)]
pub enum SidecarEvent {
    /// The bridge connected and learned its overlay address.
    Ready {
        /// The overlay address.
        address: String,
    },
    /// The bridge is down; the previous address is no longer valid.
    Down,
    /// A restart is scheduled after the given delay.
    Restarting {
        /// Backoff delay before the next spawn.
        delay: Duration,
    },
    /// A bridge status report.
    Status {
        /// State tag, e.g. `probe_fail`.
        state: String,
        /// Optional detail.
        msg: Option<String>,
    },
    /// An inbound overlay DM.
    Dm {
        /// Sender's overlay address.
        src: String,
        /// Parsed payload.
        body: Value,
    },
    /// A bridge-reported error line.
    Err {
        /// Error description.
        msg: String,
    },
}

/// Translate one bridge stdout line into a supervisor event.
///
/// Malformed lines yield `None` and are dropped. Self-probe DMs are filtered
/// here so they can never reach dispatch logic.
pub fn interpret_line(line: &str) -> Option<SidecarEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match JsonlCodec::decode(line) {
        Ok(BridgeEvent::Ready { address, .. }) => Some(SidecarEvent::Ready { address }),
        Ok(BridgeEvent::Status { state, msg, .. }) => Some(SidecarEvent::Status { state, msg }),
        Ok(BridgeEvent::NknDm { src, msg }) => {
            if msg.get("event").and_then(Value::as_str) == Some("relay.selfprobe") {
                return None;
            }
            Some(SidecarEvent::Dm { src, body: msg })
        }
        Ok(BridgeEvent::Err { msg }) | Ok(BridgeEvent::Crit { msg }) => {
            Some(SidecarEvent::Err { msg })
        }
        Err(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable send handle over the supervisor's durable queue.
#[derive(Clone)]
pub struct SidecarHandle {
    queue: Arc<DmQueue>,
    address: Arc<RwLock<Option<String>>>,
}

impl SidecarHandle {
    /// The identity's current overlay address, when the bridge is ready.
    pub fn address(&self) -> Option<String> {
        self.address.read().expect("address lock poisoned").clone()
    }

    /// Current send-queue depth.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Entries displaced by queue overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Queue a raw JSON payload.
    pub fn send_raw(&self, to: &str, data: Value, opts: Option<DmOptions>) {
        self.queue.push(QueuedDm {
            to: to.to_string(),
            data,
            opts,
        });
    }
}

impl DmSink for SidecarHandle {
    fn send_dm(&self, to: &str, payload: OutboundDm, opts: DmOptions) {
        match serde_json::to_value(&payload) {
            Ok(data) => self.send_raw(to, data, Some(opts)),
            Err(err) => warn!(target: "rmesh_sidecar", %err, "unserializable outbound dm dropped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct SupervisorInner {
    cfg: SidecarConfig,
    queue: Arc<DmQueue>,
    events: mpsc::UnboundedSender<SidecarEvent>,
    stdin_slot: tokio::sync::Mutex<Option<ChildStdin>>,
    child_slot: tokio::sync::Mutex<Option<Child>>,
    address: Arc<RwLock<Option<String>>>,
    stop: StopToken,
    running: AtomicBool,
    writer_started: AtomicBool,
}

/// Owns the lifetime of one bridge sidecar process.
///
/// The send queue outlives any individual child: the writer loop retries a
/// queued entry against the next live child when the current one breaks.
pub struct SidecarSupervisor {
    inner: Arc<SupervisorInner>,
}

impl SidecarSupervisor {
    /// Build a supervisor reporting on `events`, with the default queue size.
    pub fn new(cfg: SidecarConfig, events: mpsc::UnboundedSender<SidecarEvent>) -> Self {
        Self::with_queue_capacity(cfg, events, SEND_QUEUE_MAX)
    }

    /// Build a supervisor with an explicit queue capacity.
    pub fn with_queue_capacity(
        cfg: SidecarConfig,
        events: mpsc::UnboundedSender<SidecarEvent>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                cfg,
                queue: Arc::new(DmQueue::new(capacity)),
                events,
                stdin_slot: tokio::sync::Mutex::new(None),
                child_slot: tokio::sync::Mutex::new(None),
                address: Arc::new(RwLock::new(None)),
                stop: StopToken::new(),
                running: AtomicBool::new(false),
                writer_started: AtomicBool::new(false),
            }),
        }
    }

    /// The send handle for this identity.
    pub fn handle(&self) -> SidecarHandle {
        SidecarHandle {
            queue: self.inner.queue.clone(),
            address: self.inner.address.clone(),
        }
    }

    /// Start the supervise and writer loops.
    ///
    /// Idempotent while a supervise loop is live. After a spawn failure the
    /// loop ends and `start` may be called again.
    pub fn start(&self) {
        if self
            .inner
            .writer_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(writer_loop(self.inner.clone()));
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(supervise_loop(self.inner.clone()));
        }
    }

    /// Stop the loops, close the child's stdin, and terminate the child.
    pub async fn shutdown(&self) {
        self.inner.stop.signal();
        self.inner.stdin_slot.lock().await.take();
        if let Some(mut child) = self.inner.child_slot.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

fn spawn_child(cfg: &SidecarConfig) -> Result<Child, SidecarError> {
    let mut cmd = Command::new(&cfg.program);
    cmd.args(&cfg.args)
        .envs(cfg.env())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &cfg.cwd {
        cmd.current_dir(cwd);
    }
    cmd.spawn().map_err(SidecarError::Spawn)
}

async fn supervise_loop(inner: Arc<SupervisorInner>) {
    let ident = inner.cfg.identifier.clone();
    let mut backoff = RestartBackoff::default();
    while !inner.stop.is_signalled() {
        *inner.address.write().expect("address lock poisoned") = None;
        let _ = inner.events.send(SidecarEvent::Down);

        let mut child = match spawn_child(&inner.cfg) {
            Ok(child) => child,
            Err(err) => {
                error!(target: "rmesh_sidecar", identity = %ident, %err, "bridge spawn failed");
                break;
            }
        };

        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            let ident = ident.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let s = line.trim_end();
                            if !s.is_empty() {
                                warn!(target: "rmesh_sidecar.stderr", identity = %ident, "{s}");
                            }
                        }
                    }
                }
            });
        }
        *inner.stdin_slot.lock().await = child.stdin.take();
        *inner.child_slot.lock().await = Some(child);

        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                if let Some(event) = interpret_line(&line) {
                    if let SidecarEvent::Ready { address } = &event {
                        debug!(target: "rmesh_sidecar", identity = %ident, address = %address, "bridge ready");
                        *inner.address.write().expect("address lock poisoned") =
                            Some(address.clone());
                        backoff.reset();
                    }
                    let _ = inner.events.send(event);
                }
                if inner.stop.is_signalled() {
                    break;
                }
            }
        }

        inner.stdin_slot.lock().await.take();
        if let Some(mut child) = inner.child_slot.lock().await.take() {
            let _ = child.kill().await;
        }
        *inner.address.write().expect("address lock poisoned") = None;
        let _ = inner.events.send(SidecarEvent::Down);

        if inner.stop.is_signalled() {
            break;
        }
        let delay = backoff.next_delay();
        let _ = inner.events.send(SidecarEvent::Restarting { delay });
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = inner.stop.wait() => break,
        }
    }
    inner.running.store(false, Ordering::SeqCst);
}

async fn writer_loop(inner: Arc<SupervisorInner>) {
    loop {
        let item = tokio::select! {
            item = inner.queue.recv() => item,
            () = inner.stop.wait() => return,
        };
        let line = match JsonlCodec::encode(&BridgeCommand::Dm {
            to: item.to,
            data: item.data,
            opts: item.opts,
        }) {
            Ok(line) => line,
            Err(err) => {
                warn!(target: "rmesh_sidecar", %err, "unencodable dm dropped");
                continue;
            }
        };
        // Retry this entry until a live child accepts it or we are stopped.
        loop {
            if inner.stop.is_signalled() {
                return;
            }
            let mut slot = inner.stdin_slot.lock().await;
            if let Some(stdin) = slot.as_mut() {
                match stdin.write_all(line.as_bytes()).await {
                    Ok(()) => {
                        let _ = stdin.flush().await;
                        break;
                    }
                    Err(_) => {
                        // Broken pipe; wait for the next child.
                        slot.take();
                    }
                }
            }
            drop(slot);
            tokio::time::sleep(WRITE_RETRY_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn env_normalizes_seed() {
        let cfg = SidecarConfig {
            program: "node".into(),
            args: vec!["bridge.js".into()],
            cwd: None,
            identifier: "relay-A".into(),
            seed_hex: "0xABCDEF".into(),
            num_subclients: 2,
            seed_ws: String::new(),
            self_probe_ms: 12_000,
            self_probe_fails: 3,
        };
        let env = cfg.env();
        assert!(env.contains(&("NKN_SEED_HEX".into(), "abcdef".into())));
        assert!(env.contains(&("NKN_IDENTIFIER".into(), "relay-A".into())));
        assert!(env.contains(&("NKN_NUM_SUBCLIENTS".into(), "2".into())));
    }

    #[test]
    fn interpret_ready_and_status() {
        let ev = interpret_line(r#"{"type":"ready","address":"a.b","ts":1}"#).unwrap();
        assert_eq!(ev, SidecarEvent::Ready { address: "a.b".into() });

        let ev = interpret_line(r#"{"type":"status","state":"probe_fail","fails":2}"#).unwrap();
        assert_eq!(
            ev,
            SidecarEvent::Status {
                state: "probe_fail".into(),
                msg: None,
            }
        );
    }

    #[test]
    fn interpret_drops_self_probe() {
        let line = r#"{"type":"nkn-dm","src":"self.addr","msg":{"event":"relay.selfprobe","ts":1}}"#;
        assert!(interpret_line(line).is_none());
    }

    #[test]
    fn interpret_passes_application_dms() {
        let line = r#"{"type":"nkn-dm","src":"peer","msg":{"event":"relay.ping","id":"r1"}}"#;
        match interpret_line(line).unwrap() {
            SidecarEvent::Dm { src, body } => {
                assert_eq!(src, "peer");
                assert_eq!(body, json!({"event": "relay.ping", "id": "r1"}));
            }
            other => panic!("expected Dm, got {other:?}"),
        }
    }

    #[test]
    fn interpret_drops_malformed_lines() {
        assert!(interpret_line("").is_none());
        assert!(interpret_line("garbage").is_none());
        assert!(interpret_line(r#"{"type":"unknown"}"#).is_none());
    }
}
