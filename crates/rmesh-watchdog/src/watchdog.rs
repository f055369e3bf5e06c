// SPDX-License-Identifier: MIT OR Apache-2.0
//! The service watchdog: acquisition, launch, restart schedule, fallback.

use serde::Serialize;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::WatchdogError;
use super::definition::{HealthProbe, ServiceDefinition};
use super::ports::{binary_on_path, free_ports, port_in_use, send_signal};
use super::terminal::{detect_template, spawn_tailer};

/// SIGTERM-to-SIGKILL grace on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);
/// Restart backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Consecutive failed attempts before a service is parked.
const MAX_ATTEMPTS: u32 = 2;
/// How long a freshly spawned fallback-eligible service may take to report
/// healthy.
const SPAWN_HEALTH_WINDOW: Duration = Duration::from_secs(20);
/// Health probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Filesystem layout and options for the watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Per-service working directories live here.
    pub services_root: PathBuf,
    /// Per-service log files live here.
    pub logs_root: PathBuf,
    /// Spawn a detached terminal tailing each service log.
    pub open_log_terminals: bool,
}

impl WatchdogConfig {
    /// The conventional layout under a base directory.
    pub fn under(base: &Path) -> Self {
        Self {
            services_root: base.join(".services"),
            logs_root: base.join(".logs"),
            open_log_terminals: false,
        }
    }

    fn metadata_root(&self) -> PathBuf {
        self.services_root.join("meta")
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StateInner {
    running: bool,
    pid: Option<u32>,
    restart_count: u32,
    restart_attempts: u32,
    running_since: Option<i64>,
    last_exit_code: Option<i32>,
    last_exit_at: Option<i64>,
    last_error: Option<String>,
    fallback_mode: bool,
    parked: bool,
    supervising: bool,
}

/// Point-in-time view of one supervised service.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceSnapshot {
    /// Service name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Script location on disk.
    pub script: String,
    /// Log file location.
    pub log: String,
    /// Whether the service is effectively up (own child or fallback).
    pub running: bool,
    /// Child PID while running.
    pub pid: Option<u32>,
    /// Total restarts this process lifetime.
    pub restart_count: u32,
    /// Epoch seconds when the current incarnation came up.
    pub running_since: Option<i64>,
    /// Exit code of the last incarnation.
    pub last_exit_code: Option<i32>,
    /// Epoch seconds of the last exit.
    pub last_exit_at: Option<i64>,
    /// Most recent error, if any.
    pub last_error: Option<String>,
    /// Display status: `running`, `system fallback`, an error, or `stopped`.
    pub status: String,
    /// Whether a log-tailer terminal is open.
    pub terminal_alive: bool,
    /// Whether the service runs through the system fallback.
    pub fallback: bool,
}

struct ServiceRuntime {
    def: ServiceDefinition,
    workdir: PathBuf,
    script_path: PathBuf,
    log_path: PathBuf,
    metadata_path: PathBuf,
    state: Mutex<StateInner>,
    child: tokio::sync::Mutex<Option<Child>>,
    tailer: Mutex<Option<Child>>,
}

impl ServiceRuntime {
    fn state(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.state.lock().expect("service state lock poisoned")
    }

    fn snapshot(&self) -> ServiceSnapshot {
        let terminal_alive = {
            let mut tailer = self.tailer.lock().expect("tailer lock poisoned");
            tailer
                .as_mut()
                .is_some_and(|t| matches!(t.try_wait(), Ok(None)))
        };
        let st = self.state();
        let running = st.running || st.fallback_mode;
        let status = if st.fallback_mode {
            "system fallback".to_string()
        } else if running {
            "running".to_string()
        } else {
            st.last_error.clone().unwrap_or_else(|| "stopped".into())
        };
        ServiceSnapshot {
            name: self.def.name.clone(),
            description: self.def.description.clone(),
            script: self.script_path.display().to_string(),
            log: self.log_path.display().to_string(),
            running,
            pid: st.pid,
            restart_count: st.restart_count,
            running_since: st.running_since,
            last_exit_code: st.last_exit_code,
            last_exit_at: st.last_exit_at,
            last_error: st.last_error.clone(),
            status,
            terminal_alive,
            fallback: st.fallback_mode,
        }
    }

    fn close_tailer(&self) {
        if let Some(mut tailer) = self
            .tailer
            .lock()
            .expect("tailer lock poisoned")
            .take()
        {
            let _ = tailer.start_kill();
        }
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

/// Supervises the set of local backend services.
///
/// At most one live child per definition; restart scheduling and the
/// fallback transitions happen in one supervisor task per service.
pub struct ServiceWatchdog {
    cfg: WatchdogConfig,
    services: Vec<Arc<ServiceRuntime>>,
    stop_tx: watch::Sender<bool>,
    terminal_template: Option<Vec<String>>,
}

impl ServiceWatchdog {
    /// Build the watchdog and create its filesystem layout.
    pub fn new(
        cfg: WatchdogConfig,
        definitions: Vec<ServiceDefinition>,
    ) -> Result<Self, WatchdogError> {
        std::fs::create_dir_all(&cfg.services_root)?;
        std::fs::create_dir_all(&cfg.logs_root)?;
        std::fs::create_dir_all(cfg.metadata_root())?;
        let services = definitions
            .into_iter()
            .map(|def| {
                let workdir = cfg.services_root.join(&def.name);
                let script_path = workdir.join(def.script_name());
                let log_path = cfg.logs_root.join(format!("{}.log", def.name));
                let metadata_path = cfg.metadata_root().join(format!("{}.json", def.name));
                Arc::new(ServiceRuntime {
                    def,
                    workdir,
                    script_path,
                    log_path,
                    metadata_path,
                    state: Mutex::new(StateInner::default()),
                    child: tokio::sync::Mutex::new(None),
                    tailer: Mutex::new(None),
                })
            })
            .collect();
        let (stop_tx, _) = watch::channel(false);
        let terminal_template = if cfg.open_log_terminals {
            detect_template()
        } else {
            None
        };
        if cfg.open_log_terminals && terminal_template.is_none() {
            warn!(target: "rmesh_watchdog", "no terminal emulator found; log windows disabled");
        }
        Ok(Self {
            cfg,
            services,
            stop_tx,
            terminal_template,
        })
    }

    /// Names of the supervised services.
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.def.name.clone()).collect()
    }

    /// Acquire sources for every service that does not have its script yet.
    pub async fn ensure_sources(&self) -> Result<(), WatchdogError> {
        if !binary_on_path("git") {
            return Err(WatchdogError::GitMissing);
        }
        for rt in &self.services {
            if rt.script_path.exists() {
                self.write_metadata(rt, "cached")?;
                continue;
            }
            self.fetch_script(rt).await?;
        }
        Ok(())
    }

    async fn fetch_script(&self, rt: &ServiceRuntime) -> Result<(), WatchdogError> {
        let tmp = self.cfg.services_root.join(format!(
            "tmp_{}_{}",
            rt.def.name,
            chrono::Utc::now().timestamp()
        ));
        if tmp.exists() {
            let _ = tokio::fs::remove_dir_all(&tmp).await;
        }
        info!(target: "rmesh_watchdog", service = %rt.def.name, repo = %rt.def.repo_url, "fetching service source");
        let out = Command::new("git")
            .args(["clone", "--depth", "1", &rt.def.repo_url])
            .arg(&tmp)
            .output()
            .await?;
        if !out.status.success() {
            let _ = tokio::fs::remove_dir_all(&tmp).await;
            return Err(WatchdogError::CloneFailed {
                repo: rt.def.repo_url.clone(),
                detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        let source = tmp.join(&rt.def.script_path);
        if !source.exists() {
            let _ = tokio::fs::remove_dir_all(&tmp).await;
            return Err(WatchdogError::ScriptMissing {
                script: rt.def.script_path.clone(),
                repo: rt.def.repo_url.clone(),
            });
        }
        tokio::fs::create_dir_all(&rt.workdir).await?;
        tokio::fs::rename(&source, &rt.script_path).await?;
        self.write_metadata(rt, "fetched")?;
        let _ = tokio::fs::remove_dir_all(&tmp).await;
        Ok(())
    }

    fn write_metadata(&self, rt: &ServiceRuntime, status: &str) -> Result<(), WatchdogError> {
        let meta = serde_json::json!({
            "name": rt.def.name,
            "repo": rt.def.repo_url,
            "script": rt.def.script_path,
            "status": status,
            "ts": chrono::Utc::now().timestamp(),
        });
        std::fs::write(
            &rt.metadata_path,
            serde_json::to_string_pretty(&meta).expect("metadata is serializable"),
        )?;
        Ok(())
    }

    /// Start one supervisor task per service.
    pub fn start_all(&self) {
        for rt in &self.services {
            {
                let mut st = rt.state();
                if st.supervising || st.parked {
                    continue;
                }
                st.supervising = true;
            }
            let rt = rt.clone();
            let stop_rx = self.stop_tx.subscribe();
            let template = self.terminal_template.clone();
            let open_terminals = self.cfg.open_log_terminals;
            tokio::spawn(run_service_loop(rt, template, open_terminals, stop_rx));
        }
    }

    /// Stop all services: SIGTERM, bounded wait, SIGKILL.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        for rt in &self.services {
            terminate_child(&rt.child, SHUTDOWN_GRACE).await;
            rt.close_tailer();
            let mut st = rt.state();
            st.running = false;
            st.pid = None;
            st.running_since = None;
        }
    }

    /// Snapshots of every service, for the status sampler.
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        self.services.iter().map(|rt| rt.snapshot()).collect()
    }
}

// ---------------------------------------------------------------------------
// Child helpers
// ---------------------------------------------------------------------------

async fn terminate_child(slot: &tokio::sync::Mutex<Option<Child>>, grace: Duration) {
    let mut guard = slot.lock().await;
    if let Some(child) = guard.as_mut() {
        if let Some(pid) = child.id() {
            send_signal(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }
    guard.take();
}

async fn spawn_service_child(
    rt: &ServiceRuntime,
    template: Option<&[String]>,
    open_terminals: bool,
) -> Result<(), String> {
    let log_file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&rt.log_path)
        .map_err(|e| format!("log open failed: {e}"))?;
    let mut banner = log_file
        .try_clone()
        .map_err(|e| format!("log clone failed: {e}"))?;
    let _ = writeln!(
        banner,
        "\n[{}] watchdog: started {} {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
        rt.def.interpreter,
        rt.script_path.display()
    );
    let stdout = log_file
        .try_clone()
        .map_err(|e| format!("log clone failed: {e}"))?;
    tokio::fs::create_dir_all(&rt.workdir)
        .await
        .map_err(|e| format!("workdir create failed: {e}"))?;
    let child = Command::new(&rt.def.interpreter)
        .arg(&rt.script_path)
        .current_dir(&rt.workdir)
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(log_file))
        .spawn()
        .map_err(|e| format!("spawn failed: {e}"))?;
    {
        let mut st = rt.state();
        st.running = true;
        st.pid = child.id();
        st.running_since = Some(chrono::Utc::now().timestamp());
        st.last_error = None;
    }
    *rt.child.lock().await = Some(child);
    if open_terminals
        && let Some(template) = template
    {
        let needs_tailer = {
            let mut tailer = rt.tailer.lock().expect("tailer lock poisoned");
            !tailer
                .as_mut()
                .is_some_and(|t| matches!(t.try_wait(), Ok(None)))
        };
        if needs_tailer
            && let Some(tailer) =
                spawn_tailer(template, &rt.def.name, &rt.log_path, &rt.workdir)
        {
            *rt.tailer.lock().expect("tailer lock poisoned") = Some(tailer);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Supervisor loops
// ---------------------------------------------------------------------------

async fn run_service_loop(
    rt: Arc<ServiceRuntime>,
    template: Option<Vec<String>>,
    open_terminals: bool,
    mut stop_rx: watch::Receiver<bool>,
) {
    let client = reqwest::Client::new();
    let mut backoff = Duration::from_secs(1);
    rt.state().restart_attempts = 0;

    while !*stop_rx.borrow() {
        let outcome = if let Some(probe) = rt.def.health.clone() {
            fallback_service_once(&rt, &probe, &client, template.as_deref(), open_terminals, &mut stop_rx).await
        } else {
            standard_service_once(&rt, template.as_deref(), open_terminals, &mut stop_rx).await
        };

        match outcome {
            Ok(true) => {
                rt.state().restart_attempts = 0;
                backoff = Duration::from_secs(1);
                if rt.def.fallback_eligible() && !*stop_rx.borrow() {
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = stop_rx.changed() => {}
                    }
                }
                continue;
            }
            Ok(false) => {}
            Err(msg) => {
                let mut st = rt.state();
                st.last_error = Some(msg);
                st.last_exit_at = Some(chrono::Utc::now().timestamp());
                st.running = false;
                st.pid = None;
            }
        }

        if *stop_rx.borrow() {
            break;
        }

        let attempts = {
            let mut st = rt.state();
            st.restart_count += 1;
            st.restart_attempts += 1;
            st.restart_attempts
        };
        // First failure of a standard service: evict port squatters and
        // retry immediately.
        if !rt.def.fallback_eligible() && attempts == 1 {
            free_ports(&rt.def.ports).await;
            continue;
        }
        if attempts <= MAX_ATTEMPTS {
            tokio::select! {
                () = tokio::time::sleep(backoff.min(BACKOFF_CAP)) => {}
                _ = stop_rx.changed() => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
            continue;
        }
        {
            let mut st = rt.state();
            if st.last_error.is_none() {
                st.last_error = Some("Repeated startup failures".into());
            }
            st.parked = true;
            st.running = false;
            st.pid = None;
            st.running_since = None;
        }
        warn!(target: "rmesh_watchdog", service = %rt.def.name, "parked after repeated startup failures");
        break;
    }

    let mut st = rt.state();
    st.running = false;
    st.running_since = None;
    st.supervising = false;
}

/// One pass of the standard loop: spawn, wait for exit, classify.
///
/// `Ok(true)` means "stop was requested"; `Ok(false)` is a failure to be fed
/// into the restart schedule.
async fn standard_service_once(
    rt: &ServiceRuntime,
    template: Option<&[String]>,
    open_terminals: bool,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<bool, String> {
    let mut busy = false;
    for &port in &rt.def.ports {
        if port != 0 && port_in_use(port).await {
            busy = true;
            break;
        }
    }
    if busy {
        free_ports(&rt.def.ports).await;
    }

    spawn_service_child(rt, template, open_terminals).await?;

    loop {
        if *stop_rx.borrow() {
            terminate_child(&rt.child, SHUTDOWN_GRACE).await;
            rt.close_tailer();
            let mut st = rt.state();
            st.running = false;
            st.pid = None;
            return Ok(true);
        }
        {
            let mut guard = rt.child.lock().await;
            match guard.as_mut() {
                None => return Ok(*stop_rx.borrow()),
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        guard.take();
                        drop(guard);
                        rt.close_tailer();
                        let stopping = *stop_rx.borrow();
                        let code = status.code();
                        let mut st = rt.state();
                        st.last_exit_code = code;
                        st.last_exit_at = Some(chrono::Utc::now().timestamp());
                        st.running = false;
                        st.pid = None;
                        if stopping {
                            return Ok(true);
                        }
                        st.last_error = Some(match code {
                            Some(code) => format!("Exited with code {code}"),
                            None => "Exited on signal".to_string(),
                        });
                        return Ok(false);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        guard.take();
                        return Err(format!("wait failed: {err}"));
                    }
                },
            }
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(250)) => {}
            _ = stop_rx.changed() => {}
        }
    }
}

async fn probe_healthy(probe: &HealthProbe, client: &reqwest::Client) -> bool {
    match client
        .get(&probe.url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) => match resp.text().await {
            Ok(body) => body.contains(&probe.expect),
            Err(_) => false,
        },
        Err(_) => false,
    }
}

/// One pass of the fallback-eligible loop.
///
/// `Ok(true)` means healthy, through the private child or the system
/// instance; the caller re-probes after a short sleep.
async fn fallback_service_once(
    rt: &ServiceRuntime,
    probe: &HealthProbe,
    client: &reqwest::Client,
    template: Option<&[String]>,
    open_terminals: bool,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<bool, String> {
    if rt.state().fallback_mode {
        if probe_healthy(probe, client).await {
            rt.state().last_error = None;
        } else {
            rt.state().last_error = Some("system fallback unhealthy".into());
        }
        return Ok(true);
    }

    if probe_healthy(probe, client).await {
        let mut st = rt.state();
        st.fallback_mode = true;
        st.last_error = None;
        st.running_since = Some(chrono::Utc::now().timestamp());
        debug!(target: "rmesh_watchdog", service = %rt.def.name, "system instance detected, entering fallback");
        return Ok(true);
    }

    free_ports(&rt.def.ports).await;
    spawn_service_child(rt, template, open_terminals).await?;

    // Poll the health endpoint while the private instance warms up.
    let deadline = tokio::time::Instant::now() + SPAWN_HEALTH_WINDOW;
    let mut healthy = false;
    while tokio::time::Instant::now() < deadline && !*stop_rx.borrow() {
        if probe_healthy(probe, client).await {
            healthy = true;
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = stop_rx.changed() => {}
        }
    }
    if healthy {
        let mut st = rt.state();
        st.last_error = None;
        st.restart_attempts = 0;
        return Ok(true);
    }

    rt.state().last_error = Some("private instance failed to start; falling back".into());
    terminate_child(&rt.child, Duration::from_secs(5)).await;
    rt.close_tailer();
    {
        let mut st = rt.state();
        st.running = false;
        st.pid = None;
    }
    if probe_healthy(probe, client).await {
        let mut st = rt.state();
        st.fallback_mode = true;
        st.running_since = Some(chrono::Utc::now().timestamp());
        st.restart_attempts = 0;
        return Ok(true);
    }
    rt.state().last_error = Some("ollama fallback unavailable".into());
    Ok(false)
}
