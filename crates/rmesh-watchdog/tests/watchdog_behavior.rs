// SPDX-License-Identifier: MIT OR Apache-2.0
//! Watchdog behavior: fallback detection, restart parking, lifecycle.

use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use rmesh_watchdog::{
    HealthProbe, ServiceDefinition, ServiceSnapshot, ServiceWatchdog, WatchdogConfig,
};

fn config(dir: &std::path::Path) -> WatchdogConfig {
    WatchdogConfig::under(dir)
}

async fn poll_snapshot<F>(watchdog: &ServiceWatchdog, deadline: Duration, pred: F) -> ServiceSnapshot
where
    F: Fn(&ServiceSnapshot) -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        let snap = watchdog.snapshot().into_iter().next().expect("one service");
        if pred(&snap) {
            return snap;
        }
        if start.elapsed() > deadline {
            panic!("condition not reached in {deadline:?}; last snapshot: {snap:?}");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test]
async fn system_instance_puts_service_into_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Ollama is running"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let def = ServiceDefinition {
        name: "ollama_farm".into(),
        repo_url: String::new(),
        script_path: "farm/ollama_farm.py".into(),
        description: "llm proxy".into(),
        ports: vec![],
        health: Some(HealthProbe {
            url: format!("{}/", server.uri()),
            expect: "Ollama is running".into(),
        }),
        interpreter: "python3".into(),
    };
    let watchdog = ServiceWatchdog::new(config(dir.path()), vec![def]).unwrap();
    watchdog.start_all();

    let snap = poll_snapshot(&watchdog, Duration::from_secs(30), |s| s.fallback).await;
    assert!(snap.running);
    assert_eq!(snap.status, "system fallback");
    // No private child was kept alive.
    assert!(snap.pid.is_none());

    watchdog.shutdown().await;
}

#[tokio::test]
async fn crashing_service_is_parked_after_repeated_failures() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    // Pre-provision the script so no clone happens: it exits immediately.
    let workdir = cfg.services_root.join("flaky");
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join("flaky.sh"), "exit 7\n").unwrap();

    let def = ServiceDefinition {
        name: "flaky".into(),
        repo_url: String::new(),
        script_path: "svc/flaky.sh".into(),
        description: "always exits".into(),
        ports: vec![],
        health: None,
        interpreter: "sh".into(),
    };
    let watchdog = ServiceWatchdog::new(cfg, vec![def]).unwrap();
    watchdog.start_all();

    let snap = poll_snapshot(&watchdog, Duration::from_secs(20), |s| {
        !s.running && s.restart_count >= 3
    })
    .await;
    assert_eq!(snap.last_exit_code, Some(7));
    assert_eq!(snap.status, "Exited with code 7");

    // Parked: no further restarts happen.
    let count = snap.restart_count;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let later = watchdog.snapshot().into_iter().next().unwrap();
    assert_eq!(later.restart_count, count);
    assert!(!later.running);

    watchdog.shutdown().await;
}

#[tokio::test]
async fn long_running_service_reports_running_then_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let workdir = cfg.services_root.join("steady");
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join("steady.sh"), "sleep 30\n").unwrap();

    let def = ServiceDefinition {
        name: "steady".into(),
        repo_url: String::new(),
        script_path: "svc/steady.sh".into(),
        description: "sleeps".into(),
        ports: vec![],
        health: None,
        interpreter: "sh".into(),
    };
    let watchdog = ServiceWatchdog::new(cfg, vec![def]).unwrap();
    watchdog.start_all();

    let snap = poll_snapshot(&watchdog, Duration::from_secs(10), |s| s.running).await;
    assert_eq!(snap.status, "running");
    assert!(snap.pid.is_some());
    assert!(snap.running_since.is_some());

    watchdog.shutdown().await;
    let snap = watchdog.snapshot().into_iter().next().unwrap();
    assert!(!snap.running);
}

#[tokio::test]
async fn existing_script_is_marked_cached() {
    // ensure_sources needs git even when everything is cached.
    let has_git = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).any(|d| d.join("git").is_file()))
        .unwrap_or(false);
    if !has_git {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let workdir = cfg.services_root.join("cachedsvc");
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join("svc.sh"), "exit 0\n").unwrap();

    let def = ServiceDefinition {
        name: "cachedsvc".into(),
        repo_url: "https://example.invalid/unused.git".into(),
        script_path: "x/svc.sh".into(),
        description: "cached".into(),
        ports: vec![],
        health: None,
        interpreter: "sh".into(),
    };
    let watchdog = ServiceWatchdog::new(cfg.clone(), vec![def]).unwrap();
    watchdog.ensure_sources().await.unwrap();

    let meta_path = cfg.services_root.join("meta").join("cachedsvc.json");
    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(meta_path).unwrap()).unwrap();
    assert_eq!(meta["status"], "cached");
    assert_eq!(meta["name"], "cachedsvc");
}
