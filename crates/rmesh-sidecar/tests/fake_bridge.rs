// SPDX-License-Identifier: MIT OR Apache-2.0
//! Supervisor tests against a shell fake bridge speaking the JSONL protocol.

use std::time::Duration;
use tokio::sync::mpsc;

use rmesh_sidecar::{SidecarConfig, SidecarEvent, SidecarSupervisor};

fn config_for(script: &str, dir: &std::path::Path) -> SidecarConfig {
    SidecarConfig {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        cwd: Some(dir.to_path_buf()),
        identifier: "relay-test".into(),
        seed_hex: "ab".repeat(32),
        num_subclients: 2,
        seed_ws: String::new(),
        self_probe_ms: 12_000,
        self_probe_fails: 3,
    }
}

async fn wait_for_ready(rx: &mut mpsc::UnboundedReceiver<SidecarEvent>) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for ready")
            .expect("event channel closed");
        if let SidecarEvent::Ready { address } = event {
            return address;
        }
    }
}

async fn wait_for_down(rx: &mut mpsc::UnboundedReceiver<SidecarEvent>) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for down")
            .expect("event channel closed");
        if matches!(event, SidecarEvent::Down) {
            return;
        }
    }
}

#[tokio::test]
async fn ready_event_carries_address_and_dm_reaches_child() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("sent.jsonl");
    let script = format!(
        "echo '{{\"type\":\"ready\",\"address\":\"fake.addr\",\"ts\":1}}'; cat >> {}",
        out.display()
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let supervisor = SidecarSupervisor::new(config_for(&script, dir.path()), tx);
    let handle = supervisor.handle();
    supervisor.start();

    let addr = wait_for_ready(&mut rx).await;
    assert_eq!(addr, "fake.addr");
    assert_eq!(handle.address().as_deref(), Some("fake.addr"));

    handle.send_raw("peer.1", serde_json::json!({"event": "relay.pong"}), None);

    let mut written = String::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        written = std::fs::read_to_string(&out).unwrap_or_default();
        if !written.is_empty() {
            break;
        }
    }
    let frame: serde_json::Value = serde_json::from_str(written.trim()).expect("one JSONL frame");
    assert_eq!(frame["type"], "dm");
    assert_eq!(frame["to"], "peer.1");
    assert_eq!(frame["data"]["event"], "relay.pong");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn queue_survives_bridge_restart() {
    let dir = tempfile::tempdir().unwrap();
    let flag = dir.path().join("crashed.once");
    let out = dir.path().join("sent.jsonl");
    // First child announces itself and dies; the second one drains stdin.
    let script = format!(
        "echo '{{\"type\":\"ready\",\"address\":\"gen.1\",\"ts\":1}}'; \
         if [ ! -f {flag} ]; then touch {flag}; exit 0; fi; cat >> {out}",
        flag = flag.display(),
        out = out.display()
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let supervisor = SidecarSupervisor::new(config_for(&script, dir.path()), tx);
    let handle = supervisor.handle();
    supervisor.start();

    // First generation announces itself and dies.
    wait_for_ready(&mut rx).await;
    wait_for_down(&mut rx).await;
    // Entries accepted while the bridge is down must not be lost.
    handle.send_raw("peer.2", serde_json::json!({"event": "relay.pong", "n": 1}), None);

    // Second generation comes up after the 0.5 s backoff.
    wait_for_ready(&mut rx).await;

    let mut written = String::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        written = std::fs::read_to_string(&out).unwrap_or_default();
        if !written.is_empty() {
            break;
        }
    }
    let frame: serde_json::Value = serde_json::from_str(written.trim()).expect("delivered frame");
    assert_eq!(frame["to"], "peer.2");
    assert_eq!(frame["data"]["n"], 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn restart_is_announced_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    // A bridge that dies instantly after ready.
    let script = "echo '{\"type\":\"ready\",\"address\":\"x.y\",\"ts\":1}'";
    let (tx, mut rx) = mpsc::unbounded_channel();
    let supervisor = SidecarSupervisor::new(config_for(script, dir.path()), tx);
    supervisor.start();

    wait_for_ready(&mut rx).await;
    // After EOF the supervisor reports Down and schedules a restart.
    let mut saw_restart = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(SidecarEvent::Restarting { delay })) => {
                assert!(delay >= Duration::from_millis(500));
                saw_restart = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_restart, "expected a Restarting event");

    supervisor.shutdown().await;
}
