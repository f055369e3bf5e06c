// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end: fake bridge process → supervisor → relay identity → replies
//! queued back through the bridge.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use rmesh_http::HttpTuning;
use rmesh_node::{NodeSettings, RelayNode};
use rmesh_router::AssignmentRouter;
use rmesh_sidecar::{SidecarConfig, SidecarSupervisor};

fn bridge_config(script: &str, dir: &std::path::Path) -> SidecarConfig {
    SidecarConfig {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        cwd: Some(dir.to_path_buf()),
        identifier: "relay-A".into(),
        seed_hex: "cd".repeat(32),
        num_subclients: 2,
        seed_ws: String::new(),
        self_probe_ms: 12_000,
        self_probe_fails: 3,
    }
}

/// Read the fake bridge's captured stdin until `pred` matches a frame.
async fn wait_for_frame<F>(out: &std::path::Path, pred: F) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    for _ in 0..100 {
        if let Ok(content) = std::fs::read_to_string(out) {
            for line in content.lines() {
                if let Ok(frame) = serde_json::from_str::<serde_json::Value>(line)
                    && pred(&frame)
                {
                    return frame;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "expected frame not observed; captured: {:?}",
        std::fs::read_to_string(out).unwrap_or_default()
    );
}

fn assignment_router(owner_of_asr: &str) -> Arc<AssignmentRouter> {
    let router = Arc::new(AssignmentRouter::new(
        BTreeMap::from([("whisper_asr".to_string(), owner_of_asr.to_string())]),
        vec!["relay-A".to_string(), "relay-B".to_string()],
        Box::new(|_| {}),
    ));
    router.set_address("relay-B", Some("relay-b.overlay"));
    router
}

fn build_node(assignment: &Arc<AssignmentRouter>, handle: rmesh_sidecar::SidecarHandle) -> Arc<RelayNode> {
    RelayNode::new(
        NodeSettings {
            name: "relay-A".into(),
            targets: BTreeMap::new(),
            workers: 1,
            tuning: HttpTuning::default(),
        },
        Arc::new(handle),
        assignment.clone(),
        Arc::new(|_, _| {}),
    )
}

#[tokio::test]
async fn ping_dm_round_trips_through_the_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bridge_in.jsonl");
    let script = format!(
        "echo '{{\"type\":\"ready\",\"address\":\"relay-a.overlay\",\"ts\":1}}'; \
         echo '{{\"type\":\"nkn-dm\",\"src\":\"peer.caller\",\"msg\":{{\"event\":\"relay.ping\",\"id\":\"p1\"}}}}'; \
         cat >> {}",
        out.display()
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let supervisor = SidecarSupervisor::new(bridge_config(&script, dir.path()), events_tx);
    let assignment = assignment_router("relay-A");
    let node = build_node(&assignment, supervisor.handle());
    node.spawn(events_rx);
    supervisor.start();

    let frame = wait_for_frame(&out, |f| f["data"]["event"] == "relay.pong").await;
    assert_eq!(frame["type"], "dm");
    assert_eq!(frame["to"], "peer.caller");
    assert_eq!(frame["data"]["addr"], "relay-a.overlay");
    assert!(frame["data"]["ts"].as_i64().unwrap() > 0);
    // Single-shot reply options.
    assert_eq!(frame["opts"]["noReply"], true);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn foreign_asr_request_redirects_and_rotation_flips_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bridge_in.jsonl");
    let script = format!(
        "echo '{{\"type\":\"ready\",\"address\":\"relay-a.overlay\",\"ts\":1}}'; \
         echo '{{\"type\":\"nkn-dm\",\"src\":\"peer.caller\",\"msg\":{{\"event\":\"asr.start\",\"id\":\"r1\",\"opts\":{{\"service\":\"asr\"}}}}}}'; \
         cat >> {}",
        out.display()
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let supervisor = SidecarSupervisor::new(bridge_config(&script, dir.path()), events_tx);
    // whisper_asr belongs to relay-B; relay-A must redirect.
    let assignment = assignment_router("relay-B");
    let node = build_node(&assignment, supervisor.handle());
    node.spawn(events_rx);
    supervisor.start();

    let frame = wait_for_frame(&out, |f| f["data"]["event"] == "relay.redirect").await;
    assert_eq!(frame["to"], "peer.caller");
    assert_eq!(frame["data"]["service"], "whisper_asr");
    assert_eq!(frame["data"]["node"], "relay-B");
    assert_eq!(frame["data"]["addr"], "relay-b.overlay");
    assert_eq!(frame["data"]["id"], "r1");

    // Rotate ownership to relay-A: the same request is now admitted, so no
    // new redirect appears.
    assert_eq!(assignment.rotate("whisper_asr").as_deref(), Some("relay-A"));
    node.dispatch_dm(
        "peer.caller",
        &serde_json::json!({"event": "asr.start", "id": "r2", "opts": {"service": "asr"}}),
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    let content = std::fs::read_to_string(&out).unwrap_or_default();
    let redirects = content
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter(|f| f["data"]["event"] == "relay.redirect")
        .count();
    assert_eq!(redirects, 1, "rotation must stop the redirects");

    supervisor.shutdown().await;
}
