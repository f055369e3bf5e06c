// SPDX-License-Identifier: MIT OR Apache-2.0
//! Snapshot board sampled by operators and the periodic status printer.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rmesh_node::NodeSnapshot;

/// One service row: where it is assigned and how it is doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatusRow {
    /// Service name.
    pub service: String,
    /// Owning identity, when assigned.
    pub assigned_node: Option<String>,
    /// The owner's current overlay address.
    pub assigned_addr: Option<String>,
    /// Watchdog status string.
    pub status: String,
    /// Whether the backend is up (own child or fallback).
    pub running: bool,
    /// Whether the backend runs through the system fallback.
    pub fallback: bool,
}

#[derive(Default)]
struct BoardInner {
    services: BTreeMap<String, ServiceStatusRow>,
    nodes: BTreeMap<String, NodeSnapshot>,
}

/// Thread-safe board of the latest service and identity snapshots.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<BoardInner>,
}

impl StatusBoard {
    /// Create an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one service row.
    pub fn update_service(&self, row: ServiceStatusRow) {
        self.inner
            .lock()
            .expect("status board lock poisoned")
            .services
            .insert(row.service.clone(), row);
    }

    /// Replace one identity row.
    pub fn update_node(&self, snapshot: NodeSnapshot) {
        self.inner
            .lock()
            .expect("status board lock poisoned")
            .nodes
            .insert(snapshot.name.clone(), snapshot);
    }

    /// All service rows, sorted by name.
    pub fn services(&self) -> Vec<ServiceStatusRow> {
        self.inner
            .lock()
            .expect("status board lock poisoned")
            .services
            .values()
            .cloned()
            .collect()
    }

    /// All identity rows, sorted by name.
    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.inner
            .lock()
            .expect("status board lock poisoned")
            .nodes
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_replace_by_key() {
        let board = StatusBoard::new();
        board.update_service(ServiceStatusRow {
            service: "whisper_asr".into(),
            assigned_node: Some("relay-A".into()),
            assigned_addr: None,
            status: "stopped".into(),
            running: false,
            fallback: false,
        });
        board.update_service(ServiceStatusRow {
            service: "whisper_asr".into(),
            assigned_node: Some("relay-B".into()),
            assigned_addr: Some("b.addr".into()),
            status: "running".into(),
            running: true,
            fallback: false,
        });
        let rows = board.services();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].assigned_node.as_deref(), Some("relay-B"));
        assert!(rows[0].running);
    }
}
