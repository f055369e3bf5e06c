// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-identity activity counters, the dashboard seam.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters bumped on the dispatch path.
#[derive(Debug, Default)]
pub struct NodeCounters {
    incoming: AtomicU64,
    outgoing: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time view of one identity for status consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Identity name.
    pub name: String,
    /// Current overlay address, when the bridge is ready.
    pub address: Option<String>,
    /// DMs received.
    pub incoming: u64,
    /// Immediate replies sent (pong, info, redirect).
    pub outgoing: u64,
    /// Errors observed.
    pub errors: u64,
    /// HTTP jobs waiting for a worker.
    pub queue_depth: usize,
}

impl NodeCounters {
    /// Record one inbound DM.
    pub fn bump_in(&self) {
        self.incoming.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one immediate outbound reply.
    pub fn bump_out(&self) {
        self.outgoing.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one error.
    pub fn bump_err(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn read(&self) -> (u64, u64, u64) {
        (
            self.incoming.load(Ordering::Relaxed),
            self.outgoing.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}
