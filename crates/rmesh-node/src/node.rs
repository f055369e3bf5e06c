// SPDX-License-Identifier: MIT OR Apache-2.0
//! The relay identity: event loop, DM dispatch, and assignment gating.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rmesh_http::{HttpTuning, Job, WorkerPool};
use rmesh_proto::{
    AssignmentEntry, DmSink, InboundDm, OutboundDm, RequestDescriptor, bridge::DEGRADED_STATES,
    canonical_service, epoch_ms,
};
use rmesh_sidecar::SidecarEvent;

use super::counters::{NodeCounters, NodeSnapshot};
use super::translate::{
    TranslateError, request_from_asr_audio, request_from_asr_end, request_from_asr_events,
    request_from_asr_start,
};

// ---------------------------------------------------------------------------
// Assignment seam
// ---------------------------------------------------------------------------

/// Where a service lives right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAssignment {
    /// Owning identity, or `None` when the service is unassigned.
    pub node: Option<String>,
    /// The owner's current overlay address, when its bridge is ready.
    pub addr: Option<String>,
}

/// Read access to the process-wide assignment map.
///
/// Identities hold this trait object instead of a back-pointer to the router,
/// which keeps the node↔router wiring acyclic.
pub trait AssignmentLookup: Send + Sync {
    /// Resolve one service.
    fn lookup(&self, service: &str) -> ServiceAssignment;

    /// The full map, as advertised in `relay.info`.
    fn full_map(&self) -> BTreeMap<String, AssignmentEntry>;
}

/// Callback invoked when this identity's overlay address changes.
pub type AddressCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Effective per-identity settings (global config merged with overrides).
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Identity name.
    pub name: String,
    /// Service name → base URL for this identity.
    pub targets: BTreeMap<String, String>,
    /// HTTP worker count.
    pub workers: usize,
    /// Worker-pool tuning.
    pub tuning: HttpTuning,
}

// ---------------------------------------------------------------------------
// RelayNode
// ---------------------------------------------------------------------------

/// One relay identity bound to a sidecar sink and a worker pool.
pub struct RelayNode {
    name: String,
    targets: BTreeMap<String, String>,
    workers: usize,
    tuning: HttpTuning,
    sink: Arc<dyn DmSink>,
    pool: WorkerPool,
    lookup: Arc<dyn AssignmentLookup>,
    address_cb: AddressCallback,
    current_address: RwLock<Option<String>>,
    counters: NodeCounters,
}

impl RelayNode {
    /// Build the identity and start its worker pool.
    pub fn new(
        settings: NodeSettings,
        sink: Arc<dyn DmSink>,
        lookup: Arc<dyn AssignmentLookup>,
        address_cb: AddressCallback,
    ) -> Arc<Self> {
        let pool = WorkerPool::start(
            settings.workers,
            settings.tuning.clone(),
            settings.targets.clone(),
            sink.clone(),
        );
        Arc::new(Self {
            name: settings.name,
            targets: settings.targets,
            workers: settings.workers,
            tuning: settings.tuning,
            sink,
            pool,
            lookup,
            address_cb,
            current_address: RwLock::new(None),
            counters: NodeCounters::default(),
        })
    }

    /// Identity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current overlay address, when the bridge is ready.
    pub fn address(&self) -> Option<String> {
        self.current_address
            .read()
            .expect("address lock poisoned")
            .clone()
    }

    /// HTTP jobs waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.pool.depth()
    }

    /// Point-in-time view for status consumers.
    pub fn snapshot(&self) -> NodeSnapshot {
        let (incoming, outgoing, errors) = self.counters.read();
        NodeSnapshot {
            name: self.name.clone(),
            address: self.address(),
            incoming,
            outgoing,
            errors,
            queue_depth: self.queue_depth(),
        }
    }

    /// Consume sidecar events until the channel closes.
    pub fn spawn(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<SidecarEvent>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                node.handle_event(event);
            }
        })
    }

    /// Stop accepting jobs; workers exit after draining the queue.
    pub fn stop(&self) {
        self.pool.close();
    }

    /// React to one sidecar event.
    pub fn handle_event(&self, event: SidecarEvent) {
        match event {
            SidecarEvent::Ready { address } => {
                *self
                    .current_address
                    .write()
                    .expect("address lock poisoned") = Some(address.clone());
                (self.address_cb)(&self.name, Some(&address));
            }
            SidecarEvent::Down => {
                *self
                    .current_address
                    .write()
                    .expect("address lock poisoned") = None;
                (self.address_cb)(&self.name, None);
            }
            SidecarEvent::Restarting { delay } => {
                debug!(target: "rmesh_node", identity = %self.name, ?delay, "bridge restart scheduled");
            }
            SidecarEvent::Status { state, msg } => {
                if DEGRADED_STATES.contains(&state.as_str()) {
                    warn!(target: "rmesh_node", identity = %self.name, %state, msg = msg.as_deref().unwrap_or(""), "bridge degraded");
                } else {
                    debug!(target: "rmesh_node", identity = %self.name, %state, "bridge status");
                }
            }
            SidecarEvent::Dm { src, body } => self.dispatch_dm(&src, &body),
            SidecarEvent::Err { msg } => {
                self.counters.bump_err();
                warn!(target: "rmesh_node", identity = %self.name, %msg, "bridge error");
            }
        }
    }

    /// Interpret one inbound DM payload.
    pub fn dispatch_dm(&self, src: &str, body: &Value) {
        let rid = InboundDm::request_id(body);
        self.counters.bump_in();
        match InboundDm::classify(body) {
            InboundDm::Ping => {
                self.sink.send(
                    src,
                    OutboundDm::Pong {
                        ts: epoch_ms(),
                        addr: self.address().unwrap_or_default(),
                    },
                );
                self.counters.bump_out();
            }
            InboundDm::Info => {
                self.sink.send(
                    src,
                    OutboundDm::Info {
                        ts: epoch_ms(),
                        addr: self.address().unwrap_or_default(),
                        services: self.targets.keys().cloned().collect(),
                        workers: self.workers,
                        max_body_b: self.tuning.max_body_b,
                        verify_default: self.tuning.verify_default,
                        assignments: self.lookup.full_map(),
                    },
                );
                self.counters.bump_out();
            }
            InboundDm::AsrStart => {
                self.translate_and_gate(src, &rid, request_from_asr_start(body));
            }
            InboundDm::AsrAudio => {
                self.translate_and_gate(src, &rid, request_from_asr_audio(body));
            }
            InboundDm::AsrEnd => {
                self.translate_and_gate(src, &rid, request_from_asr_end(body));
            }
            InboundDm::AsrEvents => {
                self.translate_and_gate(src, &rid, request_from_asr_events(body));
            }
            InboundDm::HttpRequest { req } => {
                let canonical = canonical_service(req.service_hint());
                if self.gate(canonical.as_deref(), src, &rid) {
                    self.enqueue(src, &rid, req);
                }
            }
            InboundDm::SelfProbe | InboundDm::Unknown => {}
        }
    }

    /// ASR convenience events always gate on the canonical ASR service.
    fn translate_and_gate(
        &self,
        src: &str,
        rid: &str,
        translated: Result<RequestDescriptor, TranslateError>,
    ) {
        match translated {
            Ok(req) => {
                if self.gate(Some("whisper_asr"), src, rid) {
                    self.enqueue(src, rid, req);
                }
            }
            Err(err) => {
                self.counters.bump_err();
                self.sink
                    .send(src, OutboundDm::error_response(rid, err.to_string()));
            }
        }
    }

    /// Admit the job if this identity owns the service; redirect otherwise.
    fn gate(&self, service: Option<&str>, src: &str, rid: &str) -> bool {
        let Some(service) = service else {
            return true;
        };
        let assignment = self.lookup.lookup(service);
        if let Some(owner) = assignment.node
            && owner != self.name
        {
            let error = assignment
                .addr
                .is_none()
                .then(|| "service currently offline".to_string());
            self.sink.send(
                src,
                OutboundDm::Redirect {
                    service: service.to_string(),
                    id: rid.to_string(),
                    node: owner,
                    addr: assignment.addr,
                    ts: epoch_ms(),
                    error,
                },
            );
            self.counters.bump_out();
            return false;
        }
        true
    }

    fn enqueue(&self, src: &str, rid: &str, req: RequestDescriptor) {
        let depth = self.pool.enqueue(Job {
            src: src.to_string(),
            id: rid.to_string(),
            req,
        });
        debug!(target: "rmesh_node", identity = %self.name, id = %rid, depth = ?depth, "job queued");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
