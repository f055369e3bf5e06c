// SPDX-License-Identifier: MIT OR Apache-2.0
//! The authoritative service→identity assignment map.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;

use rmesh_node::{AssignmentLookup, ServiceAssignment};
use rmesh_proto::AssignmentEntry;

/// Callback invoked with the full map whenever assignments change.
pub type PersistFn = Box<dyn Fn(&BTreeMap<String, String>) + Send + Sync>;

struct AssignState {
    assignments: BTreeMap<String, String>,
    node_order: Vec<String>,
    addresses: BTreeMap<String, Option<String>>,
    dirty: bool,
}

/// Serves `(identity, current address)` lookups, rotates assignments, and
/// persists the map through a caller-supplied hook.
///
/// Address updates share the assignment lock; readers may still observe a
/// stale address between a sidecar drop and the next lookup, which callers
/// surface as "currently offline".
pub struct AssignmentRouter {
    inner: Mutex<AssignState>,
    persist: PersistFn,
}

impl AssignmentRouter {
    /// Build from the persisted map and the identity declaration order.
    pub fn new(
        assignments: BTreeMap<String, String>,
        node_order: Vec<String>,
        persist: PersistFn,
    ) -> Self {
        let addresses = node_order.iter().map(|n| (n.clone(), None)).collect();
        Self {
            inner: Mutex::new(AssignState {
                assignments,
                node_order,
                addresses,
                dirty: false,
            }),
            persist,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AssignState> {
        self.inner.lock().expect("assignment lock poisoned")
    }

    /// Give every listed service an owner, round-robin over the identities.
    ///
    /// Returns `true` when anything changed; the map is marked dirty but not
    /// persisted (startup batches the write).
    pub fn ensure_assignments(&self, services: &[String]) -> bool {
        let mut st = self.state();
        if st.node_order.is_empty() {
            return false;
        }
        let mut changed = false;
        for (idx, service) in services.iter().enumerate() {
            let valid = st
                .assignments
                .get(service)
                .is_some_and(|owner| st.node_order.contains(owner));
            if !valid {
                let owner = st.node_order[idx % st.node_order.len()].clone();
                st.assignments.insert(service.clone(), owner);
                changed = true;
            }
        }
        if changed {
            st.dirty = true;
        }
        changed
    }

    /// Record an identity's current overlay address (or its loss).
    pub fn set_address(&self, node: &str, addr: Option<&str>) {
        self.state()
            .addresses
            .insert(node.to_string(), addr.map(str::to_string));
    }

    /// Cycle a service to the next identity in declaration order.
    ///
    /// Persists immediately through the hook. Returns the new owner, or
    /// `None` when nothing changed.
    pub fn rotate(&self, service: &str) -> Option<String> {
        let (map, new_owner) = {
            let mut st = self.state();
            if st.node_order.is_empty() {
                return None;
            }
            let current = st.assignments.get(service).cloned();
            let new_owner = match current.as_deref().and_then(|c| {
                st.node_order.iter().position(|n| n.as_str() == c)
            }) {
                Some(idx) => st.node_order[(idx + 1) % st.node_order.len()].clone(),
                None => st.node_order[0].clone(),
            };
            if current.as_deref() == Some(new_owner.as_str()) {
                return None;
            }
            st.assignments.insert(service.to_string(), new_owner.clone());
            st.dirty = false;
            (st.assignments.clone(), new_owner)
        };
        info!(target: "rmesh_router", %service, owner = %new_owner, "service reassigned");
        (self.persist)(&map);
        Some(new_owner)
    }

    /// The current assignment map.
    pub fn assignments(&self) -> BTreeMap<String, String> {
        self.state().assignments.clone()
    }

    /// Persist through the hook if the map changed since the last write.
    pub fn persist_if_dirty(&self) {
        let map = {
            let mut st = self.state();
            if !st.dirty {
                return;
            }
            st.dirty = false;
            st.assignments.clone()
        };
        (self.persist)(&map);
    }
}

impl AssignmentLookup for AssignmentRouter {
    fn lookup(&self, service: &str) -> ServiceAssignment {
        let st = self.state();
        let node = st.assignments.get(service).cloned();
        let addr = node
            .as_ref()
            .and_then(|n| st.addresses.get(n).cloned())
            .flatten();
        ServiceAssignment { node, addr }
    }

    fn full_map(&self) -> BTreeMap<String, AssignmentEntry> {
        let st = self.state();
        st.assignments
            .iter()
            .map(|(service, node)| {
                (
                    service.clone(),
                    AssignmentEntry {
                        node: Some(node.clone()),
                        addr: st.addresses.get(node).cloned().flatten(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording_router(
        assignments: BTreeMap<String, String>,
        nodes: &[&str],
    ) -> (Arc<AssignmentRouter>, Arc<Mutex<Vec<BTreeMap<String, String>>>>) {
        let writes: Arc<Mutex<Vec<BTreeMap<String, String>>>> = Arc::default();
        let writes2 = writes.clone();
        let router = Arc::new(AssignmentRouter::new(
            assignments,
            nodes.iter().map(|s| s.to_string()).collect(),
            Box::new(move |map| writes2.lock().unwrap().push(map.clone())),
        ));
        (router, writes)
    }

    #[test]
    fn missing_assignments_fill_round_robin() {
        let (router, _) = recording_router(BTreeMap::new(), &["relay-A", "relay-B"]);
        let services = vec![
            "piper_tts".to_string(),
            "whisper_asr".to_string(),
            "ollama_farm".to_string(),
        ];
        assert!(router.ensure_assignments(&services));
        let map = router.assignments();
        assert_eq!(map["piper_tts"], "relay-A");
        assert_eq!(map["whisper_asr"], "relay-B");
        assert_eq!(map["ollama_farm"], "relay-A");
        // Second pass is a no-op.
        assert!(!router.ensure_assignments(&services));
    }

    #[test]
    fn stale_owner_is_replaced() {
        let (router, _) = recording_router(
            BTreeMap::from([("whisper_asr".to_string(), "gone-node".to_string())]),
            &["relay-A"],
        );
        assert!(router.ensure_assignments(&["whisper_asr".to_string()]));
        assert_eq!(router.assignments()["whisper_asr"], "relay-A");
    }

    #[test]
    fn lookup_resolves_owner_address() {
        let (router, _) = recording_router(
            BTreeMap::from([("whisper_asr".to_string(), "relay-B".to_string())]),
            &["relay-A", "relay-B"],
        );
        let a = router.lookup("whisper_asr");
        assert_eq!(a.node.as_deref(), Some("relay-B"));
        assert!(a.addr.is_none());

        router.set_address("relay-B", Some("b.addr"));
        assert_eq!(router.lookup("whisper_asr").addr.as_deref(), Some("b.addr"));

        router.set_address("relay-B", None);
        assert!(router.lookup("whisper_asr").addr.is_none());

        // Unknown services have no owner.
        assert_eq!(router.lookup("mystery"), ServiceAssignment::default());
    }

    #[test]
    fn rotate_cycles_and_persists() {
        let (router, writes) = recording_router(
            BTreeMap::from([("whisper_asr".to_string(), "relay-A".to_string())]),
            &["relay-A", "relay-B", "relay-C"],
        );
        assert_eq!(router.rotate("whisper_asr").as_deref(), Some("relay-B"));
        assert_eq!(router.rotate("whisper_asr").as_deref(), Some("relay-C"));
        assert_eq!(router.rotate("whisper_asr").as_deref(), Some("relay-A"));
        assert_eq!(writes.lock().unwrap().len(), 3);
    }

    #[test]
    fn rotating_twice_round_trips_with_two_nodes() {
        let (router, _) = recording_router(
            BTreeMap::from([("whisper_asr".to_string(), "relay-A".to_string())]),
            &["relay-A", "relay-B"],
        );
        router.rotate("whisper_asr");
        router.rotate("whisper_asr");
        assert_eq!(router.assignments()["whisper_asr"], "relay-A");
    }

    #[test]
    fn rotate_with_single_node_is_a_no_op() {
        let (router, writes) = recording_router(
            BTreeMap::from([("whisper_asr".to_string(), "relay-A".to_string())]),
            &["relay-A"],
        );
        assert!(router.rotate("whisper_asr").is_none());
        assert!(writes.lock().unwrap().is_empty());
    }

    #[test]
    fn persist_if_dirty_writes_once() {
        let (router, writes) = recording_router(BTreeMap::new(), &["relay-A"]);
        router.ensure_assignments(&["piper_tts".to_string()]);
        router.persist_if_dirty();
        router.persist_if_dirty();
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn full_map_carries_addresses() {
        let (router, _) = recording_router(
            BTreeMap::from([
                ("a".to_string(), "relay-A".to_string()),
                ("b".to_string(), "relay-B".to_string()),
            ]),
            &["relay-A", "relay-B"],
        );
        router.set_address("relay-A", Some("a.addr"));
        let map = router.full_map();
        assert_eq!(map["a"].addr.as_deref(), Some("a.addr"));
        assert!(map["b"].addr.is_none());
    }
}
