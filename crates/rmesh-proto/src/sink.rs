// SPDX-License-Identifier: MIT OR Apache-2.0
//! The outbound seam between request processing and the overlay.

use super::dm::{DmOptions, OutboundDm};

/// Accepts outbound DMs for delivery on the overlay.
///
/// The supervisor's send handle implements this over its durable queue; tests
/// substitute a recording sink. Sends are fire-and-forget: queue admission is
/// the only guarantee, delivery is best-effort per the overlay's semantics.
pub trait DmSink: Send + Sync {
    /// Queue a payload for `to` with explicit delivery options.
    fn send_dm(&self, to: &str, payload: OutboundDm, opts: DmOptions);

    /// Queue a payload using the options implied by its event kind.
    fn send(&self, to: &str, payload: OutboundDm) {
        let opts = payload.delivery_options();
        self.send_dm(to, payload, opts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, OutboundDm, DmOptions)>>,
    }

    impl DmSink for Recorder {
        fn send_dm(&self, to: &str, payload: OutboundDm, opts: DmOptions) {
            self.sent.lock().unwrap().push((to.into(), payload, opts));
        }
    }

    #[test]
    fn default_send_uses_event_options() {
        let rec = Recorder::default();
        rec.send("peer", OutboundDm::Pong { ts: 1, addr: "a".into() });
        rec.send(
            "peer",
            OutboundDm::Chunk {
                id: "r".into(),
                seq: 1,
                b64: String::new(),
            },
        );
        let sent = rec.sent.lock().unwrap();
        assert!(sent[0].2.no_reply);
        assert!(!sent[1].2.no_reply);
        assert_eq!(sent[1].2.max_holding_seconds, Some(120));
    }
}
