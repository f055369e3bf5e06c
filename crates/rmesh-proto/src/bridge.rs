// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSONL frames exchanged with a bridge sidecar over stdio.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ProtoError, dm::DmOptions};

/// Command written to the sidecar's stdin, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    /// Send a direct message on the overlay.
    Dm {
        /// Destination overlay address.
        to: String,
        /// JSON payload delivered to the peer.
        data: Value,
        /// Delivery options; omitted for the sidecar default.
        #[serde(skip_serializing_if = "Option::is_none")]
        opts: Option<DmOptions>,
    },
}

/// Event read from the sidecar's stdout, one JSON object per line.
///
/// The discriminator tag is `"type"`. Lines that fail to parse are dropped by
/// the supervisor, so adding variants here is backwards-compatible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// The sidecar connected to the overlay and learned its address.
    Ready {
        /// Overlay address for this identity.
        address: String,
        /// Epoch milliseconds at connect time.
        #[serde(default)]
        ts: Option<i64>,
    },
    /// Health / lifecycle state change.
    Status {
        /// State tag, e.g. `probe_ok`, `probe_fail`, `error`, `close`.
        state: String,
        /// Optional human-readable detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
        /// Consecutive probe failures, when applicable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fails: Option<u32>,
    },
    /// An inbound direct message from the overlay.
    #[serde(rename = "nkn-dm")]
    NknDm {
        /// Overlay address of the sender.
        src: String,
        /// Parsed inner payload, or `{event:"<non-json>", raw:…}`.
        msg: Value,
    },
    /// Non-fatal error report from the sidecar.
    Err {
        /// Error description.
        msg: String,
    },
    /// Unrecoverable startup error (e.g. malformed seed).
    Crit {
        /// Error description.
        msg: String,
    },
}

/// Status states that mark the identity as degraded on the dashboard.
pub const DEGRADED_STATES: &[&str] = &["probe_fail", "probe_exit", "error", "close"];

/// Stateless JSONL codec for bridge frames.
pub struct JsonlCodec;

impl JsonlCodec {
    /// Serialize a command to a newline-terminated JSON string.
    pub fn encode(cmd: &BridgeCommand) -> Result<String, ProtoError> {
        let mut s = serde_json::to_string(cmd).map_err(ProtoError::Serialize)?;
        s.push('\n');
        Ok(s)
    }

    /// Deserialize a single stdout line into a [`BridgeEvent`].
    pub fn decode(line: &str) -> Result<BridgeEvent, ProtoError> {
        serde_json::from_str(line).map_err(ProtoError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_dm_command_is_single_line() {
        let cmd = BridgeCommand::Dm {
            to: "addr.abc".into(),
            data: json!({"event": "relay.pong"}),
            opts: Some(DmOptions::single_shot()),
        };
        let line = JsonlCodec::encode(&cmd).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let v: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v["type"], "dm");
        assert_eq!(v["to"], "addr.abc");
        assert_eq!(v["opts"]["noReply"], true);
    }

    #[test]
    fn encode_omits_absent_opts() {
        let cmd = BridgeCommand::Dm {
            to: "x".into(),
            data: json!({}),
            opts: None,
        };
        let v: Value = serde_json::from_str(JsonlCodec::encode(&cmd).unwrap().trim_end()).unwrap();
        assert!(v.get("opts").is_none());
    }

    #[test]
    fn decode_ready_event() {
        let ev = JsonlCodec::decode(r#"{"type":"ready","address":"ident.deadbeef","ts":1}"#)
            .unwrap();
        assert_eq!(
            ev,
            BridgeEvent::Ready {
                address: "ident.deadbeef".into(),
                ts: Some(1),
            }
        );
    }

    #[test]
    fn decode_status_without_detail() {
        let ev = JsonlCodec::decode(r#"{"type":"status","state":"probe_ok"}"#).unwrap();
        match ev {
            BridgeEvent::Status { state, msg, fails } => {
                assert_eq!(state, "probe_ok");
                assert!(msg.is_none());
                assert!(fails.is_none());
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[test]
    fn decode_nkn_dm_keeps_payload_opaque() {
        let ev = JsonlCodec::decode(
            r#"{"type":"nkn-dm","src":"peer.1","msg":{"event":"relay.ping","id":"r1"}}"#,
        )
        .unwrap();
        match ev {
            BridgeEvent::NknDm { src, msg } => {
                assert_eq!(src, "peer.1");
                assert_eq!(msg["event"], "relay.ping");
            }
            other => panic!("expected NknDm, got {other:?}"),
        }
    }

    #[test]
    fn decode_garbage_is_an_error() {
        assert!(JsonlCodec::decode("not json").is_err());
        assert!(JsonlCodec::decode(r#"{"type":"wat"}"#).is_err());
    }
}
