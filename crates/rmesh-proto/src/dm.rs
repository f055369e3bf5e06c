// SPDX-License-Identifier: MIT OR Apache-2.0
//! Direct-message payloads carried on the overlay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::descriptor::RequestDescriptor;

/// Current time as epoch milliseconds, the `ts` convention of the wire format.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Delivery options
// ---------------------------------------------------------------------------

/// Overlay delivery options forwarded verbatim to the sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DmOptions {
    /// `true` for fire-and-forget sends.
    #[serde(rename = "noReply")]
    pub no_reply: bool,
    /// Hold window in seconds for offline peers, used by streaming frames.
    #[serde(rename = "maxHoldingSeconds", skip_serializing_if = "Option::is_none")]
    pub max_holding_seconds: Option<u32>,
}

impl DmOptions {
    /// Options for single-shot replies (`{noReply:true}`).
    pub fn single_shot() -> Self {
        Self {
            no_reply: true,
            max_holding_seconds: None,
        }
    }

    /// Options for streaming frames (`{noReply:false, maxHoldingSeconds:120}`).
    pub fn streaming() -> Self {
        Self {
            no_reply: false,
            max_holding_seconds: Some(120),
        }
    }
}

// ---------------------------------------------------------------------------
// Service aliases
// ---------------------------------------------------------------------------

/// Canonicalize a service hint through the alias table.
///
/// Unknown hints pass through lowercased; `None` stays `None`.
pub fn canonical_service(hint: Option<&str>) -> Option<String> {
    let hint = hint?.trim().to_ascii_lowercase();
    if hint.is_empty() {
        return None;
    }
    let canonical = match hint.as_str() {
        "asr" | "whisper" => "whisper_asr",
        "tts" | "piper" => "piper_tts",
        "ollama" | "llm" => "ollama_farm",
        other => other,
    };
    Some(canonical.to_string())
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// Discriminated union of DM events a relay identity understands.
///
/// Anything that is not in the vocabulary lands in `Unknown` and is dropped
/// silently by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundDm {
    /// `relay.ping` / `ping`: answered immediately with `relay.pong`.
    Ping,
    /// `relay.info` / `info`: answered with the identity's info block.
    Info,
    /// `asr.start`: open a recognition stream.
    AsrStart,
    /// `asr.audio`: push an audio chunk into an open stream.
    AsrAudio,
    /// `asr.end`: close a recognition stream.
    AsrEnd,
    /// `asr.events`: subscribe to a stream's event feed.
    AsrEvents,
    /// `relay.http` / `http.request` / `relay.fetch`: generic HTTP relay.
    HttpRequest {
        /// The raw request descriptor object.
        req: RequestDescriptor,
    },
    /// The identity's own liveness probe; must never reach dispatch logic.
    SelfProbe,
    /// Everything else.
    Unknown,
}

impl InboundDm {
    /// Classify a DM payload by its `event` field.
    ///
    /// Field extraction beyond the `req` descriptor is left to the
    /// translation layer, which owns validation.
    pub fn classify(payload: &Value) -> InboundDm {
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        match event.as_str() {
            "relay.ping" | "ping" => InboundDm::Ping,
            "relay.info" | "info" => InboundDm::Info,
            "asr.start" => InboundDm::AsrStart,
            "asr.audio" => InboundDm::AsrAudio,
            "asr.end" => InboundDm::AsrEnd,
            "asr.events" => InboundDm::AsrEvents,
            "relay.http" | "http.request" | "relay.fetch" => {
                let req = payload
                    .get("req")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                InboundDm::HttpRequest { req }
            }
            "relay.selfprobe" => InboundDm::SelfProbe,
            _ => InboundDm::Unknown,
        }
    }

    /// The request id echoed back on every response frame.
    pub fn request_id(payload: &Value) -> String {
        payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// Outbound events
// ---------------------------------------------------------------------------

/// One entry of the full assignment map as advertised in `relay.info`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AssignmentEntry {
    /// Owning identity name.
    pub node: Option<String>,
    /// The owner's current overlay address, when known.
    pub addr: Option<String>,
}

/// One line of a `relay.response.lines` batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineFrame {
    /// Stream-global sequence number, starting at 1.
    pub seq: u64,
    /// Epoch milliseconds when the line was read.
    pub ts: i64,
    /// The line text, without its trailing newline.
    pub line: String,
}

/// Discriminated union of DM payloads a relay identity emits.
///
/// The discriminator tag is `"event"` with the dotted wire names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum OutboundDm {
    /// Reply to `relay.ping`.
    #[serde(rename = "relay.pong")]
    Pong {
        /// Epoch milliseconds.
        ts: i64,
        /// This identity's current overlay address (may be empty pre-ready).
        addr: String,
    },

    /// Reply to `relay.info`.
    #[serde(rename = "relay.info")]
    Info {
        /// Epoch milliseconds.
        ts: i64,
        /// This identity's current overlay address.
        addr: String,
        /// Sorted service names this identity can reach.
        services: Vec<String>,
        /// HTTP worker count.
        workers: usize,
        /// Maximum inline response body in bytes.
        max_body_b: usize,
        /// Default TLS verification flag.
        verify_default: bool,
        /// The full service assignment map.
        assignments: BTreeMap<String, AssignmentEntry>,
    },

    /// Points the caller at the identity that owns the requested service.
    #[serde(rename = "relay.redirect")]
    Redirect {
        /// Canonical service name.
        service: String,
        /// Echoed request id.
        id: String,
        /// Owning identity name.
        node: String,
        /// The owner's current address, or `null` when it is offline.
        addr: Option<String>,
        /// Epoch milliseconds.
        ts: i64,
        /// Present when the owner has no address.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Terminal response for a non-streaming request (or any failure).
    #[serde(rename = "relay.response")]
    Response {
        /// Echoed request id.
        id: String,
        /// `false` carries an error.
        ok: bool,
        /// Upstream HTTP status; 0 for validation and transport failures.
        status: u16,
        /// Upstream headers with lowercased names.
        headers: BTreeMap<String, String>,
        /// Parsed body when the upstream returned JSON.
        json: Option<Value>,
        /// Base64 body otherwise.
        body_b64: Option<String>,
        /// `true` when the body exceeded the inline cap.
        truncated: bool,
        /// Error description when `ok` is `false`.
        error: Option<String>,
    },

    /// First frame of a streaming response.
    #[serde(rename = "relay.response.begin")]
    Begin {
        /// Echoed request id.
        id: String,
        /// Always `true`; failures never open a stream.
        ok: bool,
        /// Upstream HTTP status.
        status: u16,
        /// Upstream headers with lowercased names.
        headers: BTreeMap<String, String>,
        /// Numeric `Content-Length`, when present.
        content_length: Option<u64>,
        /// Filename parsed from `Content-Disposition`, when present.
        filename: Option<String>,
        /// Epoch milliseconds.
        ts: i64,
    },

    /// A batch of text lines from a line-mode stream.
    #[serde(rename = "relay.response.lines")]
    Lines {
        /// Echoed request id.
        id: String,
        /// The batch, in sequence order.
        lines: Vec<LineFrame>,
    },

    /// One base64 chunk from a chunk-mode stream.
    #[serde(rename = "relay.response.chunk")]
    Chunk {
        /// Echoed request id.
        id: String,
        /// Stream-global sequence number, starting at 1.
        seq: u64,
        /// Base64-encoded bytes.
        b64: String,
    },

    /// Emitted when a stream has been quiet past the heartbeat deadline.
    #[serde(rename = "relay.response.keepalive")]
    Keepalive {
        /// Echoed request id.
        id: String,
        /// Epoch milliseconds.
        ts: i64,
    },

    /// Terminal frame of a streaming response; exactly one per request.
    #[serde(rename = "relay.response.end")]
    End {
        /// Echoed request id.
        id: String,
        /// `false` when the stream was cut short.
        ok: bool,
        /// Total raw bytes read upstream.
        bytes: u64,
        /// Highest sequence number emitted.
        last_seq: u64,
        /// Total lines emitted (line mode only).
        #[serde(skip_serializing_if = "Option::is_none")]
        lines: Option<u64>,
        /// `true` when a line parsed as `{"done":true}` (line mode only).
        #[serde(skip_serializing_if = "Option::is_none")]
        done_seen: Option<bool>,
        /// Reserved; chunk streams are never truncated server-side.
        #[serde(skip_serializing_if = "Option::is_none")]
        truncated: Option<bool>,
        /// Error description when `ok` is `false`.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OutboundDm {
    /// A terminal error response with `status:0`, used for validation and
    /// transport failures.
    pub fn error_response(id: &str, error: impl Into<String>) -> Self {
        OutboundDm::Response {
            id: id.to_string(),
            ok: false,
            status: 0,
            headers: BTreeMap::new(),
            json: None,
            body_b64: None,
            truncated: false,
            error: Some(error.into()),
        }
    }

    /// The delivery options appropriate for this payload: streaming frames
    /// use a hold window, everything else is single-shot.
    pub fn delivery_options(&self) -> DmOptions {
        match self {
            OutboundDm::Begin { .. }
            | OutboundDm::Lines { .. }
            | OutboundDm::Chunk { .. }
            | OutboundDm::Keepalive { .. }
            | OutboundDm::End { .. } => DmOptions::streaming(),
            _ => DmOptions::single_shot(),
        }
    }
}
