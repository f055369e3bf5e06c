// SPDX-License-Identifier: MIT OR Apache-2.0
//! Translation of `asr.*` convenience events into request descriptors.

use serde_json::Value;
use std::collections::BTreeMap;

use rmesh_proto::RequestDescriptor;

/// Validation failures while translating a convenience event.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TranslateError {
    /// The event requires a session id.
    #[error("{0} missing sid")]
    MissingSid(&'static str),

    /// `asr.audio` requires a base64 body.
    #[error("asr.audio missing body_b64")]
    MissingBody,
}

/// The common `opts` block of an ASR event.
struct AsrOpts<'a> {
    service: String,
    headers: BTreeMap<String, String>,
    timeout_ms: Option<u64>,
    verify: Option<bool>,
    insecure_tls: Option<&'a Value>,
}

impl<'a> AsrOpts<'a> {
    fn from_payload(payload: &'a Value) -> Self {
        let opts = payload.get("opts");
        let service = opts
            .and_then(|o| o.get("service"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("asr")
            .to_string();
        let headers = opts
            .and_then(|o| o.get("headers"))
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            service,
            headers,
            timeout_ms: opts.and_then(|o| o.get("timeout_ms")).and_then(Value::as_u64),
            verify: opts.and_then(|o| o.get("verify")).and_then(Value::as_bool),
            insecure_tls: opts.and_then(|o| o.get("insecure_tls")),
        }
    }

    fn apply(self, mut req: RequestDescriptor, default_timeout_ms: u64) -> RequestDescriptor {
        // Caller headers layer over the event's defaults.
        for (k, v) in self.headers {
            req.headers.insert(k, v);
        }
        req.service = Some(self.service);
        req.timeout_ms = Some(self.timeout_ms.unwrap_or(default_timeout_ms));
        req.verify = self.verify;
        req.insecure_tls = self.insecure_tls.cloned();
        req
    }
}

fn required_sid(payload: &Value, event: &'static str) -> Result<String, TranslateError> {
    payload
        .get("sid")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(TranslateError::MissingSid(event))
}

/// `asr.start` → `POST /recognize/stream/start`.
pub fn request_from_asr_start(payload: &Value) -> Result<RequestDescriptor, TranslateError> {
    let opts = AsrOpts::from_payload(payload);
    let req = RequestDescriptor {
        path: Some("/recognize/stream/start".into()),
        method: Some("POST".into()),
        ..RequestDescriptor::default()
    };
    Ok(opts.apply(req, 45_000))
}

/// `asr.audio` → `POST /recognize/stream/{sid}/audio?format=…&sr=…` with a
/// raw octet-stream body.
pub fn request_from_asr_audio(payload: &Value) -> Result<RequestDescriptor, TranslateError> {
    let sid = required_sid(payload, "asr.audio")?;
    let format = payload
        .get("format")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("pcm16");
    let sample_rate = payload.get("sr").and_then(Value::as_u64).unwrap_or(16_000);
    let body_b64 = payload
        .get("body_b64")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(TranslateError::MissingBody)?;

    let opts = AsrOpts::from_payload(payload);
    let req = RequestDescriptor {
        path: Some(format!(
            "/recognize/stream/{sid}/audio?format={format}&sr={sample_rate}"
        )),
        method: Some("POST".into()),
        headers: BTreeMap::from([(
            "Content-Type".to_string(),
            "application/octet-stream".to_string(),
        )]),
        body_b64: Some(body_b64.to_string()),
        stream: Some(Value::Bool(false)),
        ..RequestDescriptor::default()
    };
    Ok(opts.apply(req, 45_000))
}

/// `asr.end` → `POST /recognize/stream/{sid}/end`.
pub fn request_from_asr_end(payload: &Value) -> Result<RequestDescriptor, TranslateError> {
    let sid = required_sid(payload, "asr.end")?;
    let opts = AsrOpts::from_payload(payload);
    let req = RequestDescriptor {
        path: Some(format!("/recognize/stream/{sid}/end")),
        method: Some("POST".into()),
        ..RequestDescriptor::default()
    };
    Ok(opts.apply(req, 45_000))
}

/// `asr.events` → `GET /recognize/stream/{sid}/events`, long-poll streaming.
pub fn request_from_asr_events(payload: &Value) -> Result<RequestDescriptor, TranslateError> {
    let sid = required_sid(payload, "asr.events")?;
    let opts = AsrOpts::from_payload(payload);
    let req = RequestDescriptor {
        path: Some(format!("/recognize/stream/{sid}/events")),
        method: Some("GET".into()),
        headers: BTreeMap::from([
            ("Accept".to_string(), "text/event-stream".to_string()),
            ("X-Relay-Stream".to_string(), "chunks".to_string()),
        ]),
        stream: Some(Value::String("chunks".into())),
        ..RequestDescriptor::default()
    };
    Ok(opts.apply(req, 300_000))
}
