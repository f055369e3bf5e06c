// SPDX-License-Identifier: MIT OR Apache-2.0
//! The HTTP request descriptor carried inside relay DMs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Stream tokens that switch a request into streaming mode.
const STREAM_TOKENS: &[&str] = &[
    "1", "true", "yes", "on", "chunks", "dm", "lines", "ndjson", "sse", "events",
];

/// Describes one upstream HTTP operation.
///
/// Callers set either an absolute `url` or a `service` + `path` pair. Body
/// precedence is `json` over `body_b64` over `data`; the worker applies it,
/// this type only carries the fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestDescriptor {
    /// Absolute URL; bypasses service resolution when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Logical service name, resolved through the target map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Legacy alias for `service`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// HTTP method; defaults to GET.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Path joined onto the service base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// JSON body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Base64-encoded raw body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
    /// Plain-text body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Upstream timeout in milliseconds; defaults to 30 000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Explicit TLS-verification override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    /// Truthy forms (`true`, `"1"`, `"true"`, `"on"`) force verification off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_tls: Option<Value>,
    /// Stream mode token: a bool or one of the token strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<Value>,
}

impl RequestDescriptor {
    /// The service hint, preferring `service` over the legacy `target`.
    pub fn service_hint(&self) -> Option<&str> {
        self.service.as_deref().or(self.target.as_deref())
    }

    /// The effective HTTP method, uppercased, defaulting to GET.
    pub fn method_or_default(&self) -> String {
        self.method
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or("GET")
            .to_ascii_uppercase()
    }

    /// The effective timeout in milliseconds.
    pub fn timeout_ms_or_default(&self) -> u64 {
        self.timeout_ms.unwrap_or(30_000)
    }

    /// Whether `insecure_tls` carries one of its truthy forms.
    pub fn insecure_tls_requested(&self) -> bool {
        match &self.insecure_tls {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "on"),
            _ => false,
        }
    }

    /// The requested stream token, if any.
    ///
    /// Falls back to the `X-Relay-Stream` header (case-insensitive) when the
    /// `stream` field is absent or falsy.
    pub fn stream_token(&self) -> Option<String> {
        let from_field = match &self.stream {
            Some(Value::Bool(true)) => Some("true".to_string()),
            Some(Value::String(s)) if !s.trim().is_empty() => {
                Some(s.trim().to_ascii_lowercase())
            }
            _ => None,
        };
        from_field.or_else(|| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("x-relay-stream"))
                .map(|(_, v)| v.trim().to_ascii_lowercase())
        })
    }

    /// Whether the descriptor requests a streaming response.
    pub fn wants_stream(&self) -> bool {
        self.stream_token()
            .is_some_and(|t| STREAM_TOKENS.contains(&t.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn from_json(v: Value) -> RequestDescriptor {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn defaults_apply() {
        let d = from_json(json!({}));
        assert_eq!(d.method_or_default(), "GET");
        assert_eq!(d.timeout_ms_or_default(), 30_000);
        assert!(!d.wants_stream());
        assert!(!d.insecure_tls_requested());
    }

    #[test]
    fn service_hint_prefers_service_over_target() {
        let d = from_json(json!({"service": "a", "target": "b"}));
        assert_eq!(d.service_hint(), Some("a"));
        let d = from_json(json!({"target": "b"}));
        assert_eq!(d.service_hint(), Some("b"));
    }

    #[test]
    fn stream_token_accepts_bool_and_strings() {
        assert!(from_json(json!({"stream": true})).wants_stream());
        assert!(from_json(json!({"stream": "lines"})).wants_stream());
        assert!(from_json(json!({"stream": "CHUNKS"})).wants_stream());
        assert!(!from_json(json!({"stream": false})).wants_stream());
        assert!(!from_json(json!({"stream": "never"})).wants_stream());
    }

    #[test]
    fn stream_token_falls_back_to_header() {
        let d = from_json(json!({"headers": {"X-Relay-Stream": "sse"}}));
        assert_eq!(d.stream_token().as_deref(), Some("sse"));
        assert!(d.wants_stream());

        // Explicit false on the field still defers to the header.
        let d = from_json(json!({"stream": false, "headers": {"x-relay-stream": "ndjson"}}));
        assert!(d.wants_stream());
    }

    #[test]
    fn insecure_tls_truthy_forms() {
        assert!(from_json(json!({"insecure_tls": true})).insecure_tls_requested());
        assert!(from_json(json!({"insecure_tls": "1"})).insecure_tls_requested());
        assert!(from_json(json!({"insecure_tls": "on"})).insecure_tls_requested());
        assert!(!from_json(json!({"insecure_tls": "no"})).insecure_tls_requested());
        assert!(!from_json(json!({"insecure_tls": false})).insecure_tls_requested());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let d = from_json(json!({"service": "asr", "x_extra": 1}));
        assert_eq!(d.service.as_deref(), Some("asr"));
    }
}
