// SPDX-License-Identifier: MIT OR Apache-2.0
//! Response-header helpers: lowercased maps and filename extraction.

use reqwest::header::HeaderMap;
use std::collections::BTreeMap;

/// Collect response headers into a map with lowercased names.
///
/// Non-UTF-8 header values are replaced lossily; repeated names keep the
/// last value.
pub fn lowercased_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        out.insert(
            name.as_str().to_ascii_lowercase(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }
    out
}

/// Extract a filename from a `Content-Disposition` header.
///
/// Supports the RFC 5987 form `filename*=UTF-8''…` (percent-decoded) and the
/// plain `filename="…"` / `filename=…` forms, in that order of preference.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();

    if let Some(idx) = lower.find("filename*=utf-8''") {
        let rest = &value[idx + "filename*=utf-8''".len()..];
        let end = rest.find(';').unwrap_or(rest.len());
        let encoded = rest[..end].trim();
        if !encoded.is_empty() {
            return Some(percent_decode(encoded));
        }
    }

    if let Some(idx) = lower.find("filename=") {
        let rest = &value[idx + "filename=".len()..];
        let rest = rest.trim_start();
        let name = if let Some(stripped) = rest.strip_prefix('"') {
            stripped.split('"').next().unwrap_or_default()
        } else {
            rest.split(';').next().unwrap_or_default().trim()
        };
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    None
}

/// Minimal percent-decoder for RFC 5987 filename values.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
