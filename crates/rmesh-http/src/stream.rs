// SPDX-License-Identifier: MIT OR Apache-2.0
//! The streaming-response state machine.
//!
//! One `begin` frame, then mode-dependent frames interleaved with keepalives,
//! then exactly one `end` frame. Sequence numbers are stream-global and
//! strictly increasing from 1; nothing follows the `end`.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use rmesh_proto::{DmSink, LineFrame, OutboundDm, epoch_ms};

use super::headers::{filename_from_content_disposition, lowercased_headers};

// ---------------------------------------------------------------------------
// Mode inference
// ---------------------------------------------------------------------------

/// How a streaming body is framed on the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Text lines, batched into `relay.response.lines` frames.
    Lines,
    /// Raw bytes, base64-encoded into `relay.response.chunk` frames.
    Chunks,
}

/// Pick the frame mode from the caller's token and the response content type.
///
/// Line-oriented tokens win outright; otherwise event-stream, NDJSON, and
/// streaming-JSON content types upgrade to line mode, and everything else
/// stays chunked.
pub fn infer_stream_mode(requested: Option<&str>, content_type: &str) -> StreamMode {
    if let Some(token) = requested {
        match token {
            "lines" | "ndjson" | "line" | "sse" | "events" => return StreamMode::Lines,
            _ => {}
        }
    }
    let ctype = content_type.to_ascii_lowercase();
    if ctype.contains("text/event-stream") || ctype.contains("application/x-ndjson") {
        return StreamMode::Lines;
    }
    if ctype.contains("json") && ctype.contains("stream") {
        return StreamMode::Lines;
    }
    StreamMode::Chunks
}

// ---------------------------------------------------------------------------
// Line assembly
// ---------------------------------------------------------------------------

/// Incremental splitter from raw bytes to text lines.
///
/// Splitting happens at byte level (`\n` cannot occur inside a multi-byte
/// UTF-8 sequence), so a chunk boundary in the middle of a character never
/// corrupts a line. Invalid UTF-8 is replaced lossily per line.
#[derive(Debug, Default)]
pub(crate) struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    /// Feed bytes; returns the complete lines they unlock, without newlines.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Flush any trailing partial line at end of stream.
    pub(crate) fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}

fn line_is_done_marker(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("done").and_then(Value::as_bool))
        == Some(true)
}

// ---------------------------------------------------------------------------
// Stream driver
// ---------------------------------------------------------------------------

/// Parameters shared by both frame modes.
pub(crate) struct StreamContext<'a> {
    pub sink: &'a dyn DmSink,
    pub src: &'a str,
    pub id: &'a str,
    pub heartbeat: Duration,
    pub batch_lines: usize,
    pub batch_latency: Duration,
    pub chunk_raw_b: usize,
}

/// Drive one streaming response to completion, `begin` through `end`.
pub(crate) async fn run_stream(ctx: StreamContext<'_>, resp: reqwest::Response, mode: StreamMode) {
    let status = resp.status().as_u16();
    let headers = lowercased_headers(resp.headers());
    let content_length = headers.get("content-length").and_then(|v| v.parse().ok());
    let filename = headers
        .get("content-disposition")
        .and_then(|cd| filename_from_content_disposition(cd));

    ctx.sink.send(
        ctx.src,
        OutboundDm::Begin {
            id: ctx.id.to_string(),
            ok: true,
            status,
            headers,
            content_length,
            filename,
            ts: epoch_ms(),
        },
    );

    match mode {
        StreamMode::Lines => stream_lines(&ctx, resp).await,
        StreamMode::Chunks => stream_chunks(&ctx, resp).await,
    }
}

async fn stream_lines(ctx: &StreamContext<'_>, resp: reqwest::Response) {
    let mut body = Box::pin(resp.bytes_stream());
    let mut assembler = LineAssembler::default();
    let mut batch: Vec<LineFrame> = Vec::new();
    let mut seq: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut total_lines: u64 = 0;
    let mut done_seen = false;
    let mut last_flush = Instant::now();
    let mut hb_deadline = Instant::now() + ctx.heartbeat;

    macro_rules! flush_batch {
        () => {
            if !batch.is_empty() {
                ctx.sink.send(
                    ctx.src,
                    OutboundDm::Lines {
                        id: ctx.id.to_string(),
                        lines: std::mem::take(&mut batch),
                    },
                );
                last_flush = Instant::now();
                hb_deadline = Instant::now() + ctx.heartbeat;
            }
        };
    }

    loop {
        tokio::select! {
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    total_bytes += bytes.len() as u64;
                    for line in assembler.push(&bytes) {
                        if line.trim().is_empty() {
                            continue;
                        }
                        seq += 1;
                        total_lines += 1;
                        if line_is_done_marker(&line) {
                            done_seen = true;
                        }
                        batch.push(LineFrame { seq, ts: epoch_ms(), line });
                        if batch.len() >= ctx.batch_lines
                            || last_flush.elapsed() >= ctx.batch_latency
                        {
                            flush_batch!();
                        }
                    }
                }
                Some(Err(err)) => {
                    flush_batch!();
                    ctx.sink.send(
                        ctx.src,
                        OutboundDm::End {
                            id: ctx.id.to_string(),
                            ok: false,
                            bytes: total_bytes,
                            last_seq: seq,
                            lines: Some(total_lines),
                            done_seen: Some(done_seen),
                            truncated: None,
                            error: Some(err.to_string()),
                        },
                    );
                    return;
                }
                None => break,
            },
            () = tokio::time::sleep_until(hb_deadline) => {
                ctx.sink.send(
                    ctx.src,
                    OutboundDm::Keepalive { id: ctx.id.to_string(), ts: epoch_ms() },
                );
                hb_deadline = Instant::now() + ctx.heartbeat;
            }
        }
    }

    if let Some(tail) = assembler.finish()
        && !tail.trim().is_empty()
    {
        seq += 1;
        total_lines += 1;
        if line_is_done_marker(&tail) {
            done_seen = true;
        }
        batch.push(LineFrame { seq, ts: epoch_ms(), line: tail });
    }
    flush_batch!();
    ctx.sink.send(
        ctx.src,
        OutboundDm::End {
            id: ctx.id.to_string(),
            ok: true,
            bytes: total_bytes,
            last_seq: seq,
            lines: Some(total_lines),
            done_seen: Some(done_seen),
            truncated: None,
            error: None,
        },
    );
}

async fn stream_chunks(ctx: &StreamContext<'_>, resp: reqwest::Response) {
    let mut body = Box::pin(resp.bytes_stream());
    let mut seq: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut hb_deadline = Instant::now() + ctx.heartbeat;

    loop {
        tokio::select! {
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    total_bytes += bytes.len() as u64;
                    for part in bytes.chunks(ctx.chunk_raw_b.max(1)) {
                        seq += 1;
                        ctx.sink.send(
                            ctx.src,
                            OutboundDm::Chunk {
                                id: ctx.id.to_string(),
                                seq,
                                b64: BASE64.encode(part),
                            },
                        );
                    }
                    hb_deadline = Instant::now() + ctx.heartbeat;
                }
                Some(Err(err)) => {
                    ctx.sink.send(
                        ctx.src,
                        OutboundDm::End {
                            id: ctx.id.to_string(),
                            ok: false,
                            bytes: total_bytes,
                            last_seq: seq,
                            lines: None,
                            done_seen: None,
                            truncated: Some(false),
                            error: Some(err.to_string()),
                        },
                    );
                    return;
                }
                None => break,
            },
            () = tokio::time::sleep_until(hb_deadline) => {
                ctx.sink.send(
                    ctx.src,
                    OutboundDm::Keepalive { id: ctx.id.to_string(), ts: epoch_ms() },
                );
                hb_deadline = Instant::now() + ctx.heartbeat;
            }
        }
    }

    ctx.sink.send(
        ctx.src,
        OutboundDm::End {
            id: ctx.id.to_string(),
            ok: true,
            bytes: total_bytes,
            last_seq: seq,
            lines: None,
            done_seen: None,
            truncated: Some(false),
            error: None,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_requested_token() {
        assert_eq!(infer_stream_mode(Some("lines"), ""), StreamMode::Lines);
        assert_eq!(infer_stream_mode(Some("ndjson"), ""), StreamMode::Lines);
        assert_eq!(infer_stream_mode(Some("sse"), ""), StreamMode::Lines);
        assert_eq!(infer_stream_mode(Some("events"), ""), StreamMode::Lines);
        assert_eq!(infer_stream_mode(Some("chunks"), ""), StreamMode::Chunks);
        assert_eq!(infer_stream_mode(Some("dm"), ""), StreamMode::Chunks);
    }

    #[test]
    fn mode_upgrades_on_content_type() {
        assert_eq!(
            infer_stream_mode(Some("chunks"), "text/event-stream; charset=utf-8"),
            StreamMode::Lines
        );
        assert_eq!(
            infer_stream_mode(None, "application/x-ndjson"),
            StreamMode::Lines
        );
        assert_eq!(
            infer_stream_mode(None, "application/stream+json"),
            StreamMode::Lines
        );
        assert_eq!(infer_stream_mode(None, "audio/wav"), StreamMode::Chunks);
    }

    #[test]
    fn assembler_splits_across_chunk_boundaries() {
        let mut a = LineAssembler::default();
        assert!(a.push(b"hel").is_empty());
        assert_eq!(a.push(b"lo\nwor"), vec!["hello".to_string()]);
        assert_eq!(a.push(b"ld\n"), vec!["world".to_string()]);
        assert_eq!(a.finish(), None);
    }

    #[test]
    fn assembler_never_splits_multibyte_chars() {
        let text = "héllo\n".as_bytes();
        let mut a = LineAssembler::default();
        // Split in the middle of the two-byte 'é'.
        assert!(a.push(&text[..2]).is_empty());
        assert_eq!(a.push(&text[2..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn assembler_keeps_trailing_partial() {
        let mut a = LineAssembler::default();
        assert_eq!(a.push(b"a\nb"), vec!["a".to_string()]);
        assert_eq!(a.finish(), Some("b".to_string()));
    }

    #[test]
    fn done_marker_detection() {
        assert!(line_is_done_marker(r#"{"done":true}"#));
        assert!(!line_is_done_marker(r#"{"done":false}"#));
        assert!(!line_is_done_marker("done"));
        assert!(!line_is_done_marker(r#"{"response":"hi"}"#));
    }
}
