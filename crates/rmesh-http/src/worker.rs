// SPDX-License-Identifier: MIT OR Apache-2.0
//! The worker pool that executes request descriptors.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use rmesh_proto::{DmSink, OutboundDm, RequestDescriptor};

use super::HttpError;
use super::headers::lowercased_headers;
use super::stream::{StreamContext, infer_stream_mode, run_stream};

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

/// Runtime tuning for a worker pool.
#[derive(Debug, Clone)]
pub struct HttpTuning {
    /// Maximum inline response body in bytes.
    pub max_body_b: usize,
    /// Default TLS verification.
    pub verify_default: bool,
    /// Maximum frame payload for chunk-mode streams, in bytes.
    pub chunk_raw_b: usize,
    /// Heartbeat interval for quiet streams.
    pub heartbeat: Duration,
    /// Maximum lines per streaming batch.
    pub batch_lines: usize,
    /// Maximum batch age before flush.
    pub batch_latency: Duration,
    /// Transport-error attempts.
    pub retries: u32,
    /// Initial retry delay.
    pub retry_backoff: Duration,
    /// Retry delay cap.
    pub retry_cap: Duration,
}

impl Default for HttpTuning {
    fn default() -> Self {
        Self {
            max_body_b: 2 * 1024 * 1024,
            verify_default: true,
            chunk_raw_b: 12 * 1024,
            heartbeat: Duration::from_secs(10),
            batch_lines: 24,
            batch_latency: Duration::from_millis(80),
            retries: 4,
            retry_backoff: Duration::from_millis(500),
            retry_cap: Duration::from_secs(4),
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One relay request pulled by a worker.
#[derive(Debug, Clone)]
pub struct Job {
    /// Caller's overlay address, the destination for every response frame.
    pub src: String,
    /// Caller-supplied request id, echoed on every response frame.
    pub id: String,
    /// What to execute.
    pub req: RequestDescriptor,
}

/// Resolve a descriptor to an absolute URL against the target map.
pub fn resolve_url(
    req: &RequestDescriptor,
    targets: &BTreeMap<String, String>,
) -> Result<String, HttpError> {
    if let Some(url) = req.url.as_deref()
        && !url.trim().is_empty()
    {
        return Ok(url.trim().to_string());
    }
    let service = req.service_hint().unwrap_or_default().trim().to_string();
    let base = targets
        .get(&service)
        .ok_or_else(|| HttpError::UnknownService(service.clone()))?;
    let mut path = req.path.clone().unwrap_or_else(|| "/".to_string());
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    Ok(format!("{}{}", base.trim_end_matches('/'), path))
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct WorkerShared {
    tuning: HttpTuning,
    targets: BTreeMap<String, String>,
    sink: Arc<dyn DmSink>,
}

/// A pool of workers executing jobs from an unbounded in-process queue.
///
/// Each worker owns a pair of keep-alive clients (TLS-verifying and not),
/// since verification is a client-level property.
pub struct WorkerPool {
    jobs_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Job>>>,
    depth: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Start `workers` workers feeding response DMs into `sink`.
    pub fn start(
        workers: usize,
        tuning: HttpTuning,
        targets: BTreeMap<String, String>,
        sink: Arc<dyn DmSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let depth = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(WorkerShared {
            tuning,
            targets,
            sink,
        });
        for idx in 0..workers.max(1) {
            tokio::spawn(worker_loop(idx, rx.clone(), depth.clone(), shared.clone()));
        }
        Self {
            jobs_tx: std::sync::Mutex::new(Some(tx)),
            depth,
        }
    }

    /// Queue a job; returns the new queue depth, or `None` after close.
    pub fn enqueue(&self, job: Job) -> Option<usize> {
        let guard = self.jobs_tx.lock().expect("jobs sender lock poisoned");
        let tx = guard.as_ref()?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(self.depth.load(Ordering::SeqCst))
    }

    /// Current queue depth (enqueued, not yet picked up).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Close the queue; workers exit after draining it.
    pub fn close(&self) {
        self.jobs_tx
            .lock()
            .expect("jobs sender lock poisoned")
            .take();
    }
}

fn build_client(accept_invalid_certs: bool) -> Option<reqwest::Client> {
    match reqwest::Client::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
    {
        Ok(client) => Some(client),
        Err(err) => {
            error!(target: "rmesh_http", %err, "failed to build http client");
            None
        }
    }
}

async fn worker_loop(
    idx: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    depth: Arc<AtomicUsize>,
    shared: Arc<WorkerShared>,
) {
    let Some(verified) = build_client(false) else {
        return;
    };
    let Some(insecure) = build_client(true) else {
        return;
    };
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };
        depth.fetch_sub(1, Ordering::SeqCst);
        debug!(target: "rmesh_http", worker = idx, id = %job.id, "executing job");
        if let Err(err) = execute_job(&shared, &verified, &insecure, &job).await {
            warn!(target: "rmesh_http", worker = idx, id = %job.id, %err, "job failed");
            shared
                .sink
                .send(&job.src, OutboundDm::error_response(&job.id, err.to_string()));
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(target: "rmesh_http", header = %name, "unusable request header skipped"),
        }
    }
    map
}

async fn send_with_retry(
    builder: reqwest::RequestBuilder,
    tuning: &HttpTuning,
) -> Result<reqwest::Response, HttpError> {
    let attempts = tuning.retries.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        let this_try = match builder.try_clone() {
            Some(b) => b,
            // Non-cloneable request: single shot.
            None => {
                return builder.send().await.map_err(|source| HttpError::Transport {
                    attempts: 1,
                    source,
                });
            }
        };
        match this_try.send().await {
            Ok(resp) => return Ok(resp),
            Err(err) => {
                let delay = tuning
                    .retry_backoff
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(tuning.retry_cap);
                debug!(target: "rmesh_http", attempt, %err, "transport error, backing off");
                last_err = Some(err);
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(HttpError::Transport {
        attempts,
        source: last_err.expect("at least one attempt"),
    })
}

async fn execute_job(
    shared: &WorkerShared,
    verified: &reqwest::Client,
    insecure: &reqwest::Client,
    job: &Job,
) -> Result<(), HttpError> {
    let req = &job.req;
    let url = resolve_url(req, &shared.targets)?;
    let method_name = req.method_or_default();
    let method = reqwest::Method::from_bytes(method_name.as_bytes())
        .map_err(|_| HttpError::InvalidMethod(method_name.clone()))?;

    let mut verify = shared.tuning.verify_default;
    if let Some(explicit) = req.verify {
        verify = explicit;
    }
    if req.insecure_tls_requested() {
        verify = false;
    }
    let client = if verify { verified } else { insecure };

    let mut builder = client
        .request(method, url.as_str())
        .headers(header_map(&req.headers))
        .timeout(Duration::from_millis(req.timeout_ms_or_default()));

    if let Some(json) = &req.json {
        builder = builder.json(json);
    } else if let Some(b64) = &req.body_b64 {
        // Malformed base64 degrades to an empty body.
        builder = builder.body(BASE64.decode(b64.as_bytes()).unwrap_or_default());
    } else if let Some(data) = &req.data {
        builder = builder.body(data.clone());
    }

    let resp = send_with_retry(builder, &shared.tuning).await?;

    if req.wants_stream() {
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mode = infer_stream_mode(req.stream_token().as_deref(), &content_type);
        run_stream(
            StreamContext {
                sink: shared.sink.as_ref(),
                src: &job.src,
                id: &job.id,
                heartbeat: shared.tuning.heartbeat,
                batch_lines: shared.tuning.batch_lines,
                batch_latency: shared.tuning.batch_latency,
                chunk_raw_b: shared.tuning.chunk_raw_b,
            },
            resp,
            mode,
        )
        .await;
        return Ok(());
    }

    plain_response(shared, job, resp).await
}

async fn plain_response(
    shared: &WorkerShared,
    job: &Job,
    resp: reqwest::Response,
) -> Result<(), HttpError> {
    let status = resp.status().as_u16();
    let headers = lowercased_headers(resp.headers());
    let content_type = headers
        .get("content-type")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    let raw = resp.bytes().await.map_err(HttpError::Body)?;
    let truncated = raw.len() > shared.tuning.max_body_b;
    let capped = &raw[..raw.len().min(shared.tuning.max_body_b)];

    let mut json = None;
    let mut body_b64 = None;
    if content_type.contains("application/json") {
        match serde_json::from_slice(&raw) {
            Ok(value) => json = Some(value),
            Err(_) => body_b64 = Some(BASE64.encode(capped)),
        }
    } else {
        body_b64 = Some(BASE64.encode(capped));
    }

    shared.sink.send(
        &job.src,
        OutboundDm::Response {
            id: job.id.clone(),
            ok: true,
            status,
            headers,
            json,
            body_b64,
            truncated,
            error: None,
        },
    );
    Ok(())
}
