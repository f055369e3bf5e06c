// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmesh-http
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The HTTP execution side of a relay identity: a pool of workers that pull
//! request jobs, perform upstream HTTP with transport-only retries, and turn
//! each response into either a single terminal DM or an ordered stream of
//! begin/frame/keepalive/end DMs.

mod headers;
mod stream;
mod worker;

pub use headers::{filename_from_content_disposition, lowercased_headers};
pub use stream::{StreamMode, infer_stream_mode};
pub use worker::{HttpTuning, Job, WorkerPool, resolve_url};

use thiserror::Error;

/// Errors surfaced to callers as terminal `relay.response` DMs.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The descriptor named a service with no configured base URL.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// The descriptor carried an unusable HTTP method.
    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    /// Every transport attempt failed.
    #[error("request failed after {attempts} attempts: {source}")]
    Transport {
        /// Number of attempts made.
        attempts: u32,
        /// The final transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The response body could not be read.
    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),
}
