// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmesh-sidecar
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Supervision of one overlay bridge sidecar per identity: spawn with the
//! identity's environment, pump its standard streams, restart with
//! exponential backoff, and own a durable bounded send queue that survives
//! sidecar restarts so accepted work is not lost across reconnections.

mod backoff;
mod queue;
mod stop;
mod supervisor;

pub use backoff::RestartBackoff;
pub use queue::{DmQueue, QueuedDm};
pub use stop::StopToken;
pub use supervisor::{
    SidecarConfig, SidecarEvent, SidecarHandle, SidecarSupervisor, interpret_line,
};

use thiserror::Error;

/// Errors from sidecar process management.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// Failed to spawn the bridge process.
    #[error("failed to spawn bridge: {0}")]
    Spawn(#[source] std::io::Error),

    /// The bridge process lacked a piped standard stream.
    #[error("bridge stdio unavailable: {0}")]
    Stdio(&'static str),
}
