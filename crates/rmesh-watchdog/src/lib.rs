// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmesh-watchdog
#![warn(missing_docs)]
//!
//! Supervision of the local backend services a relay fronts: one-time source
//! acquisition, child-process launch with log redirection, restart schedules
//! with parking after repeated failures, port freeing, health probing, and
//! the system-fallback path for the language-model proxy.

mod definition;
mod ports;
mod terminal;
mod watchdog;

pub use definition::{HealthProbe, ServiceDefinition, default_definitions};
pub use ports::{free_ports, pids_on_port, port_in_use};
pub use watchdog::{ServiceSnapshot, ServiceWatchdog, WatchdogConfig};

use thiserror::Error;

/// Errors from watchdog setup.
#[derive(Debug, Error)]
pub enum WatchdogError {
    /// `git` is not on PATH; sources cannot be acquired.
    #[error("git is required for the service watchdog; please install git")]
    GitMissing,

    /// The shallow clone did not succeed.
    #[error("clone of {repo} failed: {detail}")]
    CloneFailed {
        /// Repository URL.
        repo: String,
        /// Exit status or stderr excerpt.
        detail: String,
    },

    /// The designated script is absent from the cloned repository.
    #[error("service script {script} not found in repo {repo}")]
    ScriptMissing {
        /// Script path inside the repository.
        script: String,
        /// Repository URL.
        repo: String,
    },

    /// Filesystem failure.
    #[error("watchdog i/o error: {0}")]
    Io(#[from] std::io::Error),
}
