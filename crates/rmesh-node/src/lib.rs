// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmesh-node
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! One relay identity: translates overlay DMs into HTTP jobs, enforces the
//! service assignment (emitting redirects for services owned elsewhere), and
//! funnels responses back through the identity's sidecar queue.

mod counters;
mod node;
mod translate;

pub use counters::{NodeCounters, NodeSnapshot};
pub use node::{AssignmentLookup, NodeSettings, RelayNode, ServiceAssignment};
pub use translate::{
    TranslateError, request_from_asr_audio, request_from_asr_end, request_from_asr_events,
    request_from_asr_start,
};
