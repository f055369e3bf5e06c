// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmesh-proto
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Wire vocabulary for the relay-mesh overlay protocol.
//!
//! Three layers share this crate: the JSONL frames exchanged with a bridge
//! sidecar over its standard streams, the direct-message payloads carried on
//! the overlay itself, and the [`RequestDescriptor`] that turns an inbound DM
//! into an upstream HTTP call. All loose payload fields use
//! [`serde_json::Value`] so the crate stays independent of any runtime type.

pub mod bridge;
pub mod descriptor;
pub mod dm;
pub mod sink;

pub use bridge::{BridgeCommand, BridgeEvent, JsonlCodec};
pub use descriptor::RequestDescriptor;
pub use dm::{
    AssignmentEntry, DmOptions, InboundDm, LineFrame, OutboundDm, canonical_service, epoch_ms,
};
pub use sink::DmSink;

use thiserror::Error;

/// Errors from frame encoding and decoding.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// JSON serialization failure.
    #[error("serialization error: {0}")]
    Serialize(#[source] serde_json::Error),

    /// JSON deserialization failure.
    #[error("deserialization error: {0}")]
    Deserialize(#[source] serde_json::Error),
}
