//! FleetLink shared transport layer
//!
//! This crate provides the wire envelope, length-prefixed framing, the
//! request/reply and publish/subscribe sockets, and the single-worker task
//! queue used by both the resource broker and the vehicle server.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod pubsub;
pub mod reqrep;
pub mod task_queue;

use std::time::{SystemTime, UNIX_EPOCH};

pub use envelope::Reply;
pub use error::{LinkError, LinkResult};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Get current timestamp in seconds since Unix epoch
pub fn now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Timing parameters shared across components
pub mod timing {
    /// Request socket receive timeout in milliseconds
    pub const REQUEST_TIMEOUT_MS: u64 = 1000;

    /// Consecutive missed heartbeats before the link is logged as lost
    pub const HEARTBEAT_ATTEMPTS: u32 = 3;

    /// Broker evicts clients silent for longer than this (seconds)
    pub const CLIENT_STALE_S: f64 = 15.0;

    /// A vehicle must have been heard from this recently to be leased (seconds)
    pub const LEASE_FRESH_S: f64 = 20.0;

    /// Owner silence that degrades the application link (seconds)
    pub const APP_LINK_WARN_S: f64 = 5.0;

    /// Owner silence that counts as application loss (seconds)
    pub const APP_LINK_LOST_S: f64 = 10.0;
}
