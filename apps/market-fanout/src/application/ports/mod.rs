//! Port Interfaces
//!
//! Contracts between the fan-out core and the outside world, following the
//! Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Transport`]: delivers a push payload to one session or to everyone
//! - [`ServiceMetrics`]: delivery and session counters
//!
//! ## Wire Payload
//!
//! - [`PushPayload`] / [`SnapshotView`]: the JSON shape clients receive

mod instrumentation;
mod payload;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
pub use instrumentation::MockServiceMetrics;
pub use instrumentation::{DeliveryPath, NoopMetrics, RemovalReason, ServiceMetrics};
pub use payload::{PushPayload, SnapshotView};

use crate::domain::session::SessionId;

/// Topic prefix for per-session pushes.
pub const SESSION_TOPIC_PREFIX: &str = "/topic/market/user/";

/// Topic for broadcast pushes.
pub const BROADCAST_TOPIC: &str = "/topic/market";

// =============================================================================
// Destination
// =============================================================================

/// Where a payload goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Exactly one session.
    Session(SessionId),
    /// Every listener of the broadcast topic.
    Broadcast,
}

impl Destination {
    /// Topic name the destination resolves to.
    #[must_use]
    pub fn topic(&self) -> String {
        match self {
            Self::Session(id) => format!("{SESSION_TOPIC_PREFIX}{id}"),
            Self::Broadcast => BROADCAST_TOPIC.to_string(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// A single delivery attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The transport refused the message.
    #[error("delivery to {destination} rejected: {reason}")]
    Rejected {
        /// Target topic.
        destination: String,
        /// Transport-supplied reason.
        reason: String,
    },

    /// The transport is shut down or unreachable.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// Transport Port
// =============================================================================

/// Outbound delivery capability.
///
/// Implementations must be safe to call concurrently. A successful result
/// carries the number of listeners reached, which may be zero.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `payload` to `destination`.
    async fn deliver(
        &self,
        destination: Destination,
        payload: Arc<PushPayload>,
    ) -> Result<usize, DeliveryError>;
}
