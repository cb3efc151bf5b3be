//! Connection-request arbitration.
//!
//! The client side tracks outstanding connection requests and their
//! timeouts plus the queue of candidate servers; the server side enforces
//! capacity, serializes network setup, and manages the sub-cluster role
//! pool. The status-dependent fallback policy itself lives in the
//! Coordinator — timeouts surface as [`ArbiterEvent`]s.

mod client;
mod server;

pub use client::{ClientArbiter, PendingConnection};
pub use server::{Admission, ServerArbiter};

/// Timer-driven events the Coordinator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterEvent {
    /// A connection request got neither accept nor reject within the SLA.
    RequestTimedOut { target_id: String },
    /// An admitted client never opened its stream within the SLA.
    SetupTimedOut { peer_id: String },
}
