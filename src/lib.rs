//! Leaderless proximity-mesh coordination.
//!
//! Nodes on the same network discover each other over an advertisement
//! channel, elect a master by rank, form clusters of a master plus up to
//! three role-bearing clients, measure pairwise distances with
//! round-trip-time ranging, and gossip the results until every node holds
//! the full distance picture. A lightweight two-message exchange keeps the
//! clocks aligned closely enough to coordinate measurement rounds.
//!
//! The [`coordinator::Coordinator`] is the entry point; it consumes a
//! [`transport::MeshTransport`] (UDP/TCP for real deployments, an
//! in-memory mesh for tests) and a [`ranging::RangingProvider`].

pub mod arbiter;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod peers;
pub mod proto;
pub mod ranging;
pub mod transport;
pub mod util;

pub use cluster::{ClusterTopology, NodeStatus, SelfInfo};
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{Error, Result};
