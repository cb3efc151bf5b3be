//! Discovered-peer bookkeeping.

mod directory;

pub use directory::{PeerDirectory, PeerRecord, UpsertOutcome};
