//! Cluster role model: node status lifecycle, own-node info, sub-cluster topology.

mod state;
mod status;

pub use state::RoleStateMachine;
pub use status::NodeStatus;

use serde::{Deserialize, Serialize};

/// This node's own identity and advertised state.
///
/// One instance per process, mutated only through the [`Coordinator`]
/// (single-writer funnel); everything else reads snapshots.
///
/// [`Coordinator`]: crate::coordinator::Coordinator
#[derive(Debug, Clone)]
pub struct SelfInfo {
    pub id: String,
    pub name: String,
    pub mac: String,
    /// Election tie-break value, chosen randomly once at startup.
    pub rank: u32,
    /// Empty while no master is known.
    pub master_id: String,
    pub is_master: bool,
    pub accepts_connections: bool,
    pub status: NodeStatus,
}

impl SelfInfo {
    pub fn new(id: String, name: String, mac: String, rank: u32) -> Self {
        Self {
            id,
            name,
            mac,
            rank,
            master_id: String::new(),
            is_master: false,
            accepts_connections: true,
            status: NodeStatus::Undecided,
        }
    }

    /// The cluster this node belongs to: its master's id, or its own id
    /// when it is the master.
    pub fn cluster_id(&self) -> &str {
        if self.is_master {
            &self.id
        } else {
            &self.master_id
        }
    }
}

/// Position of a node within its fixed-size sub-cluster unit, exchanged as
/// the JSON body of the cluster-info update messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub cluster_id: String,
    #[serde(default)]
    pub close_neighbour_id: String,
    #[serde(default)]
    pub farther_neighbour_id: String,
}

impl ClusterTopology {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
