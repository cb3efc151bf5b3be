//! Node role/status lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a node within the mesh.
///
/// Starts at `Undecided`; `Closing` is terminal. The declaration order
/// doubles as the assignment order of the sub-cluster role pool
/// (server before out-client before in-client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Undecided,
    Master,
    Client,
    ClientServer,
    ClientServerAwaitsReconnect,
    ClientOut,
    ClientIn,
    RttInProgress,
    RttFinished,
    Closing,
}

impl NodeStatus {
    /// Wire spelling, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Undecided => "UNDECIDED",
            NodeStatus::Master => "MASTER",
            NodeStatus::Client => "CLIENT",
            NodeStatus::ClientServer => "CLIENT_SERVER",
            NodeStatus::ClientServerAwaitsReconnect => "CLIENT_SERVER_AWAITS_RECONNECT",
            NodeStatus::ClientOut => "CLIENT_OUT",
            NodeStatus::ClientIn => "CLIENT_IN",
            NodeStatus::RttInProgress => "RTT_IN_PROGRESS",
            NodeStatus::RttFinished => "RTT_FINISHED",
            NodeStatus::Closing => "CLOSING",
        }
    }

    /// Whether this node currently serves inside a sub-cluster unit.
    pub fn is_sub_cluster_role(&self) -> bool {
        matches!(
            self,
            NodeStatus::ClientServer | NodeStatus::ClientOut | NodeStatus::ClientIn
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNDECIDED" => Ok(NodeStatus::Undecided),
            "MASTER" => Ok(NodeStatus::Master),
            "CLIENT" => Ok(NodeStatus::Client),
            "CLIENT_SERVER" => Ok(NodeStatus::ClientServer),
            "CLIENT_SERVER_AWAITS_RECONNECT" => Ok(NodeStatus::ClientServerAwaitsReconnect),
            "CLIENT_OUT" => Ok(NodeStatus::ClientOut),
            "CLIENT_IN" => Ok(NodeStatus::ClientIn),
            "RTT_IN_PROGRESS" => Ok(NodeStatus::RttInProgress),
            "RTT_FINISHED" => Ok(NodeStatus::RttFinished),
            "CLOSING" => Ok(NodeStatus::Closing),
            other => Err(crate::error::Error::Protocol(format!(
                "unknown status {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_spelling_round_trips() {
        for status in [
            NodeStatus::Undecided,
            NodeStatus::ClientServerAwaitsReconnect,
            NodeStatus::RttInProgress,
            NodeStatus::Closing,
        ] {
            assert_eq!(status.as_str().parse::<NodeStatus>().unwrap(), status);
        }
    }

    #[test]
    fn role_pool_order_is_server_out_in() {
        let mut roles = vec![
            NodeStatus::ClientIn,
            NodeStatus::ClientServer,
            NodeStatus::ClientOut,
        ];
        roles.sort();
        assert_eq!(
            roles,
            vec![
                NodeStatus::ClientServer,
                NodeStatus::ClientOut,
                NodeStatus::ClientIn
            ]
        );
    }
}
