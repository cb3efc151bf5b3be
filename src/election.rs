//! Master election by rank comparison, and master-loss recovery planning.
//!
//! There is no ballot exchange: every node already knows every peer's rank
//! from advertisement headers, so the election is a local, deterministic
//! comparison. Ties resolve in favor of self — a node only yields to a
//! strictly higher rank.

use std::sync::Arc;

use tracing::debug;

use crate::cluster::NodeStatus;
use crate::peers::PeerDirectory;

/// Local election verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionDecision {
    /// Own rank beats (or ties) every undecided peer.
    BecomeMaster,
    /// A peer holds a strictly higher rank; follow it.
    Yield { winner_id: String },
    /// Not applicable right now (self is no longer undecided).
    NotApplicable,
}

/// Recovery plan after losing the master link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterRecovery {
    /// Serving masters exist; enqueue and connect.
    UseAvailable(Vec<String>),
    /// Only flagged-but-not-serving masters remain; wait for one to serve.
    AwaitFlagged(Vec<String>),
    /// Nobody left to follow; run the election from scratch.
    Reelect,
}

pub struct ElectionCoordinator {
    directory: Arc<PeerDirectory>,
}

impl ElectionCoordinator {
    pub fn new(directory: Arc<PeerDirectory>) -> Self {
        Self { directory }
    }

    /// Compare own rank against the highest-ranked undecided peer.
    /// Only meaningful while self is still `UNDECIDED`.
    pub fn choose_master(&self, own_rank: u32, own_status: NodeStatus) -> ElectionDecision {
        if own_status != NodeStatus::Undecided {
            return ElectionDecision::NotApplicable;
        }
        match self.directory.undecided_with_max_rank() {
            Some((peer_id, peer_rank)) if peer_rank > own_rank => {
                debug!(%peer_id, peer_rank, own_rank, "yielding to higher rank");
                ElectionDecision::Yield { winner_id: peer_id }
            }
            _ => ElectionDecision::BecomeMaster,
        }
    }

    /// After master loss: prefer masters that are serving right now over
    /// ones merely flagged as masters; with neither, re-elect.
    pub fn plan_master_recovery(&self) -> MasterRecovery {
        let available = self.directory.available_master_ids();
        if !available.is_empty() {
            return MasterRecovery::UseAvailable(available);
        }
        let flagged = self.directory.master_ids();
        if !flagged.is_empty() {
            return MasterRecovery::AwaitFlagged(flagged);
        }
        MasterRecovery::Reelect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SelfInfo;
    use crate::proto::MessageHeader;
    use crate::transport::PeerHandle;

    fn directory_with(peers: &[(&str, u32, NodeStatus, bool)]) -> Arc<PeerDirectory> {
        let directory = Arc::new(PeerDirectory::new());
        for (index, (id, rank, status, is_master)) in peers.iter().enumerate() {
            let mut info = SelfInfo::new(
                (*id).to_string(),
                format!("name-{id}"),
                format!("02:{id}"),
                *rank,
            );
            info.status = *status;
            info.is_master = *is_master;
            directory.upsert(PeerHandle(index as u64), &MessageHeader::from(&info));
        }
        directory
    }

    #[test]
    fn highest_rank_wins() {
        let election = ElectionCoordinator::new(directory_with(&[
            ("a", 10, NodeStatus::Undecided, false),
            ("b", 50, NodeStatus::Undecided, false),
        ]));
        assert_eq!(
            election.choose_master(30, NodeStatus::Undecided),
            ElectionDecision::Yield {
                winner_id: "b".into()
            }
        );
    }

    #[test]
    fn equal_max_rank_resolves_to_self() {
        let election = ElectionCoordinator::new(directory_with(&[(
            "a",
            30,
            NodeStatus::Undecided,
            false,
        )]));
        assert_eq!(
            election.choose_master(30, NodeStatus::Undecided),
            ElectionDecision::BecomeMaster
        );
    }

    #[test]
    fn decided_peers_do_not_vote() {
        let election = ElectionCoordinator::new(directory_with(&[
            ("a", 99, NodeStatus::Master, true),
            ("b", 5, NodeStatus::Undecided, false),
        ]));
        assert_eq!(
            election.choose_master(10, NodeStatus::Undecided),
            ElectionDecision::BecomeMaster
        );
    }

    #[test]
    fn election_only_runs_while_undecided() {
        let election = ElectionCoordinator::new(directory_with(&[]));
        assert_eq!(
            election.choose_master(10, NodeStatus::Client),
            ElectionDecision::NotApplicable
        );
    }

    #[test]
    fn recovery_prefers_serving_masters() {
        let election = ElectionCoordinator::new(directory_with(&[
            ("serving", 10, NodeStatus::Master, true),
            ("flagged", 20, NodeStatus::Undecided, true),
        ]));
        assert_eq!(
            election.plan_master_recovery(),
            MasterRecovery::UseAvailable(vec!["serving".into()])
        );
    }

    #[test]
    fn recovery_waits_on_flagged_masters() {
        let election = ElectionCoordinator::new(directory_with(&[(
            "flagged",
            20,
            NodeStatus::Undecided,
            true,
        )]));
        assert_eq!(
            election.plan_master_recovery(),
            MasterRecovery::AwaitFlagged(vec!["flagged".into()])
        );
    }

    #[test]
    fn recovery_reelects_when_no_masters_remain() {
        let election = ElectionCoordinator::new(directory_with(&[(
            "peer",
            20,
            NodeStatus::Undecided,
            false,
        )]));
        assert_eq!(election.plan_master_recovery(), MasterRecovery::Reelect);
    }
}
