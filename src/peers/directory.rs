//! Directory of discovered peers and their advertised attributes.
//!
//! Uses DashMap so concurrent discovery callbacks never lose updates —
//! every mutation is atomic per entry, nothing locks the whole map.

use std::time::Instant;

use dashmap::DashMap;

use crate::cluster::NodeStatus;
use crate::proto::MessageHeader;
use crate::transport::PeerHandle;

/// Last advertised state of a peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub handle: PeerHandle,
    pub rank: u32,
    pub mac: String,
    pub name: String,
    pub status: NodeStatus,
    pub accepts_connections: bool,
    /// The peer's own cluster id (its master's id).
    pub cluster_id: String,
    pub is_master: bool,
    pub last_seen: Instant,
}

impl PeerRecord {
    fn new(handle: PeerHandle, header: &MessageHeader) -> Self {
        Self {
            handle,
            rank: header.rank,
            mac: header.mac.clone(),
            name: header.name.clone(),
            status: header.status,
            accepts_connections: header.accepts_connections,
            cluster_id: header.master_id.clone(),
            is_master: header.is_master,
            last_seen: Instant::now(),
        }
    }
}

/// What an upsert did, so the caller can react to state edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First sighting of this peer.
    Inserted,
    /// Status or accept-flag changed; record replaced wholesale.
    Updated,
    /// Re-announcement without relevant change.
    Unchanged,
    /// Peer announced CLOSING and was removed.
    Removed,
}

#[derive(Default)]
pub struct PeerDirectory {
    peers: DashMap<String, PeerRecord>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Insert or update a peer from an advertisement or message header.
    ///
    /// Idempotent: a re-announcement that changes neither status nor the
    /// accept-flag only refreshes the liveness timestamp. A CLOSING
    /// announcement removes the peer immediately.
    pub fn upsert(&self, handle: PeerHandle, header: &MessageHeader) -> UpsertOutcome {
        if header.status == NodeStatus::Closing {
            self.peers.remove(&header.sender_id);
            return UpsertOutcome::Removed;
        }

        match self.peers.entry(header.sender_id.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PeerRecord::new(handle, header));
                UpsertOutcome::Inserted
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.status != header.status
                    || existing.accepts_connections != header.accepts_connections
                {
                    slot.insert(PeerRecord::new(handle, header));
                    UpsertOutcome::Updated
                } else {
                    slot.get_mut().last_seen = Instant::now();
                    UpsertOutcome::Unchanged
                }
            }
        }
    }

    pub fn remove(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.remove(peer_id).map(|(_, record)| record)
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|entry| entry.clone())
    }

    /// Liveness check used by every blocking wait.
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Mark a peer's status locally without waiting for its next
    /// announcement (used when forwarding an RTT start request).
    pub fn set_status(&self, peer_id: &str, status: NodeStatus) {
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            entry.status = status;
        }
    }

    pub fn filter_by_status(&self, status: NodeStatus) -> Vec<(String, PeerRecord)> {
        self.peers
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn ids_where(&self, predicate: impl Fn(&PeerRecord) -> bool) -> Vec<String> {
        self.peers
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Highest-ranked peer that is still undecided, for the election.
    pub fn undecided_with_max_rank(&self) -> Option<(String, u32)> {
        self.peers
            .iter()
            .filter(|entry| entry.status == NodeStatus::Undecided)
            .max_by_key(|entry| entry.rank)
            .map(|entry| (entry.key().clone(), entry.rank))
    }

    /// Peers flagged as masters that are not currently serving.
    pub fn master_ids(&self) -> Vec<String> {
        self.ids_where(|record| record.is_master && record.status != NodeStatus::Master)
    }

    /// Masters currently serving and reachable.
    pub fn available_master_ids(&self) -> Vec<String> {
        self.ids_where(|record| record.is_master && record.status == NodeStatus::Master)
    }

    /// First peer matching a cluster and role; upstream lookup for the
    /// coordinated RTT chain.
    pub fn peer_by_cluster_and_status(
        &self,
        cluster_id: &str,
        status: NodeStatus,
    ) -> Option<String> {
        self.peers
            .iter()
            .find(|entry| entry.cluster_id == cluster_id && entry.status == status)
            .map(|entry| entry.key().clone())
    }

    /// MAC → display-name map over one cluster's members, the input for a
    /// ranging round.
    pub fn mac_map_for_cluster(&self, cluster_id: &str) -> Vec<(String, String)> {
        self.peers
            .iter()
            .filter(|entry| !entry.mac.is_empty() && entry.cluster_id == cluster_id)
            .map(|entry| (entry.mac.clone(), entry.name.clone()))
            .collect()
    }

    /// Drop peers whose advertisements stopped. Returns the removed ids.
    pub fn sweep_expired(&self, max_age: std::time::Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| now.duration_since(entry.last_seen) > max_age)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SelfInfo;

    fn header(id: &str, status: NodeStatus, accepts: bool, rank: u32) -> MessageHeader {
        let mut info = SelfInfo::new(id.into(), format!("name-{id}"), format!("02:{id}"), rank);
        info.status = status;
        info.accepts_connections = accepts;
        MessageHeader::from(&info)
    }

    #[test]
    fn upsert_then_get_returns_latest() {
        let dir = PeerDirectory::new();
        let outcome = dir.upsert(PeerHandle(1), &header("a", NodeStatus::Undecided, true, 5));
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let outcome = dir.upsert(PeerHandle(1), &header("a", NodeStatus::Master, true, 5));
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(dir.get("a").unwrap().status, NodeStatus::Master);
    }

    #[test]
    fn unchanged_reannouncement_is_a_no_op() {
        let dir = PeerDirectory::new();
        dir.upsert(PeerHandle(1), &header("a", NodeStatus::Client, true, 5));
        let outcome = dir.upsert(PeerHandle(1), &header("a", NodeStatus::Client, true, 5));
        assert_eq!(outcome, UpsertOutcome::Unchanged);
    }

    #[test]
    fn closing_announcement_removes_peer() {
        let dir = PeerDirectory::new();
        dir.upsert(PeerHandle(1), &header("a", NodeStatus::Client, true, 5));
        let outcome = dir.upsert(PeerHandle(1), &header("a", NodeStatus::Closing, true, 5));
        assert_eq!(outcome, UpsertOutcome::Removed);
        assert!(dir.get("a").is_none());
    }

    #[test]
    fn max_rank_only_considers_undecided() {
        let dir = PeerDirectory::new();
        dir.upsert(PeerHandle(1), &header("a", NodeStatus::Undecided, true, 10));
        dir.upsert(PeerHandle(2), &header("b", NodeStatus::Master, true, 99));
        dir.upsert(PeerHandle(3), &header("c", NodeStatus::Undecided, true, 30));

        let (id, rank) = dir.undecided_with_max_rank().unwrap();
        assert_eq!(id, "c");
        assert_eq!(rank, 30);
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let dir = PeerDirectory::new();
        dir.upsert(PeerHandle(1), &header("a", NodeStatus::Client, true, 5));
        let removed = dir.sweep_expired(std::time::Duration::from_secs(60));
        assert!(removed.is_empty());
        assert!(dir.contains("a"));
    }
}
