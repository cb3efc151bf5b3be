//! Server side: capacity limits, serialized network setup, and the
//! sub-cluster role pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::arbiter::ArbiterEvent;
use crate::cluster::NodeStatus;
use crate::transport::PeerHandle;

/// The three sub-roles a master hands out, in assignment order.
pub const ROLE_POOL: [NodeStatus; 3] = [
    NodeStatus::ClientServer,
    NodeStatus::ClientOut,
    NodeStatus::ClientIn,
];

/// Outcome of an admission attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// No setup in flight; start connecting immediately.
    Start,
    /// Another setup is running; the client was queued FIFO.
    Queued,
    /// Capacity exhausted; the request must be rejected.
    Rejected,
}

struct RoleChangeTimer {
    role: NodeStatus,
    cancel: CancellationToken,
}

pub struct ServerArbiter {
    client_count: AtomicUsize,
    setup_in_flight: AtomicBool,
    setup_queue: Mutex<VecDeque<(String, PeerHandle)>>,
    setup_timers: DashMap<String, CancellationToken>,
    role_pool: Mutex<Vec<NodeStatus>>,
    role_timers: DashMap<String, RoleChangeTimer>,
    max_clients: usize,
    max_master_links: usize,
    role_change_timeout: Duration,
    setup_timeout: Duration,
    events: mpsc::UnboundedSender<ArbiterEvent>,
}

impl ServerArbiter {
    pub fn new(
        max_clients: usize,
        max_master_links: usize,
        role_change_timeout: Duration,
        setup_timeout: Duration,
        events: mpsc::UnboundedSender<ArbiterEvent>,
    ) -> Self {
        Self {
            client_count: AtomicUsize::new(0),
            setup_in_flight: AtomicBool::new(false),
            setup_queue: Mutex::new(VecDeque::new()),
            setup_timers: DashMap::new(),
            role_pool: Mutex::new(ROLE_POOL.to_vec()),
            role_timers: DashMap::new(),
            max_clients,
            max_master_links,
            role_change_timeout,
            setup_timeout,
            events,
        }
    }

    fn cap(&self, sub_cluster_server_mode: bool) -> usize {
        // A node serving purely as a sub-cluster server only holds the
        // master link; everyone else takes up to the client cap.
        if sub_cluster_server_mode {
            self.max_master_links
        } else {
            self.max_clients
        }
    }

    /// Whether a new connection would currently be admitted. Advisory, for
    /// the advertised accept-flag; the binding check happens inside
    /// [`ServerArbiter::try_admit`].
    pub fn can_accept(&self, sub_cluster_server_mode: bool) -> bool {
        self.client_count.load(Ordering::SeqCst) < self.cap(sub_cluster_server_mode)
    }

    /// Admit a connection request if capacity allows. The capacity check and
    /// the count bump are one atomic update, so two concurrent requests can
    /// never both squeeze through the last slot.
    pub fn try_admit(
        self: &Arc<Self>,
        peer_id: &str,
        handle: PeerHandle,
        sub_cluster_server_mode: bool,
    ) -> Admission {
        let cap = self.cap(sub_cluster_server_mode);
        if self
            .client_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < cap).then_some(count + 1)
            })
            .is_err()
        {
            return Admission::Rejected;
        }
        if self
            .setup_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.arm_setup_timer(peer_id);
            Admission::Start
        } else {
            self.setup_queue
                .lock()
                .unwrap()
                .push_back((peer_id.to_string(), handle));
            debug!(peer_id, "admitted client queued behind in-flight setup");
            Admission::Queued
        }
    }

    /// Called when the in-flight setup completes (open, failure or timeout).
    /// Returns the next queued client, with the in-flight slot already
    /// re-taken for it and its setup timer armed.
    pub fn setup_finished(self: &Arc<Self>) -> Option<(String, PeerHandle)> {
        let next = self.setup_queue.lock().unwrap().pop_front();
        match &next {
            Some((peer_id, _)) => self.arm_setup_timer(peer_id),
            None => self.setup_in_flight.store(false, Ordering::SeqCst),
        }
        next
    }

    /// The admitted client's stream opened; its setup timer is disarmed.
    pub fn setup_opened(&self, peer_id: &str) {
        if let Some((_, cancel)) = self.setup_timers.remove(peer_id) {
            cancel.cancel();
        }
    }

    /// The admitted client is gone before its stream opened: disarm the
    /// timer and release the capacity it held.
    pub fn cancel_setup(&self, peer_id: &str) {
        self.setup_opened(peer_id);
        self.on_client_gone();
    }

    /// The timeout path. Returns `true` when the setup was still pending,
    /// with the held capacity released.
    pub fn take_setup_timed_out(&self, peer_id: &str) -> bool {
        if self.setup_timers.remove(peer_id).is_some() {
            self.on_client_gone();
            true
        } else {
            false
        }
    }

    fn arm_setup_timer(self: &Arc<Self>, peer_id: &str) {
        let cancel = CancellationToken::new();
        self.setup_timers.insert(peer_id.to_string(), cancel.clone());
        let events = self.events.clone();
        let peer = peer_id.to_string();
        let timeout = self.setup_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = events.send(ArbiterEvent::SetupTimedOut { peer_id: peer });
                }
            }
        });
    }

    pub fn on_client_gone(&self) {
        // Saturating: a lost client that never finished setup may race the
        // admission bookkeeping.
        let _ = self
            .client_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
    }

    /// Full reset on master-role assumption or teardown.
    pub fn reset(&self) {
        self.client_count.store(0, Ordering::SeqCst);
        self.setup_in_flight.store(false, Ordering::SeqCst);
        self.setup_queue.lock().unwrap().clear();
        *self.role_pool.lock().unwrap() = ROLE_POOL.to_vec();
        for entry in self.setup_timers.iter() {
            entry.value().cancel();
        }
        self.setup_timers.clear();
        for entry in self.role_timers.iter() {
            entry.cancel.cancel();
        }
        self.role_timers.clear();
    }

    // Role pool -----------------------------------------------------------

    /// Take the next available sub-role; an exhausted pool hands out the
    /// generic CLIENT role, never blocks or errors.
    pub fn next_role(&self) -> NodeStatus {
        let mut pool = self.role_pool.lock().unwrap();
        if pool.is_empty() {
            NodeStatus::Client
        } else {
            pool.remove(0)
        }
    }

    /// Return a role after its holder disconnected or declined.
    pub fn return_role(&self, role: NodeStatus) {
        if !ROLE_POOL.contains(&role) {
            return;
        }
        let mut pool = self.role_pool.lock().unwrap();
        if !pool.contains(&role) {
            pool.push(role);
            pool.sort();
        }
    }

    pub fn available_roles(&self) -> Vec<NodeStatus> {
        self.role_pool.lock().unwrap().clone()
    }

    /// Arm the role-change acknowledgment timer: if the client does not
    /// confirm within the timeout, the offered role goes back to the pool.
    pub fn begin_role_change(self: &Arc<Self>, client_id: &str, offered: NodeStatus) {
        let cancel = CancellationToken::new();
        self.role_timers.insert(
            client_id.to_string(),
            RoleChangeTimer {
                role: offered,
                cancel: cancel.clone(),
            },
        );
        let arbiter = self.clone();
        let client = client_id.to_string();
        let timeout = self.role_change_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some((_, timer)) = arbiter.role_timers.remove(&client) {
                        warn!(client_id = %client, role = %timer.role, "role change unacknowledged, reclaiming slot");
                        arbiter.return_role(timer.role);
                    }
                }
            }
        });
    }

    /// The client acknowledged a role change; its previous role frees up.
    pub fn acknowledge_role_change(&self, client_id: &str, previous_role: NodeStatus) {
        if let Some((_, timer)) = self.role_timers.remove(client_id) {
            timer.cancel.cancel();
            self.return_role(previous_role);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter() -> Arc<ServerArbiter> {
        let (events, _rx) = mpsc::unbounded_channel();
        Arc::new(ServerArbiter::new(
            3,
            1,
            Duration::from_millis(20),
            Duration::from_secs(5),
            events,
        ))
    }

    #[tokio::test]
    async fn admission_is_atomic_against_capacity() {
        let arbiter = arbiter();
        assert_eq!(arbiter.try_admit("a", PeerHandle(1), false), Admission::Start);
        assert_eq!(arbiter.try_admit("b", PeerHandle(2), false), Admission::Queued);
        assert_eq!(arbiter.try_admit("c", PeerHandle(3), false), Admission::Queued);
        assert_eq!(
            arbiter.try_admit("d", PeerHandle(4), false),
            Admission::Rejected
        );
    }

    #[tokio::test]
    async fn sub_cluster_server_cap_is_one() {
        let arbiter = arbiter();
        assert_eq!(arbiter.try_admit("m", PeerHandle(1), true), Admission::Start);
        assert_eq!(
            arbiter.try_admit("n", PeerHandle(2), true),
            Admission::Rejected
        );
    }

    #[tokio::test]
    async fn concurrent_admissions_never_exceed_capacity() {
        let arbiter = arbiter();
        let mut tasks = Vec::new();
        for i in 0..16u64 {
            let arbiter = arbiter.clone();
            tasks.push(tokio::spawn(async move {
                arbiter.try_admit(&format!("p{i}"), PeerHandle(i), false) != Admission::Rejected
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn setup_is_serialized_fifo() {
        let arbiter = arbiter();
        assert_eq!(arbiter.try_admit("a", PeerHandle(1), false), Admission::Start);
        assert_eq!(arbiter.try_admit("b", PeerHandle(2), false), Admission::Queued);
        assert_eq!(arbiter.try_admit("c", PeerHandle(3), false), Admission::Queued);

        arbiter.setup_opened("a");
        let (next, _) = arbiter.setup_finished().unwrap();
        assert_eq!(next, "b");
        arbiter.setup_opened("b");
        let (next, _) = arbiter.setup_finished().unwrap();
        assert_eq!(next, "c");
        arbiter.setup_opened("c");
        assert!(arbiter.setup_finished().is_none());

        // Slot released only after the queue drained, and capacity only
        // after a client leaves.
        arbiter.on_client_gone();
        assert_eq!(arbiter.try_admit("d", PeerHandle(4), false), Admission::Start);
    }

    #[tokio::test]
    async fn stalled_setup_times_out_and_frees_the_slot() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let arbiter = Arc::new(ServerArbiter::new(
            3,
            1,
            Duration::from_millis(20),
            Duration::from_millis(30),
            events,
        ));
        assert_eq!(arbiter.try_admit("a", PeerHandle(1), false), Admission::Start);
        assert_eq!(arbiter.try_admit("b", PeerHandle(2), false), Admission::Queued);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ArbiterEvent::SetupTimedOut {
                peer_id: "a".into()
            }
        );
        assert!(arbiter.take_setup_timed_out("a"));
        assert!(!arbiter.take_setup_timed_out("a"), "slot released twice");

        let (next, _) = arbiter.setup_finished().unwrap();
        assert_eq!(next, "b");
        assert!(arbiter.can_accept(false));
    }

    #[tokio::test]
    async fn opened_setup_never_times_out() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let arbiter = Arc::new(ServerArbiter::new(
            3,
            1,
            Duration::from_millis(20),
            Duration::from_millis(30),
            events,
        ));
        assert_eq!(arbiter.try_admit("a", PeerHandle(1), false), Admission::Start);
        arbiter.setup_opened("a");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
        assert!(!arbiter.take_setup_timed_out("a"));
    }

    #[test]
    fn role_pool_assigns_in_order_and_falls_back_to_client() {
        let arbiter = arbiter();
        assert_eq!(arbiter.next_role(), NodeStatus::ClientServer);
        assert_eq!(arbiter.next_role(), NodeStatus::ClientOut);
        assert_eq!(arbiter.next_role(), NodeStatus::ClientIn);
        assert_eq!(arbiter.next_role(), NodeStatus::Client);

        arbiter.return_role(NodeStatus::ClientIn);
        arbiter.return_role(NodeStatus::ClientServer);
        assert_eq!(
            arbiter.available_roles(),
            vec![NodeStatus::ClientServer, NodeStatus::ClientIn]
        );
    }

    #[test]
    fn generic_client_role_never_reenters_the_pool() {
        let arbiter = arbiter();
        arbiter.return_role(NodeStatus::Client);
        assert_eq!(arbiter.available_roles(), ROLE_POOL.to_vec());
    }

    #[tokio::test]
    async fn unacknowledged_role_change_reclaims_the_slot() {
        let arbiter = arbiter();
        let offered = arbiter.next_role();
        assert_eq!(offered, NodeStatus::ClientServer);
        arbiter.begin_role_change("c1", offered);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(arbiter.available_roles().contains(&NodeStatus::ClientServer));
    }

    #[tokio::test]
    async fn acknowledged_role_change_returns_previous_role() {
        let arbiter = arbiter();
        let offered = arbiter.next_role();
        arbiter.begin_role_change("c1", offered);
        arbiter.acknowledge_role_change("c1", NodeStatus::ClientIn);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let roles = arbiter.available_roles();
        assert!(roles.contains(&NodeStatus::ClientIn));
        assert!(!roles.contains(&NodeStatus::ClientServer));
    }
}
