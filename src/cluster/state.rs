//! Coordinated RTT measurement across a sub-cluster unit.
//!
//! The unit measures in a fixed chain — server, then out-client, then
//! in-client — so only one member ranges at a time. Each member blocks
//! until its upstream neighbour reports RTT_FINISHED, with a liveness
//! escape should that neighbour vanish mid-wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::NodeStatus;
use crate::coordinator::Coordinator;
use crate::util::await_condition;

pub struct RoleStateMachine {
    coordinator: Weak<Coordinator>,
    rtt_in_progress: AtomicBool,
    /// Clients we cut loose when measuring started; the master waits for
    /// all of them to come back before returning to MASTER.
    disconnected_clients: Mutex<Vec<String>>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl RoleStateMachine {
    pub fn new(
        coordinator: Weak<Coordinator>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            rtt_in_progress: AtomicBool::new(false),
            disconnected_clients: Mutex::new(Vec::new()),
            poll_interval,
            shutdown,
        }
    }

    fn coordinator(&self) -> Option<Arc<Coordinator>> {
        self.coordinator.upgrade()
    }

    pub fn is_rtt_in_progress(&self) -> bool {
        self.rtt_in_progress.load(Ordering::SeqCst)
    }

    /// Master entry point: start a measurement round for the whole unit.
    pub async fn initialize_rtt_measure(&self) {
        let Some(coordinator) = self.coordinator() else {
            return;
        };
        if self.rtt_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("rtt round starting");
        coordinator.set_accepts_connections(false).await;
        coordinator.change_status(NodeStatus::RttInProgress).await;
        let forwarded = coordinator.forward_rtt_request().await;
        debug!(forwarded, "rtt start forwarded to connected peers");
        self.measure(&coordinator).await;
    }

    /// A connected peer told us a round began. Wait for our upstream
    /// neighbour in the chain, then measure.
    pub fn on_rtt_request(self: &Arc<Self>) {
        let state = self.clone();
        tokio::spawn(async move {
            let Some(coordinator) = state.coordinator() else {
                return;
            };
            if state.rtt_in_progress.swap(true, Ordering::SeqCst) {
                return;
            }
            let snapshot = coordinator.self_info();
            match snapshot.status {
                NodeStatus::ClientServer => {
                    state
                        .wait_for_peer_finished(&coordinator, &snapshot.master_id)
                        .await;
                }
                NodeStatus::ClientOut => {
                    state
                        .wait_for_role_finished(&coordinator, NodeStatus::ClientServer)
                        .await;
                }
                NodeStatus::ClientIn => {
                    state
                        .wait_for_role_finished(&coordinator, NodeStatus::ClientOut)
                        .await;
                }
                other => {
                    debug!(status = %other, "rtt request in non-unit role, measuring directly");
                }
            }
            state.measure(&coordinator).await;
        });
    }

    /// A master tears its links down when a round starts, so losing our
    /// server outside a round means our unit began measuring without us
    /// hearing the request.
    pub fn on_server_lost(self: &Arc<Self>) {
        if !self.is_rtt_in_progress() {
            self.on_rtt_request();
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn wait_for_role_finished(&self, coordinator: &Arc<Coordinator>, role: NodeStatus) {
        let cluster_id = coordinator.self_info().master_id;
        let Some(peer_id) = coordinator
            .directory()
            .peer_by_cluster_and_status(&cluster_id, role)
        else {
            debug!(%role, "no upstream peer in unit, measuring immediately");
            return;
        };
        self.wait_for_peer_finished(coordinator, &peer_id).await;
    }

    async fn wait_for_peer_finished(&self, coordinator: &Arc<Coordinator>, peer_id: &str) {
        if peer_id.is_empty() {
            return;
        }
        let directory = coordinator.directory();
        let finished = await_condition(
            || {
                directory
                    .get(peer_id)
                    .map(|record| record.status == NodeStatus::RttFinished)
                    .unwrap_or(false)
            },
            self.poll_interval,
            || directory.contains(peer_id),
            &self.shutdown,
        )
        .await;
        if !finished {
            warn!(peer_id, "upstream peer lost mid-wait, proceeding");
        }
    }

    /// Drop every socket, run the ranging round, then hand off to the
    /// completion path.
    async fn measure(&self, coordinator: &Arc<Coordinator>) {
        coordinator.set_accepts_connections(false).await;
        let targets = coordinator.cluster_ranging_targets();

        coordinator.disconnect_all_servers().await;
        let dropped = coordinator.disconnect_all_clients().await;
        *self.disconnected_clients.lock().unwrap() = dropped;

        // Let the disconnects propagate before occupying the radio.
        tokio::time::sleep(Duration::from_millis(300)).await;

        if let Err(error) = coordinator.run_measurement(&targets).await {
            warn!(%error, "measurement round failed");
        }
        self.on_rtt_finished(coordinator).await;
    }

    async fn on_rtt_finished(&self, coordinator: &Arc<Coordinator>) {
        coordinator.change_status(NodeStatus::RttFinished).await;
        self.rtt_in_progress.store(false, Ordering::SeqCst);

        let snapshot = coordinator.self_info();
        if !snapshot.is_master {
            coordinator.reconnect_to_master().await;
            return;
        }

        // Re-open the door first, otherwise the dropped clients can never
        // come back.
        coordinator.set_accepts_connections(true).await;
        self.wait_for_clients_reconnect(coordinator).await;
        coordinator.start_rtt_cycle_timer();
        coordinator.change_status(NodeStatus::Master).await;
        info!("rtt round complete, back to MASTER");
    }

    async fn wait_for_clients_reconnect(&self, coordinator: &Arc<Coordinator>) {
        loop {
            let next = self.disconnected_clients.lock().unwrap().first().cloned();
            let Some(client_id) = next else {
                break;
            };
            let directory = coordinator.directory();
            let coordinator_for_wait = coordinator.clone();
            let reconnected = await_condition(
                || coordinator_for_wait.is_client_connected(&client_id),
                self.poll_interval,
                || directory.contains(&client_id),
                &self.shutdown,
            )
            .await;
            if !reconnected {
                debug!(client_id, "client never returned after rtt round");
            }
            self.disconnected_clients
                .lock()
                .unwrap()
                .retain(|id| id != &client_id);
            if self.shutdown.is_cancelled() {
                break;
            }
        }
    }
}
