//! The coordination hub.
//!
//! One instance per process. It owns the node's identity, reacts to
//! discovery and stream events from the transport, and drives the
//! election, connection arbitration, role handshakes, distance gossip and
//! clock sync. Components never talk to each other directly; everything
//! funnels through here, so all identity mutations happen on one path.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arbiter::{Admission, ArbiterEvent, ClientArbiter, ServerArbiter};
use crate::clock::ClockSync;
use crate::cluster::{ClusterTopology, NodeStatus, RoleStateMachine, SelfInfo};
use crate::config::Config;
use crate::election::{ElectionCoordinator, ElectionDecision, MasterRecovery};
use crate::error::{Error, Result};
use crate::peers::{PeerDirectory, UpsertOutcome};
use crate::proto::{MeshMessage, MessageHeader, MessageType};
use crate::ranging::{
    results_map_from_json, results_map_to_json, DistanceEngine, DistanceReport, RangingProvider,
};
use crate::transport::{
    ConnectionObserver, MeshTransport, PeerDiscoveryObserver, PeerHandle, PeerLink,
};
use crate::util::await_condition;

pub struct Coordinator {
    config: Config,
    info: RwLock<SelfInfo>,
    topology: RwLock<ClusterTopology>,
    directory: Arc<PeerDirectory>,
    election: ElectionCoordinator,
    client_arbiter: ClientArbiter,
    server_arbiter: Arc<ServerArbiter>,
    engine: Arc<DistanceEngine>,
    clock: ClockSync,
    state: Arc<RoleStateMachine>,
    transport: std::sync::OnceLock<Arc<dyn MeshTransport>>,

    /// Links where we are the client, keyed by the server's id. At most the
    /// master link plus one cluster bridge.
    client_links: DashMap<String, PeerLink>,
    /// Links where we are the server, keyed by the client's id.
    server_links: DashMap<String, PeerLink>,
    /// Established cluster bridges: link peer id -> foreign cluster id.
    cluster_links: DashMap<String, String>,
    /// Whether this cluster currently holds a confirmed bridge to another.
    cluster_linked: AtomicBool,

    ping_active: AtomicBool,
    closing: AtomicBool,
    shutdown: CancellationToken,
    events_tx: mpsc::UnboundedSender<ArbiterEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ArbiterEvent>>>,
    weak_self: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(config: Config, info: SelfInfo, provider: Arc<dyn RangingProvider>) -> Arc<Self> {
        let directory = Arc::new(PeerDirectory::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let poll_interval = Duration::from_millis(config.mesh.poll_interval_ms);

        Arc::new_cyclic(|weak: &Weak<Coordinator>| Self {
            election: ElectionCoordinator::new(directory.clone()),
            client_arbiter: ClientArbiter::new(
                Duration::from_millis(config.arbiter.response_timeout_ms),
                events_tx.clone(),
            ),
            server_arbiter: Arc::new(ServerArbiter::new(
                config.arbiter.max_clients,
                config.arbiter.max_master_links,
                Duration::from_millis(config.arbiter.role_change_timeout_ms),
                Duration::from_millis(config.arbiter.response_timeout_ms),
                events_tx.clone(),
            )),
            engine: Arc::new(DistanceEngine::new(provider, config.ranging.clone())),
            clock: ClockSync::new(),
            state: Arc::new(RoleStateMachine::new(
                weak.clone(),
                poll_interval,
                shutdown.child_token(),
            )),
            topology: RwLock::new(ClusterTopology::default()),
            transport: std::sync::OnceLock::new(),
            client_links: DashMap::new(),
            server_links: DashMap::new(),
            cluster_links: DashMap::new(),
            cluster_linked: AtomicBool::new(false),
            ping_active: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            weak_self: weak.clone(),
            config,
            info: RwLock::new(info),
            directory,
            shutdown,
        })
    }

    /// Attach the transport after construction (the coordinator itself is
    /// the transport's observer, so it has to exist first).
    pub fn bind_transport(&self, transport: Arc<dyn MeshTransport>) {
        let _ = self.transport.set(transport);
    }

    /// Spawn the background loops: advertising + liveness sweeping, the
    /// arbiter timeout pump, and the initial election kick.
    pub fn start(self: &Arc<Self>) {
        self.spawn_advertise_loop();
        self.spawn_event_loop();

        let coordinator = self.clone();
        let settle = Duration::from_millis(2 * self.config.mesh.advertise_interval_ms);
        tokio::spawn(async move {
            // Let a couple of advertisement rounds pass so the directory
            // reflects who is actually out there before the first election.
            tokio::select! {
                _ = coordinator.shutdown.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }
            coordinator.request_next_connection().await;
        });
    }

    /// Graceful teardown: announce CLOSING, give the announcement one
    /// advertisement interval to propagate, then cut everything.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing");
        {
            let mut info = self.info.write().unwrap();
            info.status = NodeStatus::Closing;
        }
        self.advertise().await;
        self.stop_pings();
        self.state.close();
        self.client_arbiter.cancel_all();

        tokio::time::sleep(Duration::from_millis(self.config.mesh.advertise_interval_ms)).await;

        for link in self.client_links.iter() {
            link.close();
        }
        for link in self.server_links.iter() {
            link.close();
        }
        self.client_links.clear();
        self.server_links.clear();
        self.shutdown.cancel();
    }

    // Snapshots -----------------------------------------------------------

    pub fn self_info(&self) -> SelfInfo {
        self.info.read().unwrap().clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.info.read().unwrap().status
    }

    pub fn topology(&self) -> ClusterTopology {
        self.topology.read().unwrap().clone()
    }

    pub fn directory(&self) -> Arc<PeerDirectory> {
        self.directory.clone()
    }

    pub fn engine(&self) -> &Arc<DistanceEngine> {
        &self.engine
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    /// Every distance report this node currently holds, own and gossiped.
    pub fn distances(&self) -> std::collections::HashMap<String, DistanceReport> {
        self.engine.results()
    }

    /// Re-run the clock handshake with the current master on demand.
    pub async fn sync_time_with_master(&self) -> Result<()> {
        let snapshot = self.self_info();
        let link = self
            .client_links
            .get(&snapshot.master_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::Unreachable {
                peer_id: snapshot.master_id.clone(),
            })?;
        link.send(MeshMessage::new(
            MessageType::SyncRequest,
            self.clock.request_content(),
            &snapshot,
        ))
        .await
    }

    pub(crate) fn is_client_connected(&self, client_id: &str) -> bool {
        self.server_links.contains_key(client_id)
    }

    fn closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn transport(&self) -> Option<Arc<dyn MeshTransport>> {
        self.transport.get().cloned()
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.mesh.poll_interval_ms)
    }

    // Identity mutations --------------------------------------------------

    /// Change own status and re-advertise. CLOSING is terminal; any change
    /// after it is refused.
    pub(crate) async fn change_status(&self, status: NodeStatus) {
        {
            let mut info = self.info.write().unwrap();
            if info.status == NodeStatus::Closing || info.status == status {
                return;
            }
            debug!(from = %info.status, to = %status, "status change");
            info.status = status;
        }
        self.advertise().await;
    }

    pub(crate) async fn set_accepts_connections(&self, accepts: bool) {
        {
            let mut info = self.info.write().unwrap();
            if info.accepts_connections == accepts {
                return;
            }
            info.accepts_connections = accepts;
        }
        self.advertise().await;
    }

    /// Recompute the accept-flag from current capacity and status.
    async fn update_accepts_connections(&self) {
        let (status, current) = {
            let info = self.info.read().unwrap();
            (info.status, info.accepts_connections)
        };
        let desired = match status {
            NodeStatus::RttInProgress | NodeStatus::Closing => false,
            _ => self.server_arbiter.can_accept(matches!(
                status,
                NodeStatus::ClientServer | NodeStatus::ClientServerAwaitsReconnect
            )),
        };
        if desired != current {
            self.set_accepts_connections(desired).await;
        }
    }

    async fn advertise(&self) {
        let header = MessageHeader::from(&self.self_info());
        if let Some(transport) = self.transport() {
            if let Err(error) = transport.advertise(header).await {
                warn!(%error, "advertisement failed");
            }
        }
    }

    // Background loops ----------------------------------------------------

    fn spawn_advertise_loop(self: &Arc<Self>) {
        let coordinator = self.clone();
        let interval = Duration::from_millis(self.config.mesh.advertise_interval_ms);
        let max_age = interval * self.config.mesh.liveness_misses;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                coordinator.advertise().await;
                for peer_id in coordinator.directory.sweep_expired(max_age) {
                    info!(peer_id, "peer advertisements stopped, dropping");
                    coordinator.handle_peer_departed(&peer_id).await;
                }
            }
        });
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let Some(mut events_rx) = self.events_rx.lock().unwrap().take() else {
            return;
        };
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    ArbiterEvent::RequestTimedOut { target_id } => {
                        if coordinator.client_arbiter.take_timed_out(&target_id) {
                            warn!(target_id, "connection request timed out");
                            coordinator.handle_request_failure(&target_id, None).await;
                        }
                    }
                    ArbiterEvent::SetupTimedOut { peer_id } => {
                        if coordinator.server_arbiter.take_setup_timed_out(&peer_id) {
                            warn!(peer_id, "accepted client never connected, freeing its slot");
                            coordinator.drain_setup_queue().await;
                            coordinator.update_accepts_connections().await;
                        }
                    }
                }
            }
        });
    }

    // Connection search ---------------------------------------------------

    /// Find somewhere to belong: drain the candidate-server queue first,
    /// otherwise run the election and either assume the master role or wait
    /// for the winner to start serving.
    pub async fn request_next_connection(self: &Arc<Self>) {
        loop {
            if self.closing() {
                return;
            }
            while let Some(candidate) = self.client_arbiter.pop_candidate() {
                let accepts = self
                    .directory
                    .get(&candidate)
                    .map(|record| record.accepts_connections)
                    .unwrap_or(false);
                if accepts {
                    self.request_connection(&candidate).await;
                    return;
                }
            }

            let snapshot = self.self_info();
            match self.election.choose_master(snapshot.rank, snapshot.status) {
                ElectionDecision::BecomeMaster => {
                    self.become_master().await;
                    return;
                }
                ElectionDecision::Yield { winner_id } => {
                    debug!(%winner_id, "waiting for elected master to serve");
                }
                ElectionDecision::NotApplicable => return,
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(
                    self.config.mesh.advertise_interval_ms,
                )) => {}
            }
        }
    }

    /// Send a REQUEST_SOCKET datagram and arm the response timeout.
    pub(crate) async fn request_connection(&self, target_id: &str) {
        if self.closing() {
            return;
        }
        let Some(record) = self.directory.get(target_id) else {
            debug!(target_id, "request target unknown, skipping");
            return;
        };
        if !self.client_arbiter.register(target_id) {
            return;
        }
        debug!(target_id, "requesting connection");
        let message = MeshMessage::new(
            MessageType::RequestSocket,
            MeshMessage::EMPTY_CONTENT,
            &self.self_info(),
        );
        if let Some(transport) = self.transport() {
            if let Err(error) = transport.send_datagram(record.handle, &message).await {
                warn!(%error, target_id, "connection request send failed");
                // Funnel through the timeout path so the fallback policy
                // runs exactly once, on the event loop.
                let _ = self.events_tx.send(ArbiterEvent::RequestTimedOut {
                    target_id: target_id.to_string(),
                });
            }
        }
    }

    /// Status-dependent fallback after a timeout, rejection, or failed
    /// stream setup.
    async fn handle_request_failure(
        self: &Arc<Self>,
        target_id: &str,
        rejector_status: Option<NodeStatus>,
    ) {
        if self.closing() {
            return;
        }
        if rejector_status == Some(NodeStatus::RttInProgress) {
            // The server is mid-round; it will serve again shortly.
            tokio::time::sleep(self.poll_interval()).await;
            self.request_connection(target_id).await;
            return;
        }

        let snapshot = self.self_info();
        match snapshot.status {
            NodeStatus::RttFinished => {
                if !snapshot.master_id.is_empty() && self.directory.contains(&snapshot.master_id) {
                    tokio::time::sleep(self.poll_interval()).await;
                    self.request_connection(&snapshot.master_id).await;
                } else {
                    self.master_connection_lost().await;
                }
            }
            NodeStatus::Undecided => {
                self.master_connection_lost().await;
            }
            NodeStatus::Client => {
                self.client_arbiter.push_candidate(target_id);
                tokio::time::sleep(self.poll_interval()).await;
                self.request_next_connection().await;
            }
            NodeStatus::Master
            | NodeStatus::ClientServer
            | NodeStatus::ClientServerAwaitsReconnect => {
                // A failed bridge attempt; the next suitable advertisement
                // retriggers it.
                self.cluster_linked.store(false, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    async fn become_master(&self) {
        let id = {
            let mut info = self.info.write().unwrap();
            if info.status == NodeStatus::Closing {
                return;
            }
            info.is_master = true;
            info.master_id.clear();
            info.status = NodeStatus::Master;
            info.accepts_connections = true;
            info.id.clone()
        };
        self.topology.write().unwrap().cluster_id = id;
        self.server_arbiter.reset();
        self.client_arbiter.clear_candidates();
        self.advertise().await;
        self.start_rtt_cycle_timer();
        info!("assumed MASTER role");

        // A bridge candidate may already sit in the directory; new
        // announcements alone would never retrigger it.
        let own_id = self.self_info().id;
        let bridge_target = self
            .directory
            .ids_where(|record| {
                record.status == NodeStatus::ClientServer
                    && record.accepts_connections
                    && record.cluster_id != own_id
            })
            .into_iter()
            .next();
        if let Some(target) = bridge_target {
            self.request_connection(&target).await;
        }
    }

    /// Master link gone for real: revert to UNDECIDED and plan recovery.
    async fn master_connection_lost(self: &Arc<Self>) {
        if self.closing() {
            return;
        }
        self.stop_pings();
        let old_master = {
            let mut info = self.info.write().unwrap();
            if info.status == NodeStatus::Closing {
                return;
            }
            info.status = NodeStatus::Undecided;
            std::mem::take(&mut info.master_id)
        };
        if let Some((_, link)) = self.client_links.remove(&old_master) {
            link.close();
        }
        self.client_arbiter.cancel_all();
        self.client_arbiter.clear_candidates();
        self.advertise().await;
        info!(%old_master, "master connection lost, recovering");

        match self.election.plan_master_recovery() {
            MasterRecovery::UseAvailable(ids) => {
                self.client_arbiter.push_candidates(ids);
                self.request_next_connection().await;
            }
            MasterRecovery::AwaitFlagged(ids) => {
                let coordinator = self.clone();
                let directory = self.directory.clone();
                let poll = self.poll_interval();
                tokio::spawn(async move {
                    let flagged = ids.first().cloned().unwrap_or_default();
                    await_condition(
                        || !directory.available_master_ids().is_empty(),
                        poll,
                        || directory.contains(&flagged),
                        &coordinator.shutdown,
                    )
                    .await;
                    // Either a master serves now or the flagged peer is
                    // gone; both cases re-run the search.
                    coordinator
                        .client_arbiter
                        .push_candidates(directory.available_master_ids());
                    coordinator.request_next_connection().await;
                });
            }
            MasterRecovery::Reelect => {
                // Peers that lost the same master flip to UNDECIDED around
                // now; give their announcements one interval to land so the
                // re-election sees the full field. Spawned so the caller
                // (often a transport notification) is not held up.
                let coordinator = self.clone();
                let delay = Duration::from_millis(self.config.mesh.advertise_interval_ms);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = coordinator.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    coordinator.request_next_connection().await;
                });
            }
        }
    }

    // Server side ---------------------------------------------------------

    async fn handle_incoming_request(&self, handle: PeerHandle, header: &MessageHeader) {
        let snapshot = self.self_info();
        let sub_mode = matches!(
            snapshot.status,
            NodeStatus::ClientServer | NodeStatus::ClientServerAwaitsReconnect
        );
        let admission = if snapshot.accepts_connections {
            self.server_arbiter
                .try_admit(&header.sender_id, handle, sub_mode)
        } else {
            Admission::Rejected
        };
        match admission {
            Admission::Start => self.send_accept(&header.sender_id, handle, sub_mode).await,
            Admission::Queued => {}
            Admission::Rejected => {
                debug!(peer_id = %header.sender_id, "rejecting connection request");
                let reject = MeshMessage::new(
                    MessageType::RejectConnection,
                    snapshot.status.as_str(),
                    &snapshot,
                );
                if let Some(transport) = self.transport() {
                    if let Err(error) = transport.send_datagram(handle, &reject).await {
                        warn!(%error, "rejection send failed");
                    }
                }
                return;
            }
        }
        self.update_accepts_connections().await;
    }

    async fn send_accept(&self, peer_id: &str, handle: PeerHandle, sub_mode: bool) {
        let kind = if sub_mode {
            MessageType::AcceptClusterConnection
        } else {
            MessageType::AcceptConnection
        };
        let message = MeshMessage::new(kind, MeshMessage::EMPTY_CONTENT, &self.self_info());
        if let Some(transport) = self.transport() {
            if let Err(error) = transport.send_datagram(handle, &message).await {
                warn!(%error, peer_id, "accept send failed");
                self.server_arbiter.cancel_setup(peer_id);
                Box::pin(self.drain_setup_queue()).await;
            }
        }
    }

    /// Start the next queued network setup, if any.
    async fn drain_setup_queue(&self) {
        if let Some((next_id, next_handle)) = self.server_arbiter.setup_finished() {
            debug!(next_id, "starting next queued setup");
            let sub_mode = matches!(
                self.status(),
                NodeStatus::ClientServer | NodeStatus::ClientServerAwaitsReconnect
            );
            self.send_accept(&next_id, next_handle, sub_mode).await;
        }
    }

    /// A sub-role holder left; promote another unit member into the freed
    /// role, in-clients first so the chain refills from its quiet end.
    async fn promote_replacement(&self, freed: NodeStatus) {
        let preference: &[NodeStatus] = match freed {
            NodeStatus::ClientServer => &[
                NodeStatus::ClientIn,
                NodeStatus::ClientOut,
                NodeStatus::Client,
            ],
            NodeStatus::ClientOut => &[NodeStatus::ClientIn, NodeStatus::Client],
            _ => &[NodeStatus::Client],
        };
        let connected: Vec<String> = self
            .server_links
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let candidate = preference.iter().find_map(|wanted| {
            connected
                .iter()
                .find(|id| {
                    self.directory
                        .get(id)
                        .map(|record| record.status == *wanted)
                        .unwrap_or(false)
                })
                .cloned()
        });
        let Some(client_id) = candidate else {
            return;
        };
        let role = self.server_arbiter.next_role();
        if role == NodeStatus::Client {
            return;
        }
        info!(%client_id, %role, "promoting client into freed role");
        self.server_arbiter.begin_role_change(&client_id, role);
        if let Some(link) = self.server_links.get(&client_id).map(|e| e.clone()) {
            let message = MeshMessage::new(MessageType::StatusUpdate, role.as_str(), &self.self_info());
            if let Err(error) = link.send(message).await {
                warn!(%error, %client_id, "role offer send failed");
            }
        }
    }

    // Client side ---------------------------------------------------------

    async fn handle_accept(self: &Arc<Self>, server_id: &str, is_cluster_link: bool) {
        if !self.client_arbiter.resolve(server_id) {
            debug!(server_id, "late accept ignored");
            return;
        }
        let Some(record) = self.directory.get(server_id) else {
            return;
        };
        let Some(transport) = self.transport() else {
            return;
        };
        match transport.open_stream(record.handle).await {
            Ok(link) => self.on_server_connected(server_id, link, is_cluster_link).await,
            Err(error) => {
                warn!(%error, server_id, "stream setup failed");
                self.handle_request_failure(server_id, None).await;
            }
        }
    }

    async fn on_server_connected(&self, server_id: &str, link: PeerLink, is_cluster_link: bool) {
        self.client_links.insert(server_id.to_string(), link.clone());
        if is_cluster_link && self.self_info().is_master {
            // Bridged into a foreign cluster through its sub-cluster
            // server; identity unchanged, topology arrives over the link.
            debug!(server_id, "cluster bridge link established");
            self.share_results(&link).await;
            return;
        }
        self.adopt_master(server_id, &link).await;
    }

    /// Follow a new (or re-joined) master: sync the clock, ask for a role,
    /// start keepalives.
    async fn adopt_master(&self, server_id: &str, link: &PeerLink) {
        {
            let mut info = self.info.write().unwrap();
            if info.status == NodeStatus::Closing {
                return;
            }
            info.master_id = server_id.to_string();
            info.is_master = false;
            info.status = NodeStatus::Client;
            info.accepts_connections = true;
        }
        self.topology.write().unwrap().cluster_id = server_id.to_string();
        self.client_arbiter.clear_candidates();
        self.advertise().await;

        let snapshot = self.self_info();
        let sync = MeshMessage::new(
            MessageType::SyncRequest,
            self.clock.request_content(),
            &snapshot,
        );
        let role_request =
            MeshMessage::new(MessageType::RequestStatus, MeshMessage::EMPTY_CONTENT, &snapshot);
        if let Err(error) = link.send(sync).await {
            warn!(%error, server_id, "clock sync request failed");
        }
        if let Err(error) = link.send(role_request).await {
            warn!(%error, server_id, "role request failed");
        }
        self.share_results(link).await;
        self.start_pings(server_id);
        info!(master_id = server_id, "joined cluster");
    }

    async fn share_results(&self, link: &PeerLink) {
        let results = self.engine.results();
        if results.is_empty() {
            return;
        }
        let message = MeshMessage::new(
            MessageType::RttInit,
            results_map_to_json(&results),
            &self.self_info(),
        );
        if let Err(error) = link.send(message).await {
            debug!(%error, "results share failed");
        }
    }

    fn start_pings(&self, server_id: &str) {
        self.ping_active.store(true, Ordering::SeqCst);
        let Some(coordinator) = self.weak_self.upgrade() else {
            return;
        };
        let server = server_id.to_string();
        let interval = Duration::from_millis(self.config.mesh.ping_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !coordinator.ping_active.load(Ordering::SeqCst) {
                    break;
                }
                let Some(link) = coordinator.client_links.get(&server).map(|e| e.clone()) else {
                    break;
                };
                let ping = MeshMessage::new(
                    MessageType::Ping,
                    MeshMessage::EMPTY_CONTENT,
                    &coordinator.self_info(),
                );
                if link.send(ping).await.is_err() {
                    break;
                }
            }
        });
    }

    pub(crate) fn stop_pings(&self) {
        self.ping_active.store(false, Ordering::SeqCst);
    }

    // RTT round support (called by the role state machine) ----------------

    pub(crate) fn state(&self) -> &Arc<RoleStateMachine> {
        &self.state
    }

    /// Arm the next periodic measurement round.
    pub(crate) fn start_rtt_cycle_timer(&self) {
        let Some(coordinator) = self.weak_self.upgrade() else {
            return;
        };
        let interval = Duration::from_millis(self.config.ranging.cycle_interval_ms);
        let cycle: BoxFuture<'static, ()> = Box::pin(async move {
            tokio::select! {
                _ = coordinator.shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            coordinator.stop_pings();
            let snapshot = coordinator.self_info();
            if snapshot.is_master && snapshot.status == NodeStatus::Master {
                coordinator.state.initialize_rtt_measure().await;
            }
        });
        tokio::spawn(cycle);
    }

    /// Tell every connected client a round is starting. Their directory
    /// entries flip immediately so waits don't race the announcements.
    pub(crate) async fn forward_rtt_request(&self) -> usize {
        let snapshot = self.self_info();
        // Snapshot first; sends may block and must not hold map guards.
        let links: Vec<(String, PeerLink)> = self
            .server_links
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut forwarded = 0;
        for (peer_id, link) in links {
            let message = MeshMessage::new(
                MessageType::RttRequest,
                MeshMessage::EMPTY_CONTENT,
                &snapshot,
            );
            if link.send(message).await.is_ok() {
                self.directory.set_status(&peer_id, NodeStatus::RttInProgress);
                forwarded += 1;
            }
        }
        forwarded
    }

    /// MAC/name pairs of this node's own cluster, the input for a round.
    pub(crate) fn cluster_ranging_targets(&self) -> Vec<(String, String)> {
        let snapshot = self.self_info();
        let cluster_id = snapshot.cluster_id().to_string();
        let mut targets = self.directory.mac_map_for_cluster(&cluster_id);
        if !snapshot.is_master && !snapshot.master_id.is_empty() {
            // The master's own header carries no cluster id; add it by hand.
            if let Some(master) = self.directory.get(&snapshot.master_id) {
                if !master.mac.is_empty() && !targets.iter().any(|(mac, _)| *mac == master.mac) {
                    targets.push((master.mac, master.name));
                }
            }
        }
        targets
    }

    pub(crate) async fn run_measurement(
        &self,
        targets: &[(String, String)],
    ) -> Result<DistanceReport> {
        let snapshot = self.self_info();
        self.engine
            .measure_all(&snapshot.id, &snapshot.name, targets)
            .await
    }

    pub(crate) async fn disconnect_all_servers(&self) {
        self.stop_pings();
        for link in self.client_links.iter() {
            link.close();
        }
        self.client_links.clear();
    }

    /// Cut every client loose and reset admission state; they re-join via
    /// the full request handshake after the round.
    pub(crate) async fn disconnect_all_clients(&self) -> Vec<String> {
        let dropped: Vec<String> = self
            .server_links
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for link in self.server_links.iter() {
            link.close();
        }
        self.server_links.clear();
        self.server_arbiter.reset();
        dropped
    }

    pub(crate) async fn reconnect_to_master(&self) {
        let snapshot = self.self_info();
        if snapshot.master_id.is_empty() || !self.directory.contains(&snapshot.master_id) {
            if let Some(coordinator) = self.weak_self.upgrade() {
                coordinator.master_connection_lost().await;
            }
            return;
        }
        self.request_connection(&snapshot.master_id).await;
    }

    // Gossip --------------------------------------------------------------

    /// Re-broadcast a distance report to every link except where it came
    /// from. Reports relayed by an out- or in-client stop at non-masters,
    /// which kills forwarding loops inside the unit.
    async fn gossip_report(&self, report: &DistanceReport, skip: &str, sender_status: NodeStatus) {
        let snapshot = self.self_info();
        if matches!(sender_status, NodeStatus::ClientOut | NodeStatus::ClientIn)
            && !snapshot.is_master
        {
            return;
        }
        let payload = report.to_json();
        // Snapshot first; sends may block and must not hold map guards.
        let mut links: Vec<(String, PeerLink)> = self
            .server_links
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        links.extend(
            self.client_links
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone())),
        );
        for (peer_id, link) in links {
            if peer_id != skip {
                let message =
                    MeshMessage::new(MessageType::RttBroadcast, payload.clone(), &snapshot);
                let _ = link.send(message).await;
            }
        }
    }

    // Departures ----------------------------------------------------------

    async fn handle_peer_departed(self: &Arc<Self>, peer_id: &str) {
        self.client_arbiter.remove_candidate(peer_id);
        let departed = self.directory.remove(peer_id);
        if let Some(link) = self.server_links.get(peer_id).map(|e| e.clone()) {
            // The pump reports the loss; closing here just accelerates it.
            link.close();
        }
        let snapshot = self.self_info();
        if let Some(record) = departed {
            // The link pump cannot recover the freed role once the
            // directory entry is gone; reclaim it here.
            if snapshot.is_master
                && snapshot.status == NodeStatus::Master
                && record.status.is_sub_cluster_role()
                && self.server_links.contains_key(peer_id)
            {
                self.server_arbiter.return_role(record.status);
                self.promote_replacement(record.status).await;
            }
        }
        if peer_id == snapshot.master_id
            && !matches!(
                snapshot.status,
                NodeStatus::RttInProgress | NodeStatus::RttFinished | NodeStatus::Closing
            )
        {
            self.master_connection_lost().await;
        }
    }
}

#[async_trait]
impl PeerDiscoveryObserver for Coordinator {
    async fn on_peer_announced(&self, handle: PeerHandle, header: MessageHeader) {
        if self.closing() || header.sender_id == self.self_info().id {
            return;
        }
        let outcome = self.directory.upsert(handle, &header);
        match outcome {
            UpsertOutcome::Removed => {
                if let Some(coordinator) = self.weak_self.upgrade() {
                    coordinator.handle_peer_departed(&header.sender_id).await;
                }
                return;
            }
            UpsertOutcome::Unchanged => return,
            UpsertOutcome::Inserted | UpsertOutcome::Updated => {}
        }

        let snapshot = self.self_info();
        if header.status == NodeStatus::Master
            && header.accepts_connections
            && header.sender_id != snapshot.master_id
        {
            self.client_arbiter.push_candidate(&header.sender_id);
        }

        // A foreign sub-cluster server accepting connections is our way
        // into that cluster.
        if snapshot.is_master
            && snapshot.status == NodeStatus::Master
            && !self.cluster_linked.load(Ordering::SeqCst)
            && header.status == NodeStatus::ClientServer
            && header.accepts_connections
            && header.master_id != snapshot.id
            && !self
                .cluster_links
                .iter()
                .any(|entry| *entry.value() == header.master_id)
        {
            debug!(peer_id = %header.sender_id, cluster = %header.master_id, "bridging to foreign cluster");
            self.request_connection(&header.sender_id).await;
        }
    }

    async fn on_peer_lost(&self, peer_id: &str) {
        if self.closing() {
            return;
        }
        if let Some(coordinator) = self.weak_self.upgrade() {
            coordinator.handle_peer_departed(peer_id).await;
        }
    }

    async fn on_datagram(&self, handle: PeerHandle, message: MeshMessage) {
        if self.closing() {
            return;
        }
        // Every header doubles as a presence announcement.
        self.directory.upsert(handle, &message.header);
        let Some(coordinator) = self.weak_self.upgrade() else {
            return;
        };
        let sender = message.sender_id().to_string();
        match message.kind {
            MessageType::RequestSocket => {
                coordinator.handle_incoming_request(handle, &message.header).await;
            }
            MessageType::AcceptConnection => coordinator.handle_accept(&sender, false).await,
            MessageType::AcceptClusterConnection => coordinator.handle_accept(&sender, true).await,
            MessageType::RejectConnection => {
                if coordinator.client_arbiter.resolve(&sender) {
                    let status = NodeStatus::from_str(&message.content).ok();
                    debug!(%sender, ?status, "connection rejected");
                    coordinator.handle_request_failure(&sender, status).await;
                }
            }
            MessageType::RttRequest => coordinator.state.on_rtt_request(),
            MessageType::Ping => {}
            other => debug!(kind = ?other, %sender, "unexpected datagram kind"),
        }
    }
}

#[async_trait]
impl ConnectionObserver for Coordinator {
    async fn on_link_opened(&self, peer_id: &str, link: PeerLink) {
        if self.closing() {
            link.close();
            return;
        }
        debug!(peer_id, "client link opened");
        self.server_links.insert(peer_id.to_string(), link.clone());

        // Serialized setup: this one finished, start the next if queued.
        self.server_arbiter.setup_opened(peer_id);
        self.drain_setup_queue().await;

        let mut snapshot = self.self_info();
        if snapshot.status == NodeStatus::ClientServerAwaitsReconnect {
            self.change_status(NodeStatus::ClientServer).await;
            snapshot = self.self_info();
        }
        if snapshot.status == NodeStatus::ClientServer {
            // The connecting peer is a foreign master bridging into our
            // cluster: hand it our topology and tell our own master.
            let foreign_cluster = self
                .directory
                .get(peer_id)
                .map(|record| {
                    if record.is_master {
                        peer_id.to_string()
                    } else {
                        record.cluster_id
                    }
                })
                .unwrap_or_else(|| peer_id.to_string());
            self.cluster_links
                .insert(peer_id.to_string(), foreign_cluster.clone());
            let topology = self.topology();
            let update = MeshMessage::new(
                MessageType::MasterClusterInfoUpdate,
                topology.to_json(),
                &snapshot,
            );
            if let Err(error) = link.send(update).await {
                warn!(%error, peer_id, "topology handoff failed");
            }
            if let Some(master_link) = self.client_links.get(&snapshot.master_id).map(|e| e.clone())
            {
                let established = MeshMessage::new(
                    MessageType::NewClusterConnectionEstablished,
                    foreign_cluster,
                    &snapshot,
                );
                let _ = master_link.send(established).await;
            }
        } else if snapshot.is_master {
            let update = MeshMessage::new(
                MessageType::ClientClusterInfoUpdate,
                self.topology().to_json(),
                &snapshot,
            );
            let _ = link.send(update).await;
        }

        self.share_results(&link).await;
        self.update_accepts_connections().await;
    }

    async fn on_link_message(&self, _peer_id: &str, message: MeshMessage) {
        if self.closing() {
            return;
        }
        // Stream messages carry real headers; trust the id inside over the
        // transport-level label, and refresh presence like advertisements.
        let sender = message.sender_id().to_string();
        if let Some(record) = self.directory.get(&sender) {
            self.directory.upsert(record.handle, &message.header);
        }
        let Some(coordinator) = self.weak_self.upgrade() else {
            return;
        };

        match message.kind {
            MessageType::Ping => {}
            MessageType::SyncRequest => {
                let snapshot = self.self_info();
                let reply = MeshMessage::new(
                    MessageType::SyncClock,
                    self.clock.response_content(&message.content),
                    &snapshot,
                );
                if let Some(link) = self.server_links.get(&sender).map(|e| e.clone()) {
                    let _ = link.send(reply).await;
                }
            }
            MessageType::SyncClock => self.clock.try_adjust(&message.content),
            MessageType::RequestStatus => {
                let role = self.server_arbiter.next_role();
                debug!(%sender, %role, "assigning role");
                match self.server_links.get(&sender).map(|e| e.clone()) {
                    Some(link) => {
                        let reply = MeshMessage::new(
                            MessageType::StatusUpdate,
                            role.as_str(),
                            &self.self_info(),
                        );
                        if let Err(error) = link.send(reply).await {
                            warn!(%error, %sender, "role assignment send failed");
                            self.server_arbiter.return_role(role);
                        }
                    }
                    None => self.server_arbiter.return_role(role),
                }
            }
            MessageType::StatusUpdate => {
                let Ok(new_status) = NodeStatus::from_str(&message.content) else {
                    warn!(content = %message.content, "unparseable status update");
                    return;
                };
                let snapshot = self.self_info();
                if sender != snapshot.master_id {
                    return;
                }
                if new_status.is_sub_cluster_role() {
                    // Confirm so the master can free our old role; an
                    // unconfirmed offer rolls back on its side.
                    if let Some(link) = self.client_links.get(&sender).map(|e| e.clone()) {
                        let ack = MeshMessage::new(
                            MessageType::ClientAcceptsChangeRole,
                            snapshot.status.as_str(),
                            &snapshot,
                        );
                        let _ = link.send(ack).await;
                    }
                }
                self.change_status(new_status).await;
            }
            MessageType::ClientAcceptsChangeRole => {
                if let Ok(previous) = NodeStatus::from_str(&message.content) {
                    self.server_arbiter.acknowledge_role_change(&sender, previous);
                }
            }
            MessageType::MasterClusterInfoUpdate => {
                let Ok(foreign) = ClusterTopology::from_json(&message.content) else {
                    warn!("unparseable cluster topology");
                    return;
                };
                self.cluster_links
                    .insert(sender.clone(), foreign.cluster_id.clone());
                self.cluster_linked.store(true, Ordering::SeqCst);
                {
                    let mut topology = self.topology.write().unwrap();
                    if topology.close_neighbour_id.is_empty() {
                        topology.close_neighbour_id = foreign.cluster_id;
                    } else {
                        topology.farther_neighbour_id = foreign.cluster_id;
                    }
                }
                info!(%sender, "cluster bridge confirmed");
                let snapshot = self.self_info();
                let payload = self.topology().to_json();
                // Snapshot first; sends may block and must not hold map guards.
                let links: Vec<PeerLink> = self
                    .server_links
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                for link in links {
                    let update = MeshMessage::new(
                        MessageType::ClientClusterInfoUpdate,
                        payload.clone(),
                        &snapshot,
                    );
                    let _ = link.send(update).await;
                }
            }
            MessageType::ClientClusterInfoUpdate => {
                if sender == self.self_info().master_id {
                    match ClusterTopology::from_json(&message.content) {
                        Ok(topology) => *self.topology.write().unwrap() = topology,
                        Err(error) => warn!(%error, "unparseable cluster topology"),
                    }
                }
            }
            MessageType::NewClusterConnectionEstablished => {
                self.cluster_linked.store(true, Ordering::SeqCst);
                self.cluster_links.insert(sender, message.content);
            }
            MessageType::ClusterConnectionLost => {
                self.cluster_linked.store(false, Ordering::SeqCst);
                self.cluster_links.remove(&sender);
            }
            MessageType::RttRequest => self.state.on_rtt_request(),
            MessageType::RttInit => {
                let own_id = self.self_info().id;
                match results_map_from_json(&message.content) {
                    Ok(map) => {
                        if let Some(report) = self.engine.merge_results_map(&own_id, map, &sender) {
                            coordinator
                                .gossip_report(&report, &sender, message.header.status)
                                .await;
                        }
                    }
                    Err(error) => warn!(%error, "unparseable results map"),
                }
            }
            MessageType::RttBroadcast => {
                let own_id = self.self_info().id;
                match DistanceReport::from_json(&message.content) {
                    Ok(report) => {
                        if report.node_id == own_id {
                            return;
                        }
                        self.engine.merge_report(&own_id, report.clone());
                        coordinator
                            .gossip_report(&report, &sender, message.header.status)
                            .await;
                    }
                    Err(error) => warn!(%error, "unparseable distance report"),
                }
            }
            other => debug!(kind = ?other, %sender, "unexpected stream message"),
        }
    }

    async fn on_link_lost(&self, peer_id: &str) {
        if self.closing() {
            return;
        }
        let Some(coordinator) = self.weak_self.upgrade() else {
            return;
        };

        if let Some((server_id, link)) = self.client_links.remove(peer_id) {
            link.close();
            self.stop_pings();
            let snapshot = self.self_info();
            debug!(%server_id, status = %snapshot.status, "server link lost");
            if matches!(
                snapshot.status,
                NodeStatus::RttInProgress | NodeStatus::RttFinished
            ) {
                return;
            }
            if server_id == snapshot.master_id {
                if snapshot.status.is_sub_cluster_role() || snapshot.status == NodeStatus::Client {
                    self.state.on_server_lost();
                } else {
                    coordinator.master_connection_lost().await;
                }
            } else {
                // A cluster bridge died; a new suitable advertisement will
                // retrigger bridging.
                self.cluster_links.remove(peer_id);
                self.cluster_linked.store(false, Ordering::SeqCst);
            }
            return;
        }

        if let Some((client_id, link)) = self.server_links.remove(peer_id) {
            link.close();
            let snapshot = self.self_info();
            debug!(%client_id, "client link lost");
            self.server_arbiter.on_client_gone();

            if let Some((_, foreign_cluster)) = self.cluster_links.remove(&client_id) {
                // The bridged foreign master dropped us. Hold the slot open
                // for a grace period before declaring the bridge dead.
                self.cluster_linked.store(false, Ordering::SeqCst);
                if snapshot.status == NodeStatus::ClientServer {
                    self.change_status(NodeStatus::ClientServerAwaitsReconnect).await;
                    let grace = Duration::from_millis(self.config.arbiter.reconnect_grace_ms);
                    let waiter = coordinator.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = waiter.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(grace) => {}
                        }
                        if waiter.status() == NodeStatus::ClientServerAwaitsReconnect {
                            info!(%foreign_cluster, "bridge reconnect window expired");
                            waiter.change_status(NodeStatus::ClientServer).await;
                            let snapshot = waiter.self_info();
                            if let Some(master_link) =
                                waiter.client_links.get(&snapshot.master_id).map(|e| e.clone())
                            {
                                let lost = MeshMessage::new(
                                    MessageType::ClusterConnectionLost,
                                    foreign_cluster,
                                    &snapshot,
                                );
                                let _ = master_link.send(lost).await;
                            }
                        }
                    });
                }
            } else if snapshot.is_master && snapshot.status == NodeStatus::Master {
                let freed_role = self
                    .directory
                    .get(&client_id)
                    .map(|record| record.status)
                    .filter(|status| status.is_sub_cluster_role());
                self.directory.remove(&client_id);
                if let Some(role) = freed_role {
                    self.server_arbiter.return_role(role);
                    self.promote_replacement(role).await;
                }
            }
            self.update_accepts_connections().await;
        }
    }
}
