//! In-process mesh for integration tests and simulation.
//!
//! A [`MemoryMesh`] hub routes advertisements, datagrams and streams between
//! any number of joined nodes. Every joined node gets a [`MemoryTransport`]
//! implementing the transport seam, with observers attached after the
//! coordinator is built (the coordinator is the observer).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::proto::{MeshMessage, MessageHeader};
use crate::transport::{
    ConnectionObserver, MeshTransport, PeerDiscoveryObserver, PeerHandle, PeerLink,
};

struct NodeSlot {
    node_id: String,
    handle: PeerHandle,
    last_header: RwLock<Option<MessageHeader>>,
    discovery: RwLock<Option<Arc<dyn PeerDiscoveryObserver>>>,
    connections: RwLock<Option<Arc<dyn ConnectionObserver>>>,
    /// Simulated partition: an offline node receives nothing.
    online: std::sync::atomic::AtomicBool,
}

/// Routing hub shared by all in-memory transports.
pub struct MemoryMesh {
    slots: DashMap<u64, Arc<NodeSlot>>,
    next_handle: AtomicU64,
}

impl MemoryMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Register a node and hand back its transport endpoint.
    pub fn join(self: &Arc<Self>, node_id: impl Into<String>) -> Arc<MemoryTransport> {
        let handle = PeerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(NodeSlot {
            node_id: node_id.into(),
            handle,
            last_header: RwLock::new(None),
            discovery: RwLock::new(None),
            connections: RwLock::new(None),
            online: std::sync::atomic::AtomicBool::new(true),
        });
        self.slots.insert(handle.0, slot.clone());
        Arc::new(MemoryTransport {
            mesh: self.clone(),
            slot,
        })
    }

    /// Cut a node off the mesh without a CLOSING announcement, simulating a
    /// crash or walk-away. Its links die; its advertisements stop.
    pub async fn partition(&self, node_id: &str) {
        for slot in self.slots.iter() {
            if slot.node_id == node_id {
                slot.online.store(false, Ordering::SeqCst);
            }
        }
        // Everyone else sees the peer disappear from the directory.
        for slot in self.slots.iter() {
            if slot.node_id != node_id && slot.online.load(Ordering::SeqCst) {
                if let Some(observer) = slot.discovery.read().await.clone() {
                    observer.on_peer_lost(node_id).await;
                }
            }
        }
    }

    fn slot_for_handle(&self, handle: PeerHandle) -> Option<Arc<NodeSlot>> {
        self.slots.get(&handle.0).map(|entry| entry.clone())
    }
}

/// One node's endpoint on the in-memory mesh.
pub struct MemoryTransport {
    mesh: Arc<MemoryMesh>,
    slot: Arc<NodeSlot>,
}

impl MemoryTransport {
    /// Attach the observers. Must happen before the first advertisement.
    pub async fn attach(
        &self,
        discovery: Arc<dyn PeerDiscoveryObserver>,
        connections: Arc<dyn ConnectionObserver>,
    ) {
        *self.slot.discovery.write().await = Some(discovery);
        *self.slot.connections.write().await = Some(connections);
    }

    pub fn local_handle(&self) -> PeerHandle {
        self.slot.handle
    }

    fn is_online(&self) -> bool {
        self.slot.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MeshTransport for MemoryTransport {
    async fn advertise(&self, header: MessageHeader) -> Result<()> {
        if !self.is_online() {
            return Ok(());
        }
        *self.slot.last_header.write().await = Some(header.clone());

        // Fan our header out to everyone else, and replay their last headers
        // back to us so a late joiner converges without waiting a full
        // re-advertisement period.
        for other in self.mesh.slots.iter() {
            if other.handle == self.slot.handle || !other.online.load(Ordering::SeqCst) {
                continue;
            }
            if let Some(observer) = other.discovery.read().await.clone() {
                observer
                    .on_peer_announced(self.slot.handle, header.clone())
                    .await;
            }
            if let Some(their_header) = other.last_header.read().await.clone() {
                if let Some(observer) = self.slot.discovery.read().await.clone() {
                    observer.on_peer_announced(other.handle, their_header).await;
                }
            }
        }
        Ok(())
    }

    async fn send_datagram(&self, handle: PeerHandle, message: &MeshMessage) -> Result<()> {
        let target = self
            .mesh
            .slot_for_handle(handle)
            .filter(|slot| slot.online.load(Ordering::SeqCst))
            .ok_or_else(|| Error::SendFailed {
                peer_id: format!("handle-{}", handle.0),
                reason: "no such peer".into(),
            })?;
        if let Some(observer) = target.discovery.read().await.clone() {
            observer.on_datagram(self.slot.handle, message.clone()).await;
        }
        Ok(())
    }

    async fn open_stream(&self, handle: PeerHandle) -> Result<PeerLink> {
        let target = self
            .mesh
            .slot_for_handle(handle)
            .filter(|slot| slot.online.load(Ordering::SeqCst))
            .ok_or_else(|| Error::Unreachable {
                peer_id: format!("handle-{}", handle.0),
            })?;
        let remote_observer = target
            .connections
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Unreachable {
                peer_id: target.node_id.clone(),
            })?;
        let local_observer = self
            .slot
            .connections
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Unreachable {
                peer_id: self.slot.node_id.clone(),
            })?;

        let shutdown = CancellationToken::new();
        let (to_remote_tx, to_remote_rx) = mpsc::channel::<MeshMessage>(64);
        let (to_local_tx, to_local_rx) = mpsc::channel::<MeshMessage>(64);

        let local_link = PeerLink::new(target.node_id.clone(), to_remote_tx, shutdown.clone());
        let remote_link = PeerLink::new(self.slot.node_id.clone(), to_local_tx, shutdown.clone());

        spawn_pump(
            to_remote_rx,
            remote_observer.clone(),
            self.slot.node_id.clone(),
            shutdown.clone(),
        );
        spawn_pump(
            to_local_rx,
            local_observer,
            target.node_id.clone(),
            shutdown.clone(),
        );

        debug!(
            from = %self.slot.node_id,
            to = %target.node_id,
            "memory stream opened"
        );
        remote_observer
            .on_link_opened(&self.slot.node_id, remote_link)
            .await;
        Ok(local_link)
    }
}

/// Forward stream messages to the observer until the link dies, then report
/// the loss exactly once.
fn spawn_pump(
    mut rx: mpsc::Receiver<MeshMessage>,
    observer: Arc<dyn ConnectionObserver>,
    remote_id: String,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(message) => observer.on_link_message(&remote_id, message).await,
                    None => break,
                },
            }
        }
        shutdown.cancel();
        observer.on_link_lost(&remote_id).await;
    });
}
