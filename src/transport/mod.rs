//! Transport seam: discovery/advertisement channel, out-of-band datagrams,
//! and point-to-point message streams.
//!
//! The coordination core only ever talks to these traits. Two
//! implementations ship with the crate: [`memory::MemoryMesh`] for tests and
//! simulation, and [`udp::UdpMesh`] for real LAN deployments.

pub mod memory;
pub mod udp;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::proto::{MeshMessage, MessageHeader};

/// Opaque peer address owned by the transport. Only the transport can map
/// it back to something routable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub u64);

/// Receives discovery-channel traffic. Implemented by the Coordinator.
///
/// The discovery channel may re-fire the same announcement continuously, so
/// every handler must be idempotent.
#[async_trait]
pub trait PeerDiscoveryObserver: Send + Sync {
    async fn on_peer_announced(&self, handle: PeerHandle, header: MessageHeader);
    async fn on_peer_lost(&self, peer_id: &str);
    /// Out-of-band message (connection negotiation runs over datagrams,
    /// before any stream exists).
    async fn on_datagram(&self, handle: PeerHandle, message: MeshMessage);
}

/// Receives stream-level events. Implemented by the Coordinator.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// A remote peer opened a stream to us (we are the accepting side).
    async fn on_link_opened(&self, peer_id: &str, link: PeerLink);
    /// A message arrived on an established stream. FIFO per stream.
    async fn on_link_message(&self, peer_id: &str, message: MeshMessage);
    /// The stream went away (close or failure).
    async fn on_link_lost(&self, peer_id: &str);
}

/// The substrate the core consumes.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Publish (or re-publish) our attribute blob on the discovery channel.
    async fn advertise(&self, header: MessageHeader) -> Result<()>;

    /// Send a single out-of-band message. At-least-once, up to 3 attempts;
    /// an error means all attempts failed.
    async fn send_datagram(&self, handle: PeerHandle, message: &MeshMessage) -> Result<()>;

    /// Open a byte-stream connection to the peer. The remote side learns of
    /// it through [`ConnectionObserver::on_link_opened`].
    async fn open_stream(&self, handle: PeerHandle) -> Result<PeerLink>;
}

/// Sending half of an established point-to-point stream.
///
/// Messages are delivered FIFO within one link. Dropping every clone, or
/// calling [`PeerLink::close`], tears the stream down on both sides.
#[derive(Debug, Clone)]
pub struct PeerLink {
    peer_id: String,
    tx: mpsc::Sender<MeshMessage>,
    shutdown: CancellationToken,
}

impl PeerLink {
    pub fn new(
        peer_id: impl Into<String>,
        tx: mpsc::Sender<MeshMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            tx,
            shutdown,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn send(&self, message: MeshMessage) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::SendFailed {
                peer_id: self.peer_id.clone(),
                reason: "link closed".into(),
            });
        }
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::SendFailed {
                peer_id: self.peer_id.clone(),
                reason: "link closed".into(),
            })
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}
