//! Transport seam behavior, exercised through the in-memory mesh.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proxima_node::proto::{MeshMessage, MessageHeader, MessageType};
use proxima_node::transport::memory::MemoryMesh;
use proxima_node::transport::{
    ConnectionObserver, MeshTransport, PeerDiscoveryObserver, PeerHandle, PeerLink,
};
use proxima_node::SelfInfo;

#[derive(Default)]
struct Recorder {
    announced: Mutex<Vec<(PeerHandle, String)>>,
    datagrams: Mutex<Vec<MeshMessage>>,
    opened: Mutex<Vec<(String, PeerLink)>>,
    messages: Mutex<Vec<(String, MeshMessage)>>,
    lost: Mutex<Vec<String>>,
}

#[async_trait]
impl PeerDiscoveryObserver for Recorder {
    async fn on_peer_announced(&self, handle: PeerHandle, header: MessageHeader) {
        self.announced
            .lock()
            .unwrap()
            .push((handle, header.sender_id));
    }

    async fn on_peer_lost(&self, peer_id: &str) {
        self.lost.lock().unwrap().push(peer_id.to_string());
    }

    async fn on_datagram(&self, _handle: PeerHandle, message: MeshMessage) {
        self.datagrams.lock().unwrap().push(message);
    }
}

#[async_trait]
impl ConnectionObserver for Recorder {
    async fn on_link_opened(&self, peer_id: &str, link: PeerLink) {
        self.opened
            .lock()
            .unwrap()
            .push((peer_id.to_string(), link));
    }

    async fn on_link_message(&self, peer_id: &str, message: MeshMessage) {
        self.messages
            .lock()
            .unwrap()
            .push((peer_id.to_string(), message));
    }

    async fn on_link_lost(&self, peer_id: &str) {
        self.lost.lock().unwrap().push(peer_id.to_string());
    }
}

fn info(id: &str) -> SelfInfo {
    SelfInfo::new(id.to_string(), format!("name-{id}"), format!("02:{id}"), 7)
}

#[tokio::test]
async fn advertisements_reach_every_other_node() {
    let mesh = MemoryMesh::new();
    let alpha = mesh.join("alpha");
    let beta = mesh.join("beta");
    let alpha_obs = Arc::new(Recorder::default());
    let beta_obs = Arc::new(Recorder::default());
    alpha.attach(alpha_obs.clone(), alpha_obs.clone()).await;
    beta.attach(beta_obs.clone(), beta_obs.clone()).await;

    alpha
        .advertise(MessageHeader::from(&info("alpha")))
        .await
        .unwrap();

    let seen = beta_obs.announced.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, "alpha");

    // A later advertisement from beta replays alpha's header back, so a
    // late joiner converges without waiting for a re-announcement.
    beta.advertise(MessageHeader::from(&info("beta")))
        .await
        .unwrap();
    let replayed = beta_obs.announced.lock().unwrap().clone();
    assert!(replayed.iter().any(|(_, id)| id == "alpha"));
}

#[tokio::test]
async fn datagrams_are_delivered_with_sender_handle() {
    let mesh = MemoryMesh::new();
    let alpha = mesh.join("alpha");
    let beta = mesh.join("beta");
    let beta_obs = Arc::new(Recorder::default());
    beta.attach(beta_obs.clone(), beta_obs.clone()).await;

    let message = MeshMessage::new(MessageType::Ping, "", &info("alpha"));
    alpha
        .send_datagram(beta.local_handle(), &message)
        .await
        .unwrap();

    let received = beta_obs.datagrams.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sender_id(), "alpha");
}

#[tokio::test]
async fn streams_deliver_fifo_and_report_loss_on_close() {
    let mesh = MemoryMesh::new();
    let alpha = mesh.join("alpha");
    let beta = mesh.join("beta");
    let alpha_obs = Arc::new(Recorder::default());
    let beta_obs = Arc::new(Recorder::default());
    alpha.attach(alpha_obs.clone(), alpha_obs.clone()).await;
    beta.attach(beta_obs.clone(), beta_obs.clone()).await;

    let link = alpha.open_stream(beta.local_handle()).await.unwrap();
    assert_eq!(link.peer_id(), "beta");

    for content in ["one", "two", "three"] {
        link.send(MeshMessage::new(MessageType::Ping, content, &info("alpha")))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = beta_obs.messages.lock().unwrap().clone();
    let contents: Vec<&str> = received
        .iter()
        .map(|(_, message)| message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);

    link.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(beta_obs.lost.lock().unwrap().contains(&"alpha".to_string()));
    assert!(link.send(MeshMessage::new(MessageType::Ping, "", &info("alpha")))
        .await
        .is_err());
}

#[tokio::test]
async fn partitioned_node_is_reported_lost_and_unreachable() {
    let mesh = MemoryMesh::new();
    let alpha = mesh.join("alpha");
    let beta = mesh.join("beta");
    let alpha_obs = Arc::new(Recorder::default());
    alpha.attach(alpha_obs.clone(), alpha_obs.clone()).await;
    beta.attach(
        Arc::new(Recorder::default()),
        Arc::new(Recorder::default()),
    )
    .await;

    mesh.partition("beta").await;
    assert!(alpha_obs.lost.lock().unwrap().contains(&"beta".to_string()));

    let message = MeshMessage::new(MessageType::Ping, "", &info("alpha"));
    assert!(alpha
        .send_datagram(beta.local_handle(), &message)
        .await
        .is_err());
    assert!(alpha.open_stream(beta.local_handle()).await.is_err());
}
