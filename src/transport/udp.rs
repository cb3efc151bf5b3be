//! LAN transport: UDP broadcast for the advertisement/datagram channel,
//! TCP for point-to-point streams.
//!
//! Datagrams are acked and retried up to 3 attempts. Streams carry
//! newline-delimited JSON envelopes; the opening side sends a one-line
//! intro frame first so the acceptor knows who connected.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::proto::{MeshMessage, MessageHeader};
use crate::transport::{
    ConnectionObserver, MeshTransport, PeerDiscoveryObserver, PeerHandle, PeerLink,
};

const SEND_ATTEMPTS: u32 = 3;
const ACK_TIMEOUT: Duration = Duration::from_millis(400);

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Packet {
    Advert {
        header: MessageHeader,
        stream_port: u16,
    },
    Datagram {
        id: u64,
        message: MeshMessage,
    },
    Ack {
        id: u64,
    },
}

#[derive(Serialize, Deserialize)]
struct IntroFrame {
    peer_id: String,
}

pub struct UdpMesh {
    local_id: String,
    udp: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    stream_port: u16,
    handles: DashMap<u64, SocketAddr>,
    addr_index: DashMap<SocketAddr, u64>,
    stream_ports: DashMap<u64, u16>,
    peer_ids: DashMap<u64, String>,
    pending_acks: DashMap<u64, oneshot::Sender<()>>,
    next_handle: AtomicU64,
    next_msg_id: AtomicU64,
    discovery: RwLock<Option<Arc<dyn PeerDiscoveryObserver>>>,
    connections: RwLock<Option<Arc<dyn ConnectionObserver>>>,
    shutdown: CancellationToken,
}

impl UdpMesh {
    /// Bind the UDP advertisement socket and the TCP stream listener.
    pub async fn bind(local_id: impl Into<String>, port: u16) -> Result<Arc<Self>> {
        let udp = UdpSocket::bind(("0.0.0.0", port)).await?;
        udp.set_broadcast(true)?;
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let stream_port = listener.local_addr()?.port();

        let mesh = Arc::new(Self {
            local_id: local_id.into(),
            udp: Arc::new(udp),
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], port)),
            stream_port,
            handles: DashMap::new(),
            addr_index: DashMap::new(),
            stream_ports: DashMap::new(),
            peer_ids: DashMap::new(),
            pending_acks: DashMap::new(),
            next_handle: AtomicU64::new(1),
            next_msg_id: AtomicU64::new(1),
            discovery: RwLock::new(None),
            connections: RwLock::new(None),
            shutdown: CancellationToken::new(),
        });

        mesh.clone().spawn_udp_loop();
        mesh.clone().spawn_accept_loop(listener);
        Ok(mesh)
    }

    pub async fn attach(
        &self,
        discovery: Arc<dyn PeerDiscoveryObserver>,
        connections: Arc<dyn ConnectionObserver>,
    ) {
        *self.discovery.write().await = Some(discovery);
        *self.connections.write().await = Some(connections);
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn handle_for_addr(&self, addr: SocketAddr) -> PeerHandle {
        if let Some(existing) = self.addr_index.get(&addr) {
            return PeerHandle(*existing);
        }
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.addr_index.insert(addr, id);
        self.handles.insert(id, addr);
        PeerHandle(id)
    }

    fn spawn_udp_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let received = tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    received = self.udp.recv_from(&mut buf) => received,
                };
                let (len, from) = match received {
                    Ok(pair) => pair,
                    Err(error) => {
                        warn!(%error, "udp receive failed");
                        continue;
                    }
                };
                let packet: Packet = match serde_json::from_slice(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(error) => {
                        warn!(%error, %from, "dropping malformed packet");
                        continue;
                    }
                };
                self.dispatch_packet(packet, from).await;
            }
        });
    }

    async fn dispatch_packet(&self, packet: Packet, from: SocketAddr) {
        match packet {
            Packet::Advert {
                header,
                stream_port,
            } => {
                // Our own broadcasts loop back.
                if header.sender_id == self.local_id {
                    return;
                }
                let handle = self.handle_for_addr(from);
                self.stream_ports.insert(handle.0, stream_port);
                self.peer_ids.insert(handle.0, header.sender_id.clone());
                if let Some(observer) = self.discovery.read().await.clone() {
                    observer.on_peer_announced(handle, header).await;
                }
            }
            Packet::Datagram { id, message } => {
                let ack = serde_json::to_vec(&Packet::Ack { id }).unwrap_or_default();
                if let Err(error) = self.udp.send_to(&ack, from).await {
                    warn!(%error, %from, "ack send failed");
                }
                let handle = self.handle_for_addr(from);
                self.peer_ids
                    .insert(handle.0, message.header.sender_id.clone());
                if let Some(observer) = self.discovery.read().await.clone() {
                    observer.on_datagram(handle, message).await;
                }
            }
            Packet::Ack { id } => {
                if let Some((_, waiter)) = self.pending_acks.remove(&id) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, from) = match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        warn!(%error, "tcp accept failed");
                        continue;
                    }
                };
                let mesh = self.clone();
                tokio::spawn(async move {
                    if let Err(error) = mesh.accept_stream(stream).await {
                        warn!(%error, %from, "incoming stream setup failed");
                    }
                });
            }
        });
    }

    async fn accept_stream(&self, stream: TcpStream) -> Result<()> {
        let observer = self
            .connections
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Unreachable {
                peer_id: self.local_id.clone(),
            })?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut intro_line = String::new();
        reader.read_line(&mut intro_line).await?;
        let intro: IntroFrame = serde_json::from_str(intro_line.trim_end())
            .map_err(|e| Error::Protocol(format!("bad intro frame: {e}")))?;

        let link = spawn_stream_tasks(intro.peer_id.clone(), reader, writer, observer.clone());
        observer.on_link_opened(&intro.peer_id, link).await;
        Ok(())
    }
}

#[async_trait]
impl MeshTransport for UdpMesh {
    async fn advertise(&self, header: MessageHeader) -> Result<()> {
        let packet = Packet::Advert {
            header,
            stream_port: self.stream_port,
        };
        let bytes = serde_json::to_vec(&packet)?;
        self.udp.send_to(&bytes, self.broadcast_addr).await?;
        Ok(())
    }

    async fn send_datagram(&self, handle: PeerHandle, message: &MeshMessage) -> Result<()> {
        let addr = self
            .handles
            .get(&handle.0)
            .map(|entry| *entry)
            .ok_or_else(|| Error::SendFailed {
                peer_id: format!("handle-{}", handle.0),
                reason: "unknown handle".into(),
            })?;

        let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let bytes = serde_json::to_vec(&Packet::Datagram {
            id,
            message: message.clone(),
        })?;

        for attempt in 1..=SEND_ATTEMPTS {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.pending_acks.insert(id, ack_tx);
            self.udp.send_to(&bytes, addr).await?;
            match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
                Ok(Ok(())) => return Ok(()),
                _ => {
                    self.pending_acks.remove(&id);
                    debug!(%addr, attempt, "datagram unacked, retrying");
                }
            }
        }
        Err(Error::SendFailed {
            peer_id: format!("handle-{}", handle.0),
            reason: format!("no ack after {SEND_ATTEMPTS} attempts"),
        })
    }

    async fn open_stream(&self, handle: PeerHandle) -> Result<PeerLink> {
        let addr = self
            .handles
            .get(&handle.0)
            .map(|entry| *entry)
            .ok_or_else(|| Error::Unreachable {
                peer_id: format!("handle-{}", handle.0),
            })?;
        let port = self
            .stream_ports
            .get(&handle.0)
            .map(|entry| *entry)
            .ok_or_else(|| Error::Unreachable {
                peer_id: format!("handle-{}", handle.0),
            })?;
        let observer = self
            .connections
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Unreachable {
                peer_id: self.local_id.clone(),
            })?;

        let stream = TcpStream::connect((addr.ip(), port))
            .await
            .map_err(|_| Error::Unreachable {
                peer_id: format!("handle-{}", handle.0),
            })?;
        let (reader, mut writer) = stream.into_split();

        let intro = serde_json::to_string(&IntroFrame {
            peer_id: self.local_id.clone(),
        })?;
        writer.write_all(intro.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        // The remote id was learned from its advertisements; link-loss
        // notifications carry it so the coordinator finds its bookkeeping.
        let remote_id = self
            .peer_ids
            .get(&handle.0)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| format!("handle-{}", handle.0));
        Ok(spawn_stream_tasks(
            remote_id,
            BufReader::new(reader),
            writer,
            observer,
        ))
    }
}

/// Wire a TCP stream into a [`PeerLink`]: one task drains the outbound
/// channel into the socket, one parses inbound lines into envelopes.
fn spawn_stream_tasks(
    peer_id: String,
    mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    observer: Arc<dyn ConnectionObserver>,
) -> PeerLink {
    let shutdown = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<MeshMessage>(64);
    let link = PeerLink::new(peer_id.clone(), tx, shutdown.clone());

    let write_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = write_shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let line = message.to_json();
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
        write_shutdown.cancel();
    });

    let read_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                _ = read_shutdown.cancelled() => break,
                read = reader.read_line(&mut line) => read,
            };
            match read {
                Ok(0) | Err(_) => break,
                Ok(_) => match MeshMessage::from_json(line.trim_end()) {
                    Ok(message) => {
                        // Streams carry real headers; prefer the id inside.
                        let sender = message.sender_id().to_string();
                        observer.on_link_message(&sender, message).await;
                    }
                    Err(error) => warn!(%error, "dropping malformed stream frame"),
                },
            }
        }
        read_shutdown.cancel();
        observer.on_link_lost(&peer_id).await;
    });

    link
}
