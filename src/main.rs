use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use proxima_node::ranging::SimulatedRanging;
use proxima_node::transport::udp::UdpMesh;
use proxima_node::{Config, Coordinator, SelfInfo};

#[derive(Parser, Debug)]
#[command(name = "proxima-node", about = "Proximity mesh coordination node")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, env = "PROXIMA_CONFIG")]
    config: Option<PathBuf>,

    /// UDP port for the advertisement channel.
    #[arg(long, env = "PROXIMA_PORT")]
    port: Option<u16>,

    /// Node display name; defaults to the hostname.
    #[arg(long, env = "PROXIMA_NAME")]
    name: Option<String>,

    /// Stable node id; generated when absent.
    #[arg(long, env = "PROXIMA_ID")]
    id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.mesh.port = port;
    }
    if let Some(name) = args.name {
        config.node.name = name;
    }
    if let Some(id) = args.id {
        config.node.id = id;
    }

    let id = if config.node.id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        config.node.id.clone()
    };
    let name = if config.node.name.is_empty() {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "proxima-node".to_string())
    } else {
        config.node.name.clone()
    };
    let rank = rand::thread_rng().gen_range(0..10_000);
    let mac = synth_mac();
    info!(%id, %name, rank, %mac, port = config.mesh.port, "starting node");

    let info = SelfInfo::new(id.clone(), name, mac, rank);
    // No RTT hardware seam on this platform yet; the simulated provider
    // keeps the full protocol exercisable on any LAN.
    let provider = Arc::new(SimulatedRanging::new(10, 50));
    let coordinator = Coordinator::new(config.clone(), info, provider);

    let mesh = UdpMesh::bind(id, config.mesh.port)
        .await
        .context("binding mesh transport")?;
    mesh.attach(coordinator.clone(), coordinator.clone()).await;
    coordinator.bind_transport(mesh.clone());
    coordinator.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    coordinator.close().await;
    mesh.close();
    Ok(())
}

/// Locally administered unicast MAC, random per process.
fn synth_mac() -> String {
    let mut rng = rand::thread_rng();
    let tail: [u8; 5] = rng.gen();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2], tail[3], tail[4]
    )
}
