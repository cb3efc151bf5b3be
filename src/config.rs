//! Node configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    #[serde(default)]
    pub ranging: RangingConfig,
}

impl Config {
    /// Load from a TOML file; missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier; generated when empty.
    #[serde(default)]
    pub id: String,

    /// Display name; defaults to the hostname.
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// UDP port for the advertisement/datagram channel.
    #[serde(default = "default_mesh_port")]
    pub port: u16,

    /// Advertisement re-broadcast interval in milliseconds.
    #[serde(default = "default_advertise_interval")]
    pub advertise_interval_ms: u64,

    /// Advertisement intervals missed before a peer is considered gone.
    #[serde(default = "default_liveness_misses")]
    pub liveness_misses: u32,

    /// Poll interval for blocking status waits, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Keepalive ping interval towards the master, in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// How long a connection request may stay unanswered, in milliseconds.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// How long a role change may stay unacknowledged, in milliseconds.
    #[serde(default = "default_role_change_timeout")]
    pub role_change_timeout_ms: u64,

    /// Maximum concurrently connected clients while serving as master.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Maximum concurrent connections while serving as a sub-cluster server.
    #[serde(default = "default_max_master_links")]
    pub max_master_links: usize,

    /// Grace period a sub-cluster server waits for its master to reconnect,
    /// in milliseconds.
    #[serde(default = "default_reconnect_grace")]
    pub reconnect_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangingConfig {
    /// Repeat rounds issued per target.
    #[serde(default = "default_rounds")]
    pub rounds_per_target: u32,

    /// Extra passes granted per failed request subset.
    #[serde(default = "default_retry_passes")]
    pub retry_passes: u32,

    /// Multiplicative bias correction applied to the averaged distance.
    #[serde(default = "default_bias_factor")]
    pub bias_factor: f64,

    /// Delay between the master's RTT cycles, in milliseconds.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_ms: u64,
}

// Defaults
fn default_mesh_port() -> u16 { 9130 }
fn default_advertise_interval() -> u64 { 1_000 }
fn default_liveness_misses() -> u32 { 3 }
fn default_poll_interval() -> u64 { 500 }
fn default_ping_interval() -> u64 { 50_000 }
fn default_response_timeout() -> u64 { 4_000 }
fn default_role_change_timeout() -> u64 { 2_000 }
fn default_max_clients() -> usize { 3 }
fn default_max_master_links() -> usize { 1 }
fn default_reconnect_grace() -> u64 { 4_000 }
fn default_rounds() -> u32 { 5 }
fn default_retry_passes() -> u32 { 1 }
fn default_bias_factor() -> f64 { 1.2 }
fn default_cycle_interval() -> u64 { 10_000 }

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            port: default_mesh_port(),
            advertise_interval_ms: default_advertise_interval(),
            liveness_misses: default_liveness_misses(),
            poll_interval_ms: default_poll_interval(),
            ping_interval_ms: default_ping_interval(),
        }
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            role_change_timeout_ms: default_role_change_timeout(),
            max_clients: default_max_clients(),
            max_master_links: default_max_master_links(),
            reconnect_grace_ms: default_reconnect_grace(),
        }
    }
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            rounds_per_target: default_rounds(),
            retry_passes: default_retry_passes(),
            bias_factor: default_bias_factor(),
            cycle_interval_ms: default_cycle_interval(),
        }
    }
}
