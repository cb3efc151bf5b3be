//! Distance measurement: the ranging seam and the engine that drives it.

mod engine;
mod simulated;

pub use engine::{DistanceEngine, RoundAccounting};
pub use simulated::SimulatedRanging;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

/// Result of ranging against one address within a request.
#[derive(Debug, Clone)]
pub enum RangingOutcome {
    Distance { mac: String, millimeters: i64 },
    Failed { mac: String },
}

/// The ranging primitive. Callers must keep each request at or below
/// [`RangingProvider::max_peers_per_request`] addresses.
#[async_trait]
pub trait RangingProvider: Send + Sync {
    fn max_peers_per_request(&self) -> usize;

    /// One ranging pass over a batch of addresses. `Err` means the whole
    /// request failed; otherwise each address reports success or failure
    /// individually.
    async fn range_to(&self, macs: &[String]) -> Result<Vec<RangingOutcome>>;
}

/// One peer's distance to a named neighbour, post reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceEntry {
    pub name: String,
    #[serde(rename = "distanceMm")]
    pub distance_mm: i64,
}

/// A node's full set of measured distances, gossiped across the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceReport {
    #[serde(rename = "phoneId")]
    pub node_id: String,
    #[serde(rename = "phoneName")]
    pub node_name: String,
    pub distances: Vec<DistanceEntry>,
}

impl DistanceReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Wire form of the RTT_INIT payload: everything a node knows so far,
/// keyed by node id.
pub fn results_map_to_json(map: &HashMap<String, DistanceReport>) -> String {
    serde_json::to_string(map).unwrap_or_default()
}

pub fn results_map_from_json(raw: &str) -> Result<HashMap<String, DistanceReport>> {
    Ok(serde_json::from_str(raw)?)
}
