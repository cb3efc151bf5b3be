//! Simulated ranging provider for the node binary and tests.
//!
//! Returns a configured base distance per MAC with uniform jitter, and can
//! be told to fail a given address to exercise the retry path.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::Rng;

use crate::error::Result;
use crate::ranging::{RangingOutcome, RangingProvider};

pub struct SimulatedRanging {
    max_peers: usize,
    jitter_mm: i64,
    distances: Mutex<HashMap<String, i64>>,
    failing: Mutex<HashMap<String, u32>>,
}

impl SimulatedRanging {
    pub fn new(max_peers: usize, jitter_mm: i64) -> Self {
        Self {
            max_peers,
            jitter_mm,
            distances: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashMap::new()),
        }
    }

    /// Raw (pre-reduction) distance reported for a MAC.
    pub fn set_distance(&self, mac: impl Into<String>, millimeters: i64) {
        self.distances
            .lock()
            .unwrap()
            .insert(mac.into(), millimeters);
    }

    /// Make the next `count` readings for a MAC fail.
    pub fn fail_next(&self, mac: impl Into<String>, count: u32) {
        self.failing.lock().unwrap().insert(mac.into(), count);
    }
}

#[async_trait]
impl RangingProvider for SimulatedRanging {
    fn max_peers_per_request(&self) -> usize {
        self.max_peers
    }

    async fn range_to(&self, macs: &[String]) -> Result<Vec<RangingOutcome>> {
        let mut outcomes = Vec::with_capacity(macs.len());
        for mac in macs {
            {
                let mut failing = self.failing.lock().unwrap();
                if let Some(remaining) = failing.get_mut(mac) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        outcomes.push(RangingOutcome::Failed { mac: mac.clone() });
                        continue;
                    }
                }
            }
            let base = self.distances.lock().unwrap().get(mac).copied();
            match base {
                Some(base) => {
                    let jitter = if self.jitter_mm > 0 {
                        rand::thread_rng().gen_range(-self.jitter_mm..=self.jitter_mm)
                    } else {
                        0
                    };
                    outcomes.push(RangingOutcome::Distance {
                        mac: mac.clone(),
                        millimeters: (base + jitter).max(0),
                    });
                }
                None => outcomes.push(RangingOutcome::Failed { mac: mac.clone() }),
            }
        }
        Ok(outcomes)
    }
}
