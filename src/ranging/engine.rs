//! Orchestrates ranging rounds: batching, retry passes, reduction and
//! idempotent completion accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::RangingConfig;
use crate::error::Result;
use crate::ranging::{DistanceEntry, DistanceReport, RangingOutcome, RangingProvider};

/// Success/failure bookkeeping for one measurement round.
///
/// Finalization fires exactly once, when `success + failure` reaches the
/// expected request count; late arrivals after that are no-ops.
pub struct RoundAccounting {
    expected: AtomicUsize,
    success: AtomicUsize,
    failure: AtomicUsize,
    finalized: AtomicBool,
}

impl RoundAccounting {
    pub fn new(expected: usize) -> Self {
        Self {
            expected: AtomicUsize::new(expected),
            success: AtomicUsize::new(0),
            failure: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    /// A retried subset adds one more expected request.
    pub fn extend_expected(&self, by: usize) {
        self.expected.fetch_add(by, Ordering::SeqCst);
    }

    /// Returns `true` iff this call completed the round.
    pub fn record_success(&self) -> bool {
        self.success.fetch_add(1, Ordering::SeqCst);
        self.try_finalize()
    }

    /// Returns `true` iff this call completed the round.
    pub fn record_failure(&self) -> bool {
        self.failure.fetch_add(1, Ordering::SeqCst);
        self.try_finalize()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    fn try_finalize(&self) -> bool {
        let done = self.success.load(Ordering::SeqCst) + self.failure.load(Ordering::SeqCst);
        if done >= self.expected.load(Ordering::SeqCst) {
            !self.finalized.swap(true, Ordering::SeqCst)
        } else {
            false
        }
    }
}

/// Drives the ranging primitive over all requested targets and reduces raw
/// samples to one corrected distance per peer.
pub struct DistanceEngine {
    provider: Arc<dyn RangingProvider>,
    config: RangingConfig,
    /// Everything this node knows, own measurements and gossip both.
    results: DashMap<String, DistanceReport>,
}

impl DistanceEngine {
    pub fn new(provider: Arc<dyn RangingProvider>, config: RangingConfig) -> Self {
        Self {
            provider,
            config,
            results: DashMap::new(),
        }
    }

    /// Run one full measurement round against `targets` (MAC, display name)
    /// and store + return the resulting report for this node.
    ///
    /// Each batch is issued `rounds_per_target` times; a failed subset gets
    /// `retry_passes` extra passes before its failures count as final.
    pub async fn measure_all(
        &self,
        node_id: &str,
        node_name: &str,
        targets: &[(String, String)],
    ) -> Result<DistanceReport> {
        let started = std::time::Instant::now();
        let names_by_mac: HashMap<String, String> = targets
            .iter()
            .filter(|(mac, _)| !mac.is_empty())
            .cloned()
            .collect();

        let batch_size = self.provider.max_peers_per_request().max(1);
        let macs: Vec<String> = names_by_mac.keys().cloned().collect();
        let mut queue: Vec<Vec<String>> = Vec::new();
        for chunk in macs.chunks(batch_size) {
            for _ in 0..self.config.rounds_per_target {
                queue.push(chunk.to_vec());
            }
        }

        let accounting = RoundAccounting::new(queue.len());
        let mut retries_left: HashMap<Vec<String>, u32> = HashMap::new();
        let mut samples: HashMap<String, Vec<i64>> = HashMap::new();

        let mut index = 0;
        while index < queue.len() {
            let batch = queue[index].clone();
            index += 1;

            match self.provider.range_to(&batch).await {
                Ok(outcomes) => {
                    let mut failed_subset = Vec::new();
                    for outcome in outcomes {
                        match outcome {
                            RangingOutcome::Distance { mac, millimeters } => {
                                if let Some(name) = names_by_mac.get(&mac) {
                                    samples.entry(name.clone()).or_default().push(millimeters);
                                }
                            }
                            RangingOutcome::Failed { mac } => failed_subset.push(mac),
                        }
                    }
                    if failed_subset.is_empty() {
                        accounting.record_success();
                    } else {
                        let budget =
                            retries_left.entry(failed_subset.clone()).or_insert(self.config.retry_passes);
                        if *budget > 0 {
                            *budget -= 1;
                            accounting.extend_expected(1);
                            queue.push(failed_subset);
                            debug!(subset = queue.last().unwrap().len(), "retrying failed subset");
                        }
                        accounting.record_failure();
                    }
                }
                Err(error) => {
                    warn!(%error, "ranging request failed");
                    let budget = retries_left.entry(batch.clone()).or_insert(self.config.retry_passes);
                    if *budget > 0 {
                        *budget -= 1;
                        accounting.extend_expected(1);
                        queue.push(batch);
                    }
                    accounting.record_failure();
                }
            }
        }

        let report = DistanceReport {
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            distances: reduce_samples(&samples, self.config.bias_factor),
        };
        self.results.insert(node_id.to_string(), report.clone());
        info!(
            targets = names_by_mac.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "measurement round finished"
        );
        Ok(report)
    }

    /// Merge a report gossiped by another node. Own entry is never
    /// overwritten by gossip.
    pub fn merge_report(&self, own_id: &str, report: DistanceReport) {
        if report.node_id != own_id {
            self.results.insert(report.node_id.clone(), report);
        }
    }

    /// Merge a full RTT_INIT results map. Returns the sender's report when
    /// the map contained one, so the caller can re-broadcast it.
    pub fn merge_results_map(
        &self,
        own_id: &str,
        map: HashMap<String, DistanceReport>,
        sender_id: &str,
    ) -> Option<DistanceReport> {
        for (node_id, report) in map {
            if node_id != own_id {
                self.results.insert(node_id, report);
            }
        }
        self.results.get(sender_id).map(|entry| entry.clone())
    }

    pub fn results(&self) -> HashMap<String, DistanceReport> {
        self.results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn report_for(&self, node_id: &str) -> Option<DistanceReport> {
        self.results.get(node_id).map(|entry| entry.clone())
    }
}

/// Half each raw reading, average, apply the bias correction, floor.
fn reduce_samples(samples: &HashMap<String, Vec<i64>>, bias: f64) -> Vec<DistanceEntry> {
    let mut entries: Vec<DistanceEntry> = samples
        .iter()
        .filter(|(_, raw)| !raw.is_empty())
        .map(|(name, raw)| {
            let mean: f64 =
                raw.iter().map(|mm| (mm / 2) as f64).sum::<f64>() / raw.len() as f64;
            DistanceEntry {
                name: name.clone(),
                distance_mm: (mean * bias).floor() as i64,
            }
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduction_halves_averages_and_corrects() {
        let mut samples = HashMap::new();
        samples.insert("beta".to_string(), vec![2000, 2000, 2200]);
        let entries = reduce_samples(&samples, 1.2);
        assert_eq!(entries.len(), 1);
        // floor(mean(1000, 1000, 1100) * 1.2) = floor(1033.33.. * 1.2)
        assert_eq!(entries[0].distance_mm, 1240);
    }

    #[test]
    fn reduction_skips_targets_without_samples() {
        let mut samples: HashMap<String, Vec<i64>> = HashMap::new();
        samples.insert("beta".to_string(), vec![]);
        assert!(reduce_samples(&samples, 1.2).is_empty());
    }

    #[test]
    fn accounting_finalizes_exactly_once() {
        let accounting = RoundAccounting::new(3);
        assert!(!accounting.record_success());
        assert!(!accounting.record_failure());
        assert!(accounting.record_success());
        assert!(accounting.is_finalized());
        // A late arrival after finalization must not re-finalize.
        assert!(!accounting.record_success());
    }

    #[test]
    fn accounting_tracks_retry_extension() {
        let accounting = RoundAccounting::new(1);
        accounting.extend_expected(1);
        assert!(!accounting.record_failure());
        assert!(accounting.record_success());
    }
}
