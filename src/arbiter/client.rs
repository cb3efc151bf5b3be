//! Client side: outstanding request tracking and the candidate-server queue.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::arbiter::ArbiterEvent;

/// One outstanding connection request.
pub struct PendingConnection {
    pub target_id: String,
    pub requested_at: Instant,
    cancel: CancellationToken,
}

pub struct ClientArbiter {
    pending: DashMap<String, PendingConnection>,
    /// FIFO of discovered candidate servers (masters) to try next.
    candidates: Mutex<VecDeque<String>>,
    response_timeout: Duration,
    events: mpsc::UnboundedSender<ArbiterEvent>,
}

impl ClientArbiter {
    pub fn new(
        response_timeout: Duration,
        events: mpsc::UnboundedSender<ArbiterEvent>,
    ) -> Self {
        Self {
            pending: DashMap::new(),
            candidates: Mutex::new(VecDeque::new()),
            response_timeout,
            events,
        }
    }

    /// Register an outstanding request and arm its timeout. Returns `false`
    /// when a request to the same target is already in flight (the new one
    /// must not be sent).
    pub fn register(&self, target_id: &str) -> bool {
        let cancel = CancellationToken::new();
        match self.pending.entry(target_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PendingConnection {
                    target_id: target_id.to_string(),
                    requested_at: Instant::now(),
                    cancel: cancel.clone(),
                });
            }
        }

        let timeout = self.response_timeout;
        let events = self.events.clone();
        let target = target_id.to_string();
        let token = cancel;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = events.send(ArbiterEvent::RequestTimedOut { target_id: target });
                }
            }
        });
        true
    }

    /// Resolve a request on a definitive response. Returns `true` when the
    /// request was still pending; a late accept/reject after timeout or
    /// cancellation returns `false` and must be treated as a no-op.
    pub fn resolve(&self, target_id: &str) -> bool {
        match self.pending.remove(target_id) {
            Some((_, pending)) => {
                pending.cancel.cancel();
                debug!(
                    target_id,
                    waited_ms = pending.requested_at.elapsed().as_millis() as u64,
                    "pending request resolved"
                );
                true
            }
            None => false,
        }
    }

    /// The timeout path: take the request out without cancelling (the timer
    /// already fired). Returns `true` when it was still pending.
    pub fn take_timed_out(&self, target_id: &str) -> bool {
        self.pending.remove(target_id).is_some()
    }

    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.resolve(&id);
        }
    }

    // Candidate queue -----------------------------------------------------

    pub fn push_candidate(&self, peer_id: &str) {
        let mut queue = self.candidates.lock().unwrap();
        if !queue.contains(&peer_id.to_string()) {
            queue.push_back(peer_id.to_string());
        }
    }

    pub fn push_candidates(&self, peer_ids: impl IntoIterator<Item = String>) {
        let mut queue = self.candidates.lock().unwrap();
        for id in peer_ids {
            if !queue.contains(&id) {
                queue.push_back(id);
            }
        }
    }

    pub fn pop_candidate(&self) -> Option<String> {
        self.candidates.lock().unwrap().pop_front()
    }

    pub fn remove_candidate(&self, peer_id: &str) {
        self.candidates.lock().unwrap().retain(|id| id != peer_id);
    }

    pub fn clear_candidates(&self) {
        self.candidates.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter(timeout_ms: u64) -> (ClientArbiter, mpsc::UnboundedReceiver<ArbiterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientArbiter::new(Duration::from_millis(timeout_ms), tx), rx)
    }

    #[tokio::test]
    async fn at_most_one_outstanding_request_per_target() {
        let (arbiter, _rx) = arbiter(1_000);
        assert!(arbiter.register("peer-a"));
        assert!(!arbiter.register("peer-a"));
        assert!(arbiter.register("peer-b"));
    }

    #[tokio::test]
    async fn timeout_fires_exactly_once_when_unanswered() {
        let (arbiter, mut rx) = arbiter(20);
        arbiter.register("peer-a");
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ArbiterEvent::RequestTimedOut {
                target_id: "peer-a".into()
            }
        );
    }

    #[tokio::test]
    async fn resolve_cancels_the_timeout() {
        let (arbiter, mut rx) = arbiter(20);
        arbiter.register("peer-a");
        assert!(arbiter.resolve("peer-a"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "timeout fired after resolution");
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_a_no_op() {
        let (arbiter, mut rx) = arbiter(10);
        arbiter.register("peer-a");
        rx.recv().await.unwrap();
        arbiter.take_timed_out("peer-a");
        assert!(!arbiter.resolve("peer-a"));
    }

    #[test]
    fn candidate_queue_is_fifo_and_deduplicated() {
        let (arbiter, _rx) = {
            let (tx, rx) = mpsc::unbounded_channel();
            (ClientArbiter::new(Duration::from_secs(1), tx), rx)
        };
        arbiter.push_candidate("a");
        arbiter.push_candidate("b");
        arbiter.push_candidate("a");
        assert_eq!(arbiter.pop_candidate().as_deref(), Some("a"));
        assert_eq!(arbiter.pop_candidate().as_deref(), Some("b"));
        assert_eq!(arbiter.pop_candidate(), None);
    }
}
