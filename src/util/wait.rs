//! Cancellable bounded-polling wait.
//!
//! The protocol has several suspension points of the form "wait until a
//! peer's status reaches X, unless the peer disappears". They are all
//! expressed through this primitive: poll with a fixed backoff, bail out
//! the moment the liveness check fails or the token is cancelled.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Poll `predicate` until it holds. Returns `true` on success, `false` if
/// `liveness` failed or `cancel` fired first.
pub async fn await_condition(
    predicate: impl Fn() -> bool,
    poll_interval: Duration,
    liveness: impl Fn() -> bool,
    cancel: &CancellationToken,
) -> bool {
    loop {
        if predicate() {
            return true;
        }
        if !liveness() {
            return false;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn resolves_when_predicate_turns_true() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            setter.store(true, Ordering::SeqCst);
        });
        let token = CancellationToken::new();
        let satisfied = await_condition(
            || flag.load(Ordering::SeqCst),
            Duration::from_millis(10),
            || true,
            &token,
        )
        .await;
        assert!(satisfied);
    }

    #[tokio::test]
    async fn aborts_when_liveness_fails() {
        let token = CancellationToken::new();
        let satisfied = await_condition(
            || false,
            Duration::from_millis(5),
            || false,
            &token,
        )
        .await;
        assert!(!satisfied);
    }

    #[tokio::test]
    async fn aborts_on_cancellation() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let satisfied = await_condition(
            || false,
            Duration::from_millis(5),
            || true,
            &token,
        )
        .await;
        assert!(!satisfied);
    }
}
