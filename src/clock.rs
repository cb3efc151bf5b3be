//! Two-message round-trip clock offset estimation.
//!
//! The client sends its send-timestamp; the master echoes it and appends
//! how long its own epoch has been running. The client halves the measured
//! round trip and rewinds its epoch start so that both nodes agree on the
//! elapsed-time value. Best effort, one sample, re-run on every new master
//! connection.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::util::now_millis;

const SYNC_SEP: char = ':';

pub struct ClockSync {
    /// Local wall-clock millis at which the shared epoch started.
    epoch_start: AtomicI64,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    pub fn new() -> Self {
        Self {
            epoch_start: AtomicI64::new(now_millis()),
        }
    }

    /// Milliseconds elapsed since the (possibly adjusted) epoch start.
    pub fn elapsed(&self) -> i64 {
        now_millis() - self.epoch_start.load(Ordering::SeqCst)
    }

    pub fn epoch_start(&self) -> i64 {
        self.epoch_start.load(Ordering::SeqCst)
    }

    /// Content of an outgoing SYNC_REQUEST: `"<send millis>:"`.
    pub fn request_content(&self) -> String {
        format!("{}{}", now_millis(), SYNC_SEP)
    }

    /// Content of the SYNC_CLOCK reply: the request content with our own
    /// elapsed time appended.
    pub fn response_content(&self, request_content: &str) -> String {
        format!("{request_content}{}", self.elapsed())
    }

    /// Apply a SYNC_CLOCK response: `"<echoed send millis>:<server elapsed>"`.
    pub fn adjust_from_response(&self, content: &str) -> Result<()> {
        let mut parts = content.splitn(2, SYNC_SEP);
        let sent_at: i64 = parts
            .next()
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("bad sync payload: {content}")))?;
        let server_elapsed: i64 = parts
            .next()
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("bad sync payload: {content}")))?;

        let now = now_millis();
        let one_way = (now - sent_at) / 2;
        let epoch_start = now - server_elapsed - one_way;
        self.epoch_start.store(epoch_start, Ordering::SeqCst);
        debug!(one_way, server_elapsed, "clock adjusted to master");
        Ok(())
    }

    /// Same as [`adjust_from_response`](Self::adjust_from_response) but only
    /// logs on malformed payloads, matching the drop-never-crash policy.
    pub fn try_adjust(&self, content: &str) {
        if let Err(error) = self.adjust_from_response(content) {
            warn!(%error, "ignoring malformed clock sync response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_content_is_timestamp_and_separator() {
        let clock = ClockSync::new();
        let content = clock.request_content();
        assert!(content.ends_with(':'));
        assert!(content[..content.len() - 1].parse::<i64>().is_ok());
    }

    #[test]
    fn response_appends_elapsed() {
        let clock = ClockSync::new();
        let response = clock.response_content("12345:");
        let parts: Vec<&str> = response.split(':').collect();
        assert_eq!(parts[0], "12345");
        assert!(parts[1].parse::<i64>().is_ok());
    }

    #[test]
    fn offset_estimate_reconstructs_server_elapsed() {
        let clock = ClockSync::new();
        // Pretend the request left 100 ms ago and the server has been
        // running for 5000 ms: offset = now - 5000 - 50.
        let sent_at = now_millis() - 100;
        clock
            .adjust_from_response(&format!("{sent_at}:5000"))
            .unwrap();
        let elapsed = clock.elapsed();
        // One-way latency is 50 ms, so our elapsed should land at ~5050.
        assert!((elapsed - 5050).abs() < 20, "elapsed was {elapsed}");
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_panic() {
        let clock = ClockSync::new();
        assert!(clock.adjust_from_response("not-a-number").is_err());
        assert!(clock.adjust_from_response("123").is_err());
        clock.try_adjust("still fine");
    }
}
