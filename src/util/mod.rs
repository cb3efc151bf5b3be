//! Small shared primitives.

mod wait;

pub use wait::await_condition;

/// Milliseconds since the Unix epoch, the protocol's timestamp unit.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
