//! Shared session model and the lane access resolver.
//!
//! Nothing in this crate performs I/O. The server uses it to authorize
//! mutations; clients can link the same code to predict what a user may see
//! or complete before the server confirms it.

pub mod access;
pub mod model;
pub mod snapshot;

pub use access::{AccessResolver, CompletionCheck};
pub use snapshot::SessionSnapshot;

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
