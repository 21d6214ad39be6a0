pub mod client;
pub mod protocol;

/// The session model and lane resolver, re-exported so clients can compute
/// the same visibility hints the server enforces.
pub use teamflow_core as core;
pub use teamflow_core::{AccessResolver, CompletionCheck, SessionSnapshot};

/// Default address the server listens on.
pub const DEFAULT_ADDR: &str = "127.0.0.1:7410";
