//! Collaborative session server.
//!
//! Templates, sessions, lanes and delegation live in SQLite behind
//! [`engine::SessionEngine`]; live clients speak JSON lines over TCP
//! ([`server::serve`]) and hear about changes through the
//! [`bus::RealtimeBus`].

pub mod blob;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod identity;
pub mod server;
