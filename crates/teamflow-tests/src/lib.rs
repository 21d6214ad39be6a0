//! Integration test helpers for teamflow end-to-end scenarios.

pub mod harness;
