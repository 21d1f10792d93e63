//! Shared test utilities for the integration tests.
//!
//! This module provides:
//! - `TestEntity`, a keyed payload for the processors
//! - Recording write invokers (async and blocking) with per-id rejection
//! - A scripted page invoker serving full pages then a short one
//! - A session provider that counts acquire/release

#![allow(dead_code)]

pub mod mock_invoker;
pub mod mock_pager;

pub use mock_invoker::*;
pub use mock_pager::*;

/// Install a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
