#![deny(unsafe_code)]

//! Shared test utilities for the warden workspace.
//!
//! Provides reusable fixtures, config builders, a scripted scan engine, and
//! tracing helpers so that individual crate tests stay concise and
//! consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! warden-test-utils = { workspace = true }
//! ```
//!
//! [`engine`] depends only on tokio and can be used from `warden-core`'s own
//! unit tests. [`daemon`] hands out `warden-core` types and is meant for
//! integration tests under `tests/`.

pub mod config;
pub mod daemon;
pub mod engine;
pub mod tracing_setup;
