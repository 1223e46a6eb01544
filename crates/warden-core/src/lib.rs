#![deny(unsafe_code)]

//! Warden core daemon runtime.
//!
//! Provides the protection state machine, the scan-engine client, the scan
//! orchestrator, the wide-event pipeline, and the Unix socket IPC server
//! that the `warden` CLI talks to.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future: the return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits produces opaque return types that are not
/// object-safe. Traits consumed via `Arc<dyn Trait>` return a concrete
/// `Pin<Box<dyn Future>>` instead. This alias keeps those signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Shared daemon context, health checks and run loop.
pub mod daemon;
/// Line-protocol client for the external scan engine.
pub mod engine;
/// Wide events: builders, sampling and rendering.
pub mod events;
/// Firewall on/off control.
pub mod firewall;
/// Unix socket IPC: wire types, server, client.
pub mod ipc;
/// In-memory log collector.
pub mod logging;
/// Scan job orchestration.
pub mod scan;
/// Protection state machine.
pub mod state;

pub use daemon::{Daemon, DaemonError};
pub use engine::{EngineClient, EngineError, ScanEngine, ScanResult, Verdict};
pub use events::{Emitter, Event, EventType};
pub use firewall::{FirewallControl, FirewallFlag};
pub use ipc::{IpcClient, IpcError, IpcServer};
pub use logging::{LogCollector, LogReader};
pub use scan::{ScanError, ScanOrchestrator, ScanPolicy, ScanSummary, ScanType};
pub use state::{ProtectionState, StateMachine, StateObserver};
