//! Daemon IPC: line-delimited JSON over a Unix domain socket.
//!
//! The CLI (and any other local client) sends one JSON request per line and
//! reads one JSON response per line. Connections that issue `subscribe`
//! additionally receive a push event, tagged with the id `"event"`, for
//! every protection state transition.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐        Unix socket         ┌──────────────┐
//! │   CLI    │───────────────────────────▶│  IPC Server  │
//! │  client  │◀─ ─ ─ push events ─ ─ ─ ─ ─│  (per conn)  │
//! └──────────┘        JSON lines          └──────┬───────┘
//!                                                │
//!                                         ┌──────▼───────┐
//!                                         │    Daemon    │
//!                                         │ state · scan │
//!                                         └──────────────┘
//! ```

use std::path::PathBuf;

pub mod broadcast;
pub mod client;
pub mod server;
pub mod types;

pub use broadcast::{Broadcaster, SubscriberId};
pub use client::IpcClient;
pub use server::{Connection, IpcServer, IpcState};
pub use types::*;

/// Errors from the IPC server and client.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("failed to bind IPC socket at {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to daemon socket at {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon is not running (socket not found at {})", .0.display())]
    NotRunning(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection closed by daemon")]
    Closed,

    #[error("daemon returned error: {0}")]
    Daemon(String),
}
