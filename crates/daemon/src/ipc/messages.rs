//! Control-socket message types.
//!
//! These travel as newline-delimited JSON between the `termbroker` CLI and
//! the running daemon.

use protocol::SessionSummary;
use serde::{Deserialize, Serialize};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all hosted sessions.
    ListSessions,
    /// Shut down and drop one session.
    RemoveSession { session_id: u64 },
    /// Acquire or release the wake lock.
    SetWakeLock { held: bool },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    Pong,
    Status {
        running: bool,
        uptime_secs: u64,
        session_count: usize,
        tracked_count: usize,
        client_count: usize,
        wake_lock_held: bool,
    },
    Stopping,
    Sessions { sessions: Vec<SessionSummary> },
    SessionRemoved { session_id: u64 },
    WakeLock { held: bool },
    Error { message: String },
}
