//! # termbroker
//!
//! A local terminal-session broker. It hosts pty-backed sessions (an
//! interactive shell, a log view over someone else's pty, and a logcat
//! follower), and lets clients on the same machine create, attach, list
//! and remove them over a small opcode-based RPC protocol.
//!
//! External processes can register themselves as *tracked processes* by
//! handing over their pty pair. The broker then shows their output in a log
//! session plus a logcat session, and removes both once the process dies.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        BrokerService                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌───────────────┐   ┌──────────────────┐   ┌────────────┐   │
//! │  │  RpcListener  │──▶│  Broker Endpoint │──▶│  Sessions  │   │
//! │  │ (framed RPC)  │   │ (opcode handlers)│   │ (pty pumps)│   │
//! │  └───────────────┘   └──────────────────┘   └────────────┘   │
//! │  ┌───────────────┐   ┌──────────────────┐                    │
//! │  │   IpcServer   │   │ Tracked registry │◀── liveness poll   │
//! │  │ (JSON control)│   │  and clients     │                    │
//! │  └───────────────┘   └──────────────────┘                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`byte_queue`]: bounded byte channel between pumps and consumers
//! - [`pty`]: raw pty pairs that can be passed between processes
//! - [`session`]: terminal sessions, pumps and exit handling
//! - [`rpc`]: opcode-dispatching endpoints and peer handles
//! - [`broker`]: the session broker
//! - [`transport`]: Unix socket bridge with descriptor passing
//! - [`ipc`]: JSON control socket and pid file
//! - [`config`]: configuration loading and validation
//! - [`service`]: the daemon wiring all of the above together

pub mod broker;
pub mod byte_queue;
pub mod config;
pub mod ipc;
pub mod pty;
pub mod rpc;
pub mod service;
pub mod session;
pub mod transport;

pub use protocol;

pub use broker::{Broker, BrokerError, BrokerEvent, BrokerSettings, BrokerStatus};
pub use byte_queue::{ByteQueue, ByteQueueError};
pub use config::Config;
pub use pty::PtyPair;
pub use rpc::{Endpoint, EndpointError, Outbound, PeerHandle, Reply};
pub use service::{BrokerService, ServiceEvent, ServiceState};
pub use session::{SessionError, SessionId, SessionKind, TerminalSession, TrackedId};
pub use transport::{connect, Connection, RpcListener, TransportError};
