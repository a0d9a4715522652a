//! In-process RPC between the broker and its clients.
//!
//! Endpoints exchange [`protocol::Envelope`]s through peer handles. The
//! socket bridge in [`crate::transport`] makes a remote process look like
//! just another peer handle.

pub mod endpoint;
pub mod peer;

use std::time::Duration;

use thiserror::Error;

pub use endpoint::{Endpoint, Handler, Reply};
pub use peer::{Inbound, Outbound, PeerHandle, PeerId};

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("{0} is gone")]
    PeerGone(PeerId),

    #[error("endpoint has no bound peer")]
    NotBound,

    #[error("endpoint dispatcher is not running")]
    NotStarted,

    #[error("endpoint is closed")]
    Closed,

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}
