//! Unix socket bridge for RPC endpoints.
//!
//! Each connection carries length-prefixed [`protocol::FrameCodec`] frames.
//! A frame whose envelope has `attached_fds > 0` arrives together with that
//! many descriptors as `SCM_RIGHTS` ancillary data on its first byte; two
//! descriptors are rebuilt into a [`crate::pty::PtyPair`].
//!
//! On either side the connection appears as a [`PeerHandle`], so endpoints
//! never know whether a peer is in-process or across a socket.

mod connection;
mod fdpass;
mod listener;

use std::path::Path;

use thiserror::Error;
use tokio::net::UnixStream;

pub use connection::Connection;
pub use listener::RpcListener;

use crate::rpc::{Endpoint, PeerHandle};
use protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("frame announced {expected} descriptors but {got} arrived")]
    MissingDescriptors { expected: usize, got: usize },

    #[error("local endpoint is gone")]
    LocalGone,
}

/// Connect `endpoint` to the broker listening at `path`.
///
/// Starts the endpoint if needed and binds it to the connection, so plain
/// `send_non_blocking`/`send_blocking` calls reach the broker.
pub async fn connect(path: &Path, endpoint: &Endpoint) -> Result<Connection, TransportError> {
    let stream = UnixStream::connect(path).await?;
    let local: PeerHandle = endpoint.start();
    let conn = Connection::spawn(stream, local, format!("{}-client", endpoint.name()));
    endpoint.bind(conn.remote());
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Outbound, Reply};
    use protocol::Opcode;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_blocking_call_over_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.sock");

        let server = Endpoint::new("server");
        server.add_response(Opcode::IS_SERVER_ALIVE, |_| {
            Reply::Respond(Outbound::new(Opcode::IS_SERVER_ALIVE).with_flag(true))
        });
        let local = server.start();
        let shutdown = CancellationToken::new();
        let listener = RpcListener::bind(&path).unwrap();
        tokio::spawn(listener.serve(local, shutdown.clone()));

        let client = Endpoint::new("client");
        let _conn = connect(&path, &client).await.unwrap();
        let answer = client
            .send_blocking_timeout(Outbound::new(Opcode::IS_SERVER_ALIVE), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(answer.opcode(), Opcode::IS_SERVER_ALIVE);
        assert!(answer.envelope.flag());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let dir = tempdir().unwrap();
        let client = Endpoint::new("client");
        let err = connect(&dir.path().join("missing.sock"), &client)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
