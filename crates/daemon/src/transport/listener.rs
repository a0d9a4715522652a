//! Accepting side of the broker socket.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Connection, TransportError};
use crate::rpc::PeerHandle;

/// Listens on a Unix socket and bridges each accepted connection to a local
/// peer, usually the broker's endpoint.
pub struct RpcListener {
    listener: UnixListener,
    path: PathBuf,
}

impl RpcListener {
    /// Bind to `path`.
    ///
    /// Missing parent directories are created with mode 0700 and a stale
    /// socket file at `path` is removed first.
    pub fn bind(path: &Path) -> Result<Self, TransportError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        debug!(path = %path.display(), "rpc socket bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one connection owned by the current user.
    pub async fn accept(&self, local: PeerHandle) -> Result<Connection, TransportError> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let uid = stream.peer_cred()?.uid();
            if uid != nix::unistd::getuid().as_raw() {
                warn!(uid, "rejecting rpc connection from another user");
                continue;
            }
            let label = format!("rpc-{uid}");
            return Ok(Connection::spawn(stream, local.clone(), label));
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self, local: PeerHandle, shutdown: CancellationToken) -> Result<(), TransportError> {
        info!(path = %self.path.display(), "accepting rpc connections");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept(local.clone()) => match accepted {
                    Ok(conn) => debug!(connection = conn.label(), peer = %conn.remote().id(), "rpc client connected"),
                    Err(TransportError::Io(e)) if is_transient(&e) => {
                        warn!(error = %e, "transient accept failure");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}
