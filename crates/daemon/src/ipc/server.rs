//! Control-socket server.
//!
//! The server listens on a Unix socket and answers newline-delimited JSON
//! requests from the CLI.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::messages::{IpcRequest, IpcResponse};

/// A server that listens for control connections on a Unix socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to `path`.
    ///
    /// Missing parent directories are created (mode 0700) and an existing
    /// socket file is removed first.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
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

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Answer requests with `handler` until `shutdown` fires.
    ///
    /// Each request runs on the blocking pool, since broker operations may
    /// wait for session threads.
    pub async fn serve<F>(self, handler: F, shutdown: CancellationToken) -> Result<(), io::Error>
    where
        F: Fn(IpcRequest) -> IpcResponse + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let mut conn = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => accepted?,
            };
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let request = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        request = conn.read_request() => request,
                    };
                    let request = match request {
                        Ok(Some(request)) => request,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "bad control request");
                            let _ = conn
                                .send_response(&IpcResponse::Error {
                                    message: e.to_string(),
                                })
                                .await;
                            break;
                        }
                    };
                    debug!(?request, "control request");

                    let handler = Arc::clone(&handler);
                    let response = match tokio::task::spawn_blocking(move || handler(request)).await {
                        Ok(response) => response,
                        Err(e) => IpcResponse::Error {
                            message: format!("request handler failed: {e}"),
                        },
                    };
                    if conn.send_response(&response).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(())
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A connection to a control client.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request. `None` means the client disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim())?))
    }

    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Errors that can occur on the control socket.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
