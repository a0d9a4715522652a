//! One socket connection bridged onto peer handles.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use protocol::{Envelope, FrameBuffer, FrameCodec};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::fdpass::{recv_with_fds, send_with_fds};
use super::TransportError;
use crate::pty::PtyPair;
use crate::rpc::{Inbound, PeerHandle};

const READ_CHUNK: usize = 64 * 1024;

/// A live socket connection.
///
/// Frames read from the socket are delivered to the local peer with the
/// connection's own handle as `reply_to`; messages sent to that handle are
/// written to the socket. Once either direction fails, both stop and the
/// handle reports itself closed.
#[derive(Debug)]
pub struct Connection {
    label: String,
    remote: PeerHandle,
    closed: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Bridge `stream` to `local`. Must run inside a tokio runtime.
    pub fn spawn(stream: UnixStream, local: PeerHandle, label: impl Into<String>) -> Self {
        let label = label.into();
        let stream = Arc::new(stream);
        let (remote, outbox) = PeerHandle::channel();
        let closed = CancellationToken::new();

        let reader = {
            let stream = Arc::clone(&stream);
            let remote = remote.clone();
            let closed = closed.clone();
            let label = label.clone();
            tokio::spawn(async move {
                match read_loop(&stream, &local, &remote, &closed).await {
                    Ok(()) => debug!(connection = %label, "peer closed the connection"),
                    Err(e) => warn!(connection = %label, error = %e, "connection read failed"),
                }
                closed.cancel();
            })
        };

        let writer = {
            let closed = closed.clone();
            let label = label.clone();
            tokio::spawn(async move {
                if let Err(e) = write_loop(&stream, outbox, &closed).await {
                    warn!(connection = %label, error = %e, "connection write failed");
                }
                closed.cancel();
            })
        };

        debug!(connection = %label, peer = %remote.id(), "connection bridged");
        Self {
            label,
            remote,
            closed,
            reader,
            writer,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Handle standing in for the process at the other end.
    pub fn remote(&self) -> PeerHandle {
        self.remote.clone()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until both directions have stopped.
    pub async fn join(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

fn take_attachment(
    fds: &mut VecDeque<OwnedFd>,
    envelope: &Envelope,
) -> Result<Option<PtyPair>, TransportError> {
    let expected = usize::from(envelope.attached_fds);
    if expected == 0 {
        return Ok(None);
    }
    if fds.len() < expected {
        return Err(TransportError::MissingDescriptors {
            expected,
            got: fds.len(),
        });
    }
    let mut taken: Vec<OwnedFd> = fds.drain(..expected).collect();
    if taken.len() != 2 {
        warn!(count = taken.len(), "unexpected descriptor count, dropping them");
        return Ok(None);
    }
    let slave = taken.pop();
    let master = taken.pop();
    Ok(master.zip(slave).map(|(m, s)| PtyPair::from_fds(m, s)))
}

async fn read_loop(
    stream: &UnixStream,
    local: &PeerHandle,
    remote: &PeerHandle,
    closed: &CancellationToken,
) -> Result<(), TransportError> {
    let mut frames = FrameBuffer::new();
    let mut fds: VecDeque<OwnedFd> = VecDeque::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let socket = stream.as_raw_fd();

    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => return Ok(()),
            read = stream.async_io(Interest::READABLE, || recv_with_fds(socket, &mut buf, &mut fds)) => read?,
        };
        if n == 0 {
            return Ok(());
        }
        frames.extend(&buf[..n]);

        while let Some(envelope) = frames.next_envelope()? {
            let attachment = take_attachment(&mut fds, &envelope)?;
            local
                .deliver(envelope, Some(remote.clone()), attachment)
                .map_err(|_| TransportError::LocalGone)?;
        }
    }
}

async fn write_loop(
    stream: &UnixStream,
    mut outbox: mpsc::UnboundedReceiver<Inbound>,
    closed: &CancellationToken,
) -> Result<(), TransportError> {
    let codec = FrameCodec::new();
    let socket = stream.as_raw_fd();

    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => return Ok(()),
            next = outbox.recv() => match next {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        let Inbound {
            mut envelope,
            attachment,
            ..
        } = message;
        // Our copies close once the frame is out; the peer holds its own.
        let owned = attachment.map(PtyPair::into_fds);
        let raw: Vec<RawFd> = owned
            .iter()
            .flat_map(|(master, slave)| [master.as_raw_fd(), slave.as_raw_fd()])
            .collect();
        envelope.attached_fds = raw.len() as u8;
        let frame = codec.encode(&envelope)?;

        let mut sent = 0;
        while sent < frame.len() {
            let rest = &frame[sent..];
            let fds: &[RawFd] = if sent == 0 { &raw } else { &[] };
            let n = stream
                .async_io(Interest::WRITABLE, || send_with_fds(socket, rest, fds))
                .await?;
            if n == 0 {
                return Err(TransportError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            sent += n;
        }
        drop(owned);
    }
}
