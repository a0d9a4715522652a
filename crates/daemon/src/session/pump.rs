//! I/O pump threads moving bytes between a pty master and the session queues.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::byte_queue::ByteQueue;

/// How long a reader sleeps in `poll` before re-checking its stop flag.
const POLL_SLICE_MS: u16 = 100;

const READ_BUFFER_SIZE: usize = 4096;

/// Handle on a running reader pump.
pub(crate) struct ReaderPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaderPump {
    /// Start a thread copying `fd` into `queue`, calling `notify` after every chunk.
    ///
    /// The thread ends on EOF or a read error, when the queue is closed, or
    /// once a stop was requested and no buffered data is left on `fd`.
    pub(crate) fn spawn<F>(
        name: String,
        fd: OwnedFd,
        queue: Arc<ByteQueue>,
        notify: F,
    ) -> io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || read_loop(File::from(fd), &queue, &flag, notify))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Request a stop and wait for the thread to drain and exit.
    pub(crate) fn finish(mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("reader pump panicked");
            }
        }
    }
}

fn wait_readable(file: &File, timeout: PollTimeout) -> nix::Result<bool> {
    let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
    let ready = poll(&mut fds, timeout)?;
    if ready == 0 {
        return Ok(false);
    }
    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    // POLLHUP without POLLIN still gets a read so the EOF/EIO is observed.
    Ok(revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

fn read_loop<F: Fn()>(mut file: File, queue: &ByteQueue, stop: &AtomicBool, notify: F) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let stopping = stop.load(Ordering::Acquire);
        let timeout = if stopping {
            PollTimeout::ZERO
        } else {
            PollTimeout::from(POLL_SLICE_MS)
        };

        match wait_readable(&file, timeout) {
            Ok(true) => {}
            Ok(false) if stopping => break,
            Ok(false) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "poll on pty master failed");
                break;
            }
        }

        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if queue.write(&buf[..n]).is_err() {
                    tracing::debug!("output queue closed, reader exiting");
                    break;
                }
                notify();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            // EIO once every slave descriptor is closed.
            Err(e) => {
                tracing::trace!(error = %e, "pty read ended");
                break;
            }
        }
    }
}

/// Start a thread copying `queue` into `fd` until the queue closes or a write fails.
pub(crate) fn spawn_writer(
    name: String,
    fd: OwnedFd,
    queue: Arc<ByteQueue>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(move || {
        let mut file = File::from(fd);
        let mut buf = [0u8; READ_BUFFER_SIZE];
        while let Ok(n) = queue.read(&mut buf, true) {
            if let Err(e) = file.write_all(&buf[..n]).and_then(|_| file.flush()) {
                tracing::debug!(error = %e, "pty write failed, writer exiting");
                break;
            }
        }
    })
}
