//! Bounded byte channel connecting session pumps to their consumers.
//!
//! A fixed-capacity circular buffer guarded by one mutex with two condition
//! variables: writers wait for space, readers wait for data. Closing the
//! queue wakes everybody; readers may still drain what was buffered before
//! they see [`ByteQueueError::Closed`].

use std::sync::{Condvar, Mutex, MutexGuard};

use thiserror::Error;

/// Capacity used for both directions of a terminal session.
pub const SESSION_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ByteQueueError {
    #[error("byte queue closed")]
    Closed,
}

#[derive(Debug)]
struct State {
    buf: Vec<u8>,
    head: usize,
    len: usize,
    open: bool,
}

/// A bounded FIFO of bytes shared between threads.
#[derive(Debug)]
pub struct ByteQueue {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
}

impl ByteQueue {
    /// Create a queue holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                buf: vec![0u8; capacity.max(1)],
                head: 0,
                len: 0,
                open: true,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append all of `data`, blocking while the queue is full.
    ///
    /// Fails with [`ByteQueueError::Closed`] if the queue is closed before
    /// everything was written. Bytes written before the close stay readable.
    pub fn write(&self, mut data: &[u8]) -> Result<(), ByteQueueError> {
        let mut state = self.lock();
        while !data.is_empty() {
            while state.open && state.len == state.buf.len() {
                state = self.writable.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            if !state.open {
                return Err(ByteQueueError::Closed);
            }

            let capacity = state.buf.len();
            let free = capacity - state.len;
            let tail = (state.head + state.len) % capacity;
            let chunk = data.len().min(free).min(capacity - tail);
            state.buf[tail..tail + chunk].copy_from_slice(&data[..chunk]);
            state.len += chunk;
            data = &data[chunk..];
            self.readable.notify_all();
        }
        Ok(())
    }

    /// Copy up to `out.len()` bytes into `out`.
    ///
    /// With `block` set this waits until at least one byte is available.
    /// `Ok(0)` is only returned for a non-blocking read of an empty open
    /// queue. Once the queue is closed and drained every read fails with
    /// [`ByteQueueError::Closed`].
    pub fn read(&self, out: &mut [u8], block: bool) -> Result<usize, ByteQueueError> {
        let mut state = self.lock();
        if block {
            while state.open && state.len == 0 {
                state = self.readable.wait(state).unwrap_or_else(|e| e.into_inner());
            }
        }

        if state.len == 0 {
            return if state.open {
                Ok(0)
            } else {
                Err(ByteQueueError::Closed)
            };
        }
        if out.is_empty() {
            return Ok(0);
        }

        let capacity = state.buf.len();
        let mut copied = 0;
        while copied < out.len() && state.len > 0 {
            let contiguous = (capacity - state.head).min(state.len);
            let chunk = contiguous.min(out.len() - copied);
            let head = state.head;
            out[copied..copied + chunk].copy_from_slice(&state.buf[head..head + chunk]);
            state.head = (head + chunk) % capacity;
            state.len -= chunk;
            copied += chunk;
        }
        if state.len == 0 {
            state.head = 0;
        }
        self.writable.notify_all();
        Ok(copied)
    }

    /// Close the queue and wake every waiting reader and writer. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.open {
            state.open = false;
            self.readable.notify_all();
            self.writable.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        !self.lock().open
    }

    /// Bytes currently buffered.
    pub fn available(&self) -> usize {
        self.lock().len
    }

    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }
}
