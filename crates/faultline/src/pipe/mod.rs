//! In-process killable byte pipe
//!
//! A bounded FIFO byte channel between exactly one producer and one
//! consumer thread. The producer blocks while the pipe is full, the
//! consumer blocks while it is empty, and every blocked call observes the
//! calling thread's interrupt flag (see [`crate::task`]) so it can be
//! aborted without closing the pipe. Closing either end wakes both sides.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use crate::task::interruptible_wait;

/// Shared mutable state behind the pipe mutex
struct PipeBuffer {
    /// Buffered bytes in FIFO order
    queue: VecDeque<u8>,
    /// Maximum number of buffered bytes
    capacity: usize,
    /// Consumer end has been closed
    read_closed: bool,
    /// Producer end has been closed
    write_closed: bool,
}

/// Synchronization wrapper around [`PipeBuffer`]
struct PipeShared {
    buffer: Mutex<PipeBuffer>,
    data_ready: Condvar,
    space_ready: Condvar,
}

impl PipeShared {
    fn close_read(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.read_closed = true;
        }
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    fn close_write(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.write_closed = true;
        }
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }
}

/// Create a bounded byte pipe with the given capacity.
///
/// # Panics
///
/// Panics if `capacity` is 0.
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    assert!(capacity > 0, "pipe capacity must be > 0");
    let shared = Arc::new(PipeShared {
        buffer: Mutex::new(PipeBuffer {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            read_closed: false,
            write_closed: false,
        }),
        data_ready: Condvar::new(),
        space_ready: Condvar::new(),
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

/// Consumer end of a byte pipe.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeReader {
    /// Number of bytes that can be read without blocking.
    pub fn ready_bytes(&self) -> usize {
        self.shared
            .buffer
            .lock()
            .map(|buffer| buffer.queue.len())
            .unwrap_or(0)
    }

    /// Close this end. Blocked and future writes fail with a broken-pipe
    /// error; blocked and future reads on this end fail likewise.
    pub fn close(&self) {
        self.shared.close_read();
    }

    /// Handle that can close the read end from another thread.
    pub(crate) fn close_handle(&self) -> PipeCloseHandle {
        PipeCloseHandle {
            shared: self.shared.clone(),
            read_end: true,
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut buffer = self
            .shared
            .buffer
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;

        loop {
            if buffer.read_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
            }

            if !buffer.queue.is_empty() {
                let n = buffer.queue.len().min(buf.len());
                for (slot, byte) in buf.iter_mut().zip(buffer.queue.drain(..n)) {
                    *slot = byte;
                }
                self.shared.space_ready.notify_all();
                return Ok(n);
            }

            if buffer.write_closed {
                return Ok(0);
            }

            buffer = interruptible_wait(&self.shared.data_ready, buffer)?;
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.close_read();
    }
}

/// Producer end of a byte pipe.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    /// Close this end. Once the buffer drains, reads return EOF.
    pub fn close(&self) {
        self.shared.close_write();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut buffer = self
            .shared
            .buffer
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;

        loop {
            if buffer.write_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
            }
            if buffer.read_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe read end closed",
                ));
            }

            let space = buffer.capacity - buffer.queue.len();
            if space > 0 {
                let n = space.min(buf.len());
                buffer.queue.extend(&buf[..n]);
                self.shared.data_ready.notify_all();
                return Ok(n);
            }

            buffer = interruptible_wait(&self.shared.space_ready, buffer)?;
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        // Bytes are visible to the reader as soon as they are enqueued.
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.close_write();
    }
}

/// Closes one pipe end out-of-band, from any thread.
pub(crate) struct PipeCloseHandle {
    shared: Arc<PipeShared>,
    read_end: bool,
}

impl PipeCloseHandle {
    pub(crate) fn close(&self) {
        if self.read_end {
            self.shared.close_read();
        } else {
            self.shared.close_write();
        }
    }
}
