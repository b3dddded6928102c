//! Revivable input stream
//!
//! An unbuffered reader wrapping a blocking byte source. A dedicated worker
//! thread performs the source's blocking reads on demand, so a read blocked
//! on the wrapper can always be released out-of-band: `kill` makes current
//! and future reads return EOF (or raise an injected error) until
//! `resurrect`, and `queue_read_exception` schedules one-shot errors.
//! Handles are cheap clones sharing one stream; the clone handed to the
//! code under test and the control handle kept by the test are the same
//! stream.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::trace;

use crate::config::stream::READER_WORKER_PREFIX;
use crate::task::{
    clone_error_add_current_stack, decorate_shared, interruptible_wait, share_undecorated,
};

use super::{ByteSource, SourceCloser, WORKER_COUNTER};

/// Shared mutable state behind the stream mutex
struct ReaderInner {
    /// Most recent batch produced by the worker, awaiting handoff
    pending: Option<Vec<u8>>,
    /// Size of the batch the caller asked the worker to read
    requested: usize,
    /// Caller has requested data and the worker should read
    request_data: bool,
    /// Underlying source reached EOF
    stream_closed: bool,
    /// Stream was closed or all handles dropped; the worker must exit
    shutdown: bool,
    /// Terminal fault from the worker; sticky
    worker_error: Option<Arc<io::Error>>,
    /// Reads are disabled until resurrect
    killed: bool,
    /// Sticky fault re-raised on each read while killed
    kill_error: Option<Arc<io::Error>>,
    /// One-shot faults, each raised by exactly one read
    queue: VecDeque<io::Error>,
}

struct ReaderShared<S> {
    state: Mutex<ReaderInner>,
    cond: Condvar,
    /// The worker locks the source for its blocking reads; the caller's
    /// opportunistic top-up read uses try_lock and skips when busy.
    source: Mutex<S>,
    /// Serialises whole read calls across concurrent handles
    op_lock: Mutex<()>,
    decorate: AtomicBool,
    closer: Option<SourceCloser>,
}

impl<S> ReaderShared<S> {
    fn shutdown(&self) {
        if let Some(closer) = &self.closer {
            closer.close();
        }
        if let Ok(mut state) = self.state.lock() {
            state.shutdown = true;
            state.stream_closed = true;
        }
        self.cond.notify_all();
    }
}

/// Owns shutdown of the shared stream; dropped with the last handle.
struct ReaderCore<S> {
    shared: Arc<ReaderShared<S>>,
}

impl<S> Drop for ReaderCore<S> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Revivable input stream handle. See the module docs.
pub struct RevivableReader<S> {
    core: Arc<ReaderCore<S>>,
}

impl<S> Clone for RevivableReader<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<S: ByteSource + 'static> RevivableReader<S> {
    /// Wrap `source`, spawning the worker thread that performs its blocking
    /// reads. Returns once the worker has parked and is ready to serve.
    pub fn new(source: S) -> Self {
        let closer = source.closer();
        let shared = Arc::new(ReaderShared {
            state: Mutex::new(ReaderInner {
                pending: None,
                requested: 0,
                request_data: true,
                stream_closed: false,
                shutdown: false,
                worker_error: None,
                killed: false,
                kill_error: None,
                queue: VecDeque::new(),
            }),
            cond: Condvar::new(),
            source: Mutex::new(source),
            op_lock: Mutex::new(()),
            decorate: AtomicBool::new(true),
            closer,
        });

        let worker_shared = shared.clone();
        let id = WORKER_COUNTER.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("{}-{}", READER_WORKER_PREFIX, id))
            .spawn(move || worker_loop(&worker_shared))
            .expect("failed to spawn revivable reader worker");

        // Wait for the worker to park so the first read cannot race its
        // startup.
        if let Ok(mut state) = shared.state.lock() {
            while state.request_data && !state.shutdown {
                state = match shared.cond.wait(state) {
                    Ok(guard) => guard,
                    Err(_) => break,
                };
            }
        }

        Self {
            core: Arc::new(ReaderCore { shared }),
        }
    }
}

impl<S> RevivableReader<S> {
    fn shared(&self) -> &ReaderShared<S> {
        &self.core.shared
    }

    /// Number of bytes readable without blocking. Always zero: the stream
    /// is semantically unbuffered to callers.
    pub fn available(&self) -> usize {
        0
    }

    /// Disable reads: current and future reads immediately return EOF
    /// until [`resurrect`](Self::resurrect). Takes priority over queued
    /// exceptions. Calling kill on an already killed stream clears any
    /// previously injected kill exception.
    pub fn kill(&self) {
        self.kill_inner(None);
    }

    /// Disable reads, raising `error` from current and future reads until
    /// [`resurrect`](Self::resurrect). Takes priority over queued
    /// exceptions; a repeated call replaces the raised error.
    pub fn kill_with(&self, error: io::Error) {
        self.kill_inner(Some(error));
    }

    fn kill_inner(&self, error: Option<io::Error>) {
        let shared = self.shared();
        if let Ok(mut state) = shared.state.lock() {
            state.kill_error = error.map(Arc::new);
            state.killed = true;
        }
        shared.cond.notify_all();
    }

    /// Re-enable a killed stream. Reads resume from the underlying source.
    /// Does nothing if the stream is not killed.
    pub fn resurrect(&self) {
        if let Ok(mut state) = self.shared().state.lock() {
            state.killed = false;
        }
        self.shared().cond.notify_all();
    }

    /// Same as [`resurrect`](Self::resurrect).
    pub fn revive(&self) {
        self.resurrect();
    }

    /// Queue an error to be raised by the current or next read. Each queued
    /// error is raised exactly once, in insertion order. Kill state takes
    /// priority over the queue.
    pub fn queue_read_exception(&self, error: io::Error) {
        let shared = self.shared();
        if let Ok(mut state) = shared.state.lock() {
            state.queue.push_back(error);
        }
        shared.cond.notify_all();
    }

    /// Whether raised injected errors are decorated with a marker recording
    /// the raising call site (see [`crate::task::clone_error_add_current_stack`]).
    pub fn decorate_exceptions(&self) -> bool {
        self.shared().decorate.load(Ordering::Acquire)
    }

    /// Enable or disable error decoration. Default is enabled.
    pub fn set_decorate_exceptions(&self, decorate: bool) {
        self.shared().decorate.store(decorate, Ordering::Release);
    }

    /// Close the stream and its underlying source, releasing the worker.
    /// Subsequent reads return EOF.
    pub fn close(&self) {
        self.shared().shutdown();
    }

    fn raise_sticky(&self, error: &Arc<io::Error>) -> io::Error {
        if self.decorate_exceptions() {
            decorate_shared(error)
        } else {
            share_undecorated(error)
        }
    }

    fn raise_owned(&self, error: io::Error) -> io::Error {
        if self.decorate_exceptions() {
            clone_error_add_current_stack(error)
        } else {
            error
        }
    }

    /// Read a single byte: `Ok(0..=255)`, or `Ok(-1)` at end of stream or
    /// while killed without an injected error.
    pub fn read_byte(&mut self) -> io::Result<i32>
    where
        S: ByteSource,
    {
        let mut byte = [0u8; 1];
        match self.read_internal(&mut byte)? {
            0 => Ok(-1),
            _ => Ok(i32::from(byte[0])),
        }
    }

    fn read_internal(&mut self, buf: &mut [u8]) -> io::Result<usize>
    where
        S: ByteSource,
    {
        if buf.is_empty() {
            return Ok(0);
        }

        let shared = self.shared();
        let _op = shared
            .op_lock
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        let mut state = shared
            .state
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;

        if state.pending.is_none() {
            state.requested = buf.len();
            state.request_data = true;
            shared.cond.notify_all();
        }

        loop {
            if state.stream_closed {
                return Ok(0);
            }
            if let Some(error) = &state.worker_error {
                let raised = self.raise_sticky(error);
                return Err(raised);
            }
            if state.killed {
                if let Some(error) = &state.kill_error {
                    let raised = self.raise_sticky(error);
                    return Err(raised);
                }
                return Ok(0);
            }
            if let Some(error) = state.queue.pop_front() {
                return Err(self.raise_owned(error));
            }

            if state.pending.is_some() {
                break;
            }

            state = interruptible_wait(&shared.cond, state)?;
        }

        let data = state.pending.take().expect("checked in loop above");
        let len = buf.len();

        if data.len() < len {
            let n = data.len();
            buf[..n].copy_from_slice(&data);
            let mut total = n;

            // Top up without blocking if the source has more bytes ready.
            // The worker holds the source lock only while actually reading,
            // so a failed try_lock just means no top-up this time.
            if let Ok(mut source) = shared.source.try_lock() {
                let additional = source.ready_bytes().min(len - n);
                if additional > 0 {
                    if let Ok(extra) = source.read(&mut buf[n..n + additional]) {
                        total += extra;
                    }
                }
            }
            Ok(total)
        } else if data.len() > len {
            buf.copy_from_slice(&data[..len]);
            state.pending = Some(data[len..].to_vec());
            Ok(len)
        } else {
            buf.copy_from_slice(&data);
            Ok(len)
        }
    }
}

impl<S: ByteSource> Read for RevivableReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_internal(buf)
    }
}

/// Worker: serves one blocking source read per caller request, publishing
/// the result into the shared state.
fn worker_loop<S: ByteSource>(shared: &ReaderShared<S>) {
    loop {
        let requested = {
            let mut state = match shared.state.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            state.request_data = false;
            shared.cond.notify_all();
            while !state.request_data {
                if state.shutdown {
                    trace!("revivable reader worker shut down");
                    return;
                }
                state = match shared.cond.wait(state) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
            if state.shutdown {
                return;
            }
            state.requested.max(1)
        };

        // The blocking read happens outside the state lock so control calls
        // stay responsive.
        let result = match shared.source.lock() {
            Ok(mut source) => {
                let mut buffer = vec![0u8; requested];
                source.read(&mut buffer).map(|count| {
                    buffer.truncate(count);
                    buffer
                })
            }
            Err(e) => Err(io::Error::other(e.to_string())),
        };

        let mut state = match shared.state.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match result {
            Ok(data) if data.is_empty() => {
                state.stream_closed = true;
                shared.cond.notify_all();
                trace!("revivable reader worker: source EOF");
                return;
            }
            Ok(data) => {
                state.pending = Some(data);
                shared.cond.notify_all();
            }
            Err(error) => {
                trace!("revivable reader worker failed: {error}");
                state.worker_error = Some(Arc::new(error));
                shared.cond.notify_all();
                return;
            }
        }
    }
}
