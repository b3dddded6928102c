//! Task utilities for tests dealing with blocking code
//!
//! Provides time-limited execution, asynchronous task handles that can be
//! interrupted, and the cooperative interrupt flag that every blocking wait
//! in this crate polls. OS threads cannot be cancelled from outside, so
//! "interrupting" a thread means setting its flag; blocked operations
//! re-check it on a short tick and fail with an interrupted-I/O error.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use crate::config::task::ASYNC_TASK_PREFIX;
use crate::config::timing::INTERRUPT_POLL;
use crate::error::{interrupted_error, TaskError};

/// Marker embedded in the display of decorated errors so tests can detect
/// that decoration happened. Kept verbatim for compatibility with test
/// suites that grep for it.
pub const DECORATION_MARKER: &str = "cloneThrowableAddCurrentStack";

// ---------------------------------------------------------------------------
// Interrupt flag
// ---------------------------------------------------------------------------

thread_local! {
    static INTERRUPT: std::cell::RefCell<Option<Arc<AtomicBool>>> =
        const { std::cell::RefCell::new(None) };
}

/// Returns the calling thread's interrupt flag, creating it on first use.
///
/// Hand the returned handle to another thread to allow it to interrupt
/// blocking faultline operations running on this thread.
pub fn interrupt_flag() -> Arc<AtomicBool> {
    INTERRUPT.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.get_or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    })
}

/// Install a pre-created flag as this thread's interrupt flag.
fn install_interrupt_flag(flag: Arc<AtomicBool>) {
    INTERRUPT.with(|slot| *slot.borrow_mut() = Some(flag));
}

/// Consume the calling thread's interrupt status. Returns true if the
/// thread was interrupted; the flag is cleared, mirroring how interrupted
/// blocking calls clear interrupt status on other runtimes.
pub fn take_interrupt() -> bool {
    INTERRUPT.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(|f| f.swap(false, Ordering::AcqRel))
    })
}

/// One interrupt-aware step of a condvar wait. Fails with interrupted-I/O
/// if the calling thread's interrupt flag is set, otherwise waits at most
/// one poll tick and hands the guard back for the caller to re-check its
/// predicate.
pub(crate) fn interruptible_wait<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
) -> io::Result<MutexGuard<'a, T>> {
    if take_interrupt() {
        return Err(interrupted_error());
    }
    let (guard, _timed_out) = cond
        .wait_timeout(guard, INTERRUPT_POLL)
        .map_err(|e| io::Error::other(e.to_string()))?;
    Ok(guard)
}

/// Interrupt-aware blocking receive from a crossbeam channel.
pub(crate) fn interruptible_recv<T>(rx: &Receiver<T>) -> io::Result<T> {
    loop {
        if take_interrupt() {
            return Err(interrupted_error());
        }
        match rx.recv_timeout(INTERRUPT_POLL) {
            Ok(value) => return Ok(value),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(io::Error::other("channel disconnected"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Async tasks
// ---------------------------------------------------------------------------

static TASK_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Handle to a body running on a dedicated worker thread.
pub struct AsyncTask<T> {
    result_rx: Receiver<Result<T, String>>,
    interrupt: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> AsyncTask<T> {
    /// Wait up to `timeout` for the task's result. A panic inside the body
    /// is re-raised as [`TaskError::Failed`] carrying the panic message.
    pub fn result(&self, timeout: Duration) -> Result<T, TaskError> {
        match self.result_rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic_msg)) => Err(TaskError::Failed(panic_msg)),
            Err(RecvTimeoutError::Timeout) => {
                Err(TaskError::ResultTimeout(timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(TaskError::Failed("task terminated without a result".to_string()))
            }
        }
    }

    /// Set the task thread's interrupt flag. Blocking faultline operations
    /// on that thread observe it within one poll tick.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    /// Whether the task thread has finished running.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Start `body` on a named worker thread and return a handle to it.
pub fn spawn_async<T, F>(body: F) -> AsyncTask<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (result_tx, result_rx) = bounded(1);
    let interrupt = Arc::new(AtomicBool::new(false));
    let task_flag = interrupt.clone();
    let id = TASK_COUNTER.fetch_add(1, Ordering::Relaxed);

    let handle = thread::Builder::new()
        .name(format!("{}-{}", ASYNC_TASK_PREFIX, id))
        .spawn(move || {
            install_interrupt_flag(task_flag);
            let outcome = catch_unwind(AssertUnwindSafe(body)).map_err(|payload| {
                payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string())
            });
            let _ = result_tx.send(outcome);
        })
        .expect("failed to spawn async task thread");

    AsyncTask {
        result_rx,
        interrupt,
        handle,
    }
}

/// Run `body` on a worker thread, failing with
/// [`TaskError::TimeLimitExceeded`] if it does not complete within `limit`.
/// On timeout the worker is interrupted and left to wind down on its own.
pub fn run_with_time_limit<T, F>(limit: Duration, body: F) -> Result<T, TaskError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let task = spawn_async(body);
    match task.result(limit) {
        Ok(value) => Ok(value),
        Err(TaskError::ResultTimeout(_)) => {
            task.interrupt();
            Err(TaskError::TimeLimitExceeded(limit.as_millis() as u64))
        }
        Err(other) => Err(other),
    }
}

// ---------------------------------------------------------------------------
// Error decoration
// ---------------------------------------------------------------------------

/// Payload of a decorated error: keeps the original message and chains the
/// original error as the source.
#[derive(Debug)]
struct DecoratedFault {
    message: String,
    original: Arc<io::Error>,
}

impl fmt::Display for DecoratedFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message, DECORATION_MARKER)
    }
}

impl StdError for DecoratedFault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.original)
    }
}

/// Payload of an undecorated re-raise of a sticky fault: same kind and
/// message as the original, original as the source.
#[derive(Debug)]
struct SharedFault {
    original: Arc<io::Error>,
}

impl fmt::Display for SharedFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl StdError for SharedFault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.original)
    }
}

/// Produce a new error of the same kind and message as `e`, with `e` as the
/// source and a display marker recording that the error was re-raised at
/// the caller's position. Tests detect the marker via [`is_decorated`].
pub fn clone_error_add_current_stack(e: io::Error) -> io::Error {
    let kind = e.kind();
    let message = e.to_string();
    io::Error::new(
        kind,
        DecoratedFault {
            message,
            original: Arc::new(e),
        },
    )
}

/// Decorate a shared sticky fault without consuming it.
pub(crate) fn decorate_shared(e: &Arc<io::Error>) -> io::Error {
    io::Error::new(
        e.kind(),
        DecoratedFault {
            message: e.to_string(),
            original: Arc::clone(e),
        },
    )
}

/// Re-raise a shared sticky fault without decoration: same kind, same
/// message, original as source.
pub(crate) fn share_undecorated(e: &Arc<io::Error>) -> io::Error {
    io::Error::new(
        e.kind(),
        SharedFault {
            original: Arc::clone(e),
        },
    )
}

/// Whether `e` was produced by [`clone_error_add_current_stack`].
pub fn is_decorated(e: &io::Error) -> bool {
    e.to_string().contains(DECORATION_MARKER)
}
