//! Revivable output stream
//!
//! A writer wrapping a blocking byte sink. Accepted bytes travel through a
//! bounded transfer queue to a dedicated worker thread that performs the
//! sink's blocking writes, so the calling thread blocks only on queue
//! backpressure and can always be released out-of-band: `kill` fails
//! current and future writes until `resurrect`, `queue_write_exception`
//! schedules one-shot errors, and `flush` coordinates with the worker so
//! that all previously accepted bytes have reached the sink before it
//! returns. Handles are cheap clones sharing one stream.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::trace;

use crate::config::stream::WRITER_WORKER_PREFIX;
use crate::config::timing::WORKER_SHUTDOWN_POLL;
use crate::error::{stream_closed_error, stream_killed_error};
use crate::task::{
    clone_error_add_current_stack, decorate_shared, interruptible_recv, share_undecorated,
};

use super::{ByteSink, WORKER_COUNTER};

/// Item travelling through the transfer queue.
enum Transfer {
    /// Normal payload byte
    Byte(u8),
    /// Worker must confirm delivery of everything before this marker
    Flush,
    /// Worker must terminate cleanly
    Exit,
}

/// Item travelling through the flush-response signal.
enum FlushSignal {
    /// Everything up to the flush marker reached the sink
    Done,
    /// Stream state changed (kill / queued exception); re-check and spin
    Poke,
    /// The worker died on a sink failure
    Failed(Arc<io::Error>),
}

struct WriterShared<W> {
    /// The worker locks the sink for batch writes; `flush` locks it on the
    /// caller thread for the final sink flush.
    sink: Mutex<W>,
    transfer_tx: Sender<Transfer>,
    transfer_rx: Receiver<Transfer>,
    /// Capacity-1 "there might be space" signal for blocked producers
    avail_tx: Sender<()>,
    avail_rx: Receiver<()>,
    /// Capacity-1 flush response slot
    flush_tx: Sender<FlushSignal>,
    flush_rx: Receiver<FlushSignal>,
    /// Serialises flush calls so responses are not mixed across callers
    flush_lock: Mutex<()>,
    /// Serialises close calls
    close_lock: Mutex<()>,
    closed: AtomicBool,
    killed: AtomicBool,
    /// All handles dropped; the worker drains what it has and exits
    shutdown: AtomicBool,
    decorate: AtomicBool,
    kill_error: Mutex<Option<Arc<io::Error>>>,
    /// Terminal fault from the worker; sticky
    transfer_error: Mutex<Option<Arc<io::Error>>>,
    /// One-shot faults, each raised by exactly one write
    queue: Mutex<VecDeque<io::Error>>,
    batch_size: usize,
}

/// Owns shutdown of the shared stream; dropped with the last handle.
struct WriterCore<W> {
    shared: Arc<WriterShared<W>>,
}

impl<W> Drop for WriterCore<W> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.transfer_tx.try_send(Transfer::Exit);
        let _ = self.shared.avail_tx.try_send(());
    }
}

/// Revivable output stream handle. See the module docs.
pub struct RevivableWriter<W> {
    core: Arc<WriterCore<W>>,
}

impl<W> Clone for RevivableWriter<W> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<W: ByteSink + 'static> RevivableWriter<W> {
    /// Wrap `sink`, spawning the worker thread that performs its blocking
    /// writes. Up to `buffer_size` bytes can be accepted without blocking.
    pub fn new(sink: W, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "writer buffer size must be > 0");

        let (transfer_tx, transfer_rx) = bounded(buffer_size);
        let (avail_tx, avail_rx) = bounded(1);
        let (flush_tx, flush_rx) = bounded(1);

        let shared = Arc::new(WriterShared {
            sink: Mutex::new(sink),
            transfer_tx,
            transfer_rx,
            avail_tx,
            avail_rx,
            flush_tx,
            flush_rx,
            flush_lock: Mutex::new(()),
            close_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            decorate: AtomicBool::new(true),
            kill_error: Mutex::new(None),
            transfer_error: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            batch_size: buffer_size,
        });

        let worker_shared = shared.clone();
        let id = WORKER_COUNTER.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("{}-{}", WRITER_WORKER_PREFIX, id))
            .spawn(move || worker_loop(&worker_shared))
            .expect("failed to spawn revivable writer worker");

        Self {
            core: Arc::new(WriterCore { shared }),
        }
    }
}

impl<W> RevivableWriter<W> {
    fn shared(&self) -> &WriterShared<W> {
        &self.core.shared
    }

    /// Disable writes: current and future writes fail with the fixed
    /// killed-stream error until [`resurrect`](Self::resurrect). Takes
    /// priority over queued exceptions. Bytes already accepted continue to
    /// drain to the sink.
    pub fn kill(&self) {
        self.kill_inner(None);
    }

    /// Disable writes, raising `error` from current and future writes until
    /// [`resurrect`](Self::resurrect). A repeated call replaces the raised
    /// error.
    pub fn kill_with(&self, error: io::Error) {
        self.kill_inner(Some(error));
    }

    fn kill_inner(&self, error: Option<io::Error>) {
        let shared = self.shared();
        if let Ok(mut slot) = shared.kill_error.lock() {
            *slot = error.map(Arc::new);
        }
        shared.killed.store(true, Ordering::Release);
        // Wake producers blocked on space and any flush in progress.
        let _ = shared.avail_tx.try_send(());
        let _ = shared.flush_tx.try_send(FlushSignal::Poke);
    }

    /// Re-enable a killed stream. Does nothing if the stream is not killed.
    pub fn resurrect(&self) {
        self.shared().killed.store(false, Ordering::Release);
    }

    /// Same as [`resurrect`](Self::resurrect).
    pub fn revive(&self) {
        self.resurrect();
    }

    /// Queue an error to be raised by the current or next write. Each
    /// queued error is raised exactly once, in insertion order. Kill state
    /// takes priority over the queue.
    pub fn queue_write_exception(&self, error: io::Error) {
        let shared = self.shared();
        if let Ok(mut queue) = shared.queue.lock() {
            queue.push_back(error);
        }
        let _ = shared.avail_tx.try_send(());
        let _ = shared.flush_tx.try_send(FlushSignal::Poke);
    }

    /// Whether raised injected errors are decorated with a marker recording
    /// the raising call site.
    pub fn decorate_exceptions(&self) -> bool {
        self.shared().decorate.load(Ordering::Acquire)
    }

    /// Enable or disable error decoration. Default is enabled.
    pub fn set_decorate_exceptions(&self, decorate: bool) {
        self.shared().decorate.store(decorate, Ordering::Release);
    }

    fn raise_sticky(&self, error: &Arc<io::Error>) -> io::Error {
        if self.decorate_exceptions() {
            decorate_shared(error)
        } else {
            share_undecorated(error)
        }
    }

    /// Precedence check shared by write, flush and close paths.
    fn check_write_fault(&self) -> io::Result<()> {
        let shared = self.shared();
        if shared.closed.load(Ordering::Acquire) {
            return Err(stream_closed_error());
        }
        if let Ok(slot) = shared.transfer_error.lock() {
            if let Some(error) = slot.as_ref() {
                return Err(self.raise_sticky(error));
            }
        }
        if shared.killed.load(Ordering::Acquire) {
            if let Ok(slot) = shared.kill_error.lock() {
                if let Some(error) = slot.as_ref() {
                    return Err(self.raise_sticky(error));
                }
            }
            return Err(stream_killed_error());
        }
        let queued = shared.queue.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(error) = queued {
            if self.decorate_exceptions() {
                return Err(clone_error_add_current_stack(error));
            }
            return Err(error);
        }
        Ok(())
    }

    /// Submit one item through the producer path: precedence check, then a
    /// non-blocking enqueue, blocking on the availability signal when the
    /// queue is full. Always re-offers an availability token on the way out
    /// so a peer producer may proceed.
    fn submit(&self, item: Transfer) -> io::Result<()> {
        let shared = self.shared();
        let result = (|| {
            let mut item = item;
            loop {
                self.check_write_fault()?;
                match shared.transfer_tx.try_send(item) {
                    Ok(()) => return Ok(()),
                    Err(TrySendError::Full(rejected)) => item = rejected,
                    Err(TrySendError::Disconnected(_)) => {
                        return Err(io::Error::other("transfer queue disconnected"))
                    }
                }
                interruptible_recv(&shared.avail_rx)?;
            }
        })();
        let _ = shared.avail_tx.try_send(());
        result
    }

    /// Accept a single byte. Blocks only while the transfer queue is full.
    pub fn write_byte(&self, byte: u8) -> io::Result<()> {
        self.submit(Transfer::Byte(byte))
    }

    fn write_internal(&self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.write_byte(byte)?;
        }
        Ok(buf.len())
    }

    fn flush_internal(&self) -> io::Result<()>
    where
        W: Write,
    {
        let shared = self.shared();
        let _guard = shared
            .flush_lock
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;

        if shared.closed.load(Ordering::Acquire) {
            return Err(stream_closed_error());
        }

        // Drop stale responses from an earlier failed flush.
        while shared.flush_rx.try_recv().is_ok() {}

        self.submit(Transfer::Flush)?;

        loop {
            self.check_write_fault()?;
            match interruptible_recv(&shared.flush_rx)? {
                FlushSignal::Failed(error) => return Err(self.raise_sticky(&error)),
                FlushSignal::Poke => continue,
                FlushSignal::Done => {
                    // Everything reached the sink; flush it on this thread.
                    shared
                        .sink
                        .lock()
                        .map_err(|e| io::Error::other(e.to_string()))?
                        .flush()?;
                    return Ok(());
                }
            }
        }
    }

    /// Flush accepted bytes through to the underlying sink, then close the
    /// stream and the sink. Idempotent; subsequent writes and flushes fail
    /// with the fixed closed-stream error.
    pub fn close(&self) -> io::Result<()>
    where
        W: ByteSink,
    {
        let shared = self.shared();
        let _guard = shared
            .close_lock
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;

        if shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        self.flush_internal()?;
        self.submit(Transfer::Exit)?;
        shared.closed.store(true, Ordering::Release);

        shared
            .sink
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?
            .close_sink()
    }

    /// Run `body` with the underlying sink locked. Lets tests inspect what
    /// actually reached the sink.
    pub fn with_sink<R>(&self, body: impl FnOnce(&mut W) -> R) -> R {
        let mut sink = self
            .shared()
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        body(&mut sink)
    }
}

impl<W: ByteSink> Write for RevivableWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_internal(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_internal()
    }
}

/// Worker: drains the transfer queue into the sink, batching consecutive
/// bytes and honouring embedded control markers.
fn worker_loop<W: ByteSink>(shared: &WriterShared<W>) {
    let mut batch = Vec::with_capacity(shared.batch_size);

    let failure = 'outer: loop {
        // There might be space now that the worker is about to take items.
        let _ = shared.avail_tx.try_send(());
        batch.clear();

        loop {
            let item = if batch.is_empty() {
                match shared.transfer_rx.recv_timeout(WORKER_SHUTDOWN_POLL) {
                    Ok(item) => Some(item),
                    Err(RecvTimeoutError::Timeout) => {
                        if shared.shutdown.load(Ordering::Acquire) {
                            trace!("revivable writer worker shut down");
                            return;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            } else {
                match shared.transfer_rx.try_recv() {
                    Ok(item) => Some(item),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => None,
                }
            };

            match item {
                None => {
                    // Nothing else queued; deliver what we have.
                    if let Err(e) = write_batch(shared, &batch) {
                        break 'outer e;
                    }
                    break;
                }
                Some(Transfer::Byte(byte)) => {
                    batch.push(byte);
                    if batch.len() == shared.batch_size {
                        if let Err(e) = write_batch(shared, &batch) {
                            break 'outer e;
                        }
                        break;
                    }
                }
                Some(Transfer::Flush) => {
                    // Ordered: the batch goes out before the confirmation.
                    if let Err(e) = write_batch(shared, &batch) {
                        break 'outer e;
                    }
                    let _ = shared.flush_tx.try_send(FlushSignal::Done);
                    break;
                }
                Some(Transfer::Exit) => {
                    if let Err(e) = write_batch(shared, &batch) {
                        break 'outer e;
                    }
                    trace!("revivable writer worker exit");
                    return;
                }
            }
        }
    };

    // Terminal sink failure: record it, fail any waiting flush, and release
    // a potentially blocked producer. Untransmitted batch bytes are lost;
    // the stream is dead from here.
    trace!("revivable writer worker failed: {failure}");
    let error = Arc::new(failure);
    if let Ok(mut slot) = shared.transfer_error.lock() {
        *slot = Some(error.clone());
    }
    let _ = shared.flush_tx.try_send(FlushSignal::Failed(error));
    let _ = shared.avail_tx.try_send(());
}

fn write_batch<W: ByteSink>(shared: &WriterShared<W>, batch: &[u8]) -> io::Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    shared
        .sink
        .lock()
        .map_err(|e| io::Error::other(e.to_string()))?
        .write_all(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{STREAM_CLOSED_MSG, STREAM_KILLED_MSG};
    use crate::stream::killable_byte_pipe;
    use crate::task::{is_decorated, spawn_async};
    use std::io::Read;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn writer_over_vec(buffer_size: usize) -> RevivableWriter<Vec<u8>> {
        RevivableWriter::new(Vec::new(), buffer_size)
    }

    // --- delivery and flushing ---

    #[test]
    fn flush_delivers_accepted_bytes_in_order() {
        let mut writer = writer_over_vec(4);
        writer.write_all(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        writer.flush().unwrap();

        writer.with_sink(|sink| assert_eq!(sink, &[1, 2, 3, 4, 5, 6, 7]));
    }

    #[test]
    fn close_flushes_then_rejects_operations() {
        let mut writer = writer_over_vec(8);
        writer.write_all(b"tail").unwrap();
        writer.close().unwrap();
        writer.with_sink(|sink| assert_eq!(sink, b"tail"));

        // Idempotent.
        writer.close().unwrap();

        let err = writer.write(&[1]).unwrap_err();
        assert!(err.to_string().contains(STREAM_CLOSED_MSG));
        let err = writer.flush().unwrap_err();
        assert!(err.to_string().contains(STREAM_CLOSED_MSG));
    }

    #[test]
    fn concurrent_flushes_each_observe_completion() {
        let writer = writer_over_vec(64);
        let mut tasks = Vec::new();
        for i in 0..4u8 {
            let mut handle = writer.clone();
            tasks.push(spawn_async(move || {
                handle.write_all(&[i]).unwrap();
                handle.flush().map(|()| true)
            }));
        }
        for task in tasks {
            assert!(task.result(Duration::from_secs(5)).unwrap().unwrap());
        }
        writer.with_sink(|sink| {
            let mut bytes = sink.clone();
            bytes.sort_unstable();
            assert_eq!(bytes, vec![0, 1, 2, 3]);
        });
    }

    // --- kill / resurrect ---

    #[test]
    fn killed_write_raises_fixed_error() {
        let writer = writer_over_vec(8);
        writer.kill();
        let err = writer.write_byte(1).unwrap_err();
        assert!(err.to_string().contains(STREAM_KILLED_MSG));

        writer.resurrect();
        writer.write_byte(1).unwrap();
    }

    #[test]
    fn kill_with_exception_is_sticky_and_replaceable() {
        let writer = writer_over_vec(8);
        writer.kill_with(io::Error::new(io::ErrorKind::TimedOut, "first"));

        for _ in 0..3 {
            let err = writer.write_byte(0).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::TimedOut);
            assert!(err.to_string().contains("first"));
        }

        writer.kill_with(io::Error::other("second"));
        assert!(writer.write_byte(0).unwrap_err().to_string().contains("second"));

        writer.revive();
        writer.write_byte(0).unwrap();
    }

    #[test]
    fn kill_overrides_queued_exception_until_resurrect() {
        let writer = writer_over_vec(8);
        writer.queue_write_exception(io::Error::other("queued"));
        writer.kill();

        for _ in 0..3 {
            let err = writer.write_byte(0).unwrap_err();
            assert!(err.to_string().contains(STREAM_KILLED_MSG));
        }

        writer.resurrect();
        assert!(writer.write_byte(0).unwrap_err().to_string().contains("queued"));
        writer.write_byte(0).unwrap();
    }

    #[test]
    fn queued_exceptions_fire_in_order_once_each() {
        let writer = writer_over_vec(8);
        writer.queue_write_exception(io::Error::new(io::ErrorKind::NotFound, "one"));
        writer.queue_write_exception(io::Error::new(io::ErrorKind::TimedOut, "two"));

        assert_eq!(writer.write_byte(0).unwrap_err().kind(), io::ErrorKind::NotFound);
        assert_eq!(writer.write_byte(0).unwrap_err().kind(), io::ErrorKind::TimedOut);
        writer.write_byte(0).unwrap();
    }

    #[test]
    fn kill_releases_producer_blocked_on_full_queue() {
        let (reader, writer) = killable_byte_pipe(2);
        // Saturate queue, batch and pipe so the next write must block.
        let control = writer.clone();
        let task = spawn_async(move || {
            let mut writer = writer;
            writer.write_all(&vec![0u8; 64]).map(|()| true)
        });

        std::thread::sleep(Duration::from_millis(200));
        assert!(!task.is_finished(), "producer should be blocked");

        control.kill_with(io::Error::new(io::ErrorKind::TimedOut, "intentional"));
        let result = task.result(Duration::from_secs(5)).unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(reader);
    }

    // --- flush under faults ---

    #[test]
    fn flush_blocked_by_slow_reader_fails_on_kill() {
        let (reader, writer) = killable_byte_pipe(4);
        let control = writer.clone();
        let entered_flush = Arc::new(AtomicBool::new(false));
        let flush_finished = Arc::new(AtomicBool::new(false));
        let entered_flag = entered_flush.clone();
        let finished_flag = flush_finished.clone();

        let producer = spawn_async(move || {
            let mut writer = writer;
            writer.write_all(&(0..23).collect::<Vec<u8>>())?;
            entered_flag.store(true, Ordering::Release);
            writer.flush()?;
            finished_flag.store(true, Ordering::Release);
            Ok::<(), io::Error>(())
        });

        // Drain slowly until the writer has entered flush(); the flush
        // marker is then stuck behind bytes the reader has not consumed.
        let mut reader = reader;
        let mut consumed = 0u8;
        while !entered_flush.load(Ordering::Acquire) {
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).unwrap();
            assert_eq!(byte[0], consumed);
            consumed += 1;
            assert!(consumed < 23, "flush must start before the data drains");
            std::thread::sleep(Duration::from_millis(100));
        }

        control.kill_with(io::Error::new(io::ErrorKind::TimedOut, "intentional"));

        let result = producer.result(Duration::from_secs(5)).unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(err.to_string().contains("intentional"));
        assert!(!flush_finished.load(Ordering::Acquire));
    }

    #[test]
    fn sink_failure_is_terminal() {
        struct FailingSink {
            wrote: usize,
        }
        impl Write for FailingSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.wrote += buf.len();
                if self.wrote > 2 {
                    Err(io::Error::other("sink broke"))
                } else {
                    Ok(buf.len())
                }
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        impl ByteSink for FailingSink {}

        let mut writer = RevivableWriter::new(FailingSink { wrote: 0 }, 2);
        // Push bytes until the worker hits the sink failure; flush surfaces it.
        let _ = writer.write_all(&[1, 2, 3, 4]);
        let err = writer.flush().unwrap_err();
        assert!(err.to_string().contains("sink broke"));

        // Sticky from now on.
        let err = writer.write_byte(9).unwrap_err();
        assert!(err.to_string().contains("sink broke"));
    }

    // --- decoration ---

    #[test]
    fn injected_errors_are_decorated_by_default() {
        let writer = writer_over_vec(8);
        writer.queue_write_exception(io::Error::new(io::ErrorKind::NotFound, "intentional"));
        let err = writer.write_byte(0).unwrap_err();
        assert!(is_decorated(&err));
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn decoration_can_be_disabled() {
        let writer = writer_over_vec(8);
        writer.set_decorate_exceptions(false);
        writer.queue_write_exception(io::Error::new(io::ErrorKind::NotFound, "plain"));
        let err = writer.write_byte(0).unwrap_err();
        assert!(!is_decorated(&err));
        assert_eq!(err.to_string(), "plain");
    }

    // --- interrupts ---

    #[test]
    fn interrupt_releases_blocked_write() {
        let (_reader, writer) = killable_byte_pipe(2);
        let task = spawn_async(move || {
            let mut writer = writer;
            writer.write_all(&vec![0u8; 64])
        });

        std::thread::sleep(Duration::from_millis(200));
        task.interrupt();
        let result = task.result(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn interrupt_releases_blocked_flush() {
        let (_reader, writer) = killable_byte_pipe(2);
        let mut fill = writer.clone();
        // Fill downstream so the flush marker cannot be confirmed quickly.
        fill.write_all(&[0u8; 6]).unwrap();

        let task = spawn_async(move || {
            let mut writer = writer;
            writer.flush()
        });

        std::thread::sleep(Duration::from_millis(200));
        task.interrupt();
        let start = Instant::now();
        let result = task.result(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
