//! Revivable stream wrappers
//!
//! Wraps blocking byte sources/sinks with out-of-band controls: a blocked
//! read or write can be aborted (`kill`) and later resumed
//! (`resurrect`/`revive`) without closing the underlying resource, and
//! arbitrary I/O errors can be injected at chosen points
//! (`kill_with`, `queue_*_exception`). Each wrapper runs the actual
//! blocking I/O on a dedicated worker thread so the calling thread can
//! always be released.

use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::pipe::{pipe, PipeReader, PipeWriter};

pub mod reader;
pub mod writer;

pub use reader::RevivableReader;
pub use writer::RevivableWriter;

/// Counter disambiguating worker thread names across all streams.
pub(crate) static WORKER_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A blocking byte source a [`RevivableReader`] can wrap.
pub trait ByteSource: Read + Send {
    /// Bytes that can be read without blocking. Zero when unknown.
    fn ready_bytes(&self) -> usize {
        0
    }

    /// Handle that can close the source from another thread, unblocking a
    /// worker stuck in a blocking read. None when the source cannot be
    /// closed out-of-band.
    fn closer(&self) -> Option<SourceCloser> {
        None
    }
}

/// A blocking byte sink a [`RevivableWriter`] can wrap.
pub trait ByteSink: Write + Send {
    /// Close the sink permanently. The default only flushes.
    fn close_sink(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Closes a [`ByteSource`] out-of-band, from any thread.
pub struct SourceCloser(Arc<dyn Fn() + Send + Sync>);

impl SourceCloser {
    pub fn new(close: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(close))
    }

    pub(crate) fn close(&self) {
        (self.0)();
    }
}

impl ByteSource for PipeReader {
    fn ready_bytes(&self) -> usize {
        PipeReader::ready_bytes(self)
    }

    fn closer(&self) -> Option<SourceCloser> {
        let handle = self.close_handle();
        Some(SourceCloser::new(move || handle.close()))
    }
}

impl<T: AsRef<[u8]> + Send> ByteSource for Cursor<T> {
    fn ready_bytes(&self) -> usize {
        let len = self.get_ref().as_ref().len() as u64;
        len.saturating_sub(self.position()) as usize
    }
}

impl ByteSink for PipeWriter {
    fn close_sink(&mut self) -> io::Result<()> {
        PipeWriter::close(self);
        Ok(())
    }
}

impl ByteSink for Vec<u8> {}

impl ByteSink for io::Sink {}

/// Create a killable byte pipe: a bounded in-memory byte channel whose two
/// ends are wrapped in revivable streams.
///
/// `buffer_size` bounds each internal buffer. There are two endpoint batch
/// buffers plus the pipe itself, so the data actually "in the pipes" can be
/// roughly three times this size.
pub fn killable_byte_pipe(
    buffer_size: usize,
) -> (RevivableReader<PipeReader>, RevivableWriter<PipeWriter>) {
    let (pipe_reader, pipe_writer) = pipe(buffer_size);
    (
        RevivableReader::new(pipe_reader),
        RevivableWriter::new(pipe_writer, buffer_size),
    )
}
