//! Faultline — controllable stream and socket doubles for testing blocking I/O
//!
//! Production I/O code is hard to test because real sockets and streams
//! cannot be made to fail on demand or be interrupted at chosen points.
//! Faultline supplies revivable stream wrappers (kill, resurrect, queued
//! exceptions), killable in-memory byte pipes built from them, and a mock
//! socket service that composes the pipes into surrogate sockets the code
//! under test consumes unchanged.
//!
//! ## Quick start
//!
//! ```no_run
//! use faultline::socket::MockSocketService;
//! use faultline::stream::killable_byte_pipe;
//!
//! let service = MockSocketService::new(1024);
//! let (reader, writer) = killable_byte_pipe(1024);
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod pipe;
pub mod socket;
pub mod stream;
pub mod task;

pub use codec::{CompressedBlockReader, CompressedBlockWriter};
pub use error::{MockSocketServiceError, TaskError, STREAM_CLOSED_MSG, STREAM_KILLED_MSG};
pub use socket::{MockSocket, MockSocketData, MockSocketService, MOCK_SOCKET_ADDR};
pub use stream::{killable_byte_pipe, RevivableReader, RevivableWriter};
pub use task::{run_with_time_limit, spawn_async, AsyncTask, DECORATION_MARKER};
