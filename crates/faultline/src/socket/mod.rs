//! Mock sockets
//!
//! A surrogate socket backed by two killable byte pipes, presenting the
//! minimal surface socket-using code consumes (`connect`, input/output
//! streams, peer address, read timeout, close) while recording every call
//! for later verification. The test side holds the far ends of both pipes
//! plus control handles for injecting faults into the streams the code
//! under test is using.

use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::pipe::{PipeReader, PipeWriter};
use crate::stream::{killable_byte_pipe, RevivableReader, RevivableWriter};

pub mod service;

pub use service::{MockSocketService, SocketRegistry};

/// Peer address every mock socket reports.
pub const MOCK_SOCKET_ADDR: Ipv4Addr = Ipv4Addr::new(98, 76, 54, 32);

/// One recorded `connect` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
}

struct MockSocketState {
    /// Stream returned from `input_stream` (the code under test reads it)
    input: RevivableReader<PipeReader>,
    /// Stream returned from `output_stream` (the code under test writes it)
    output: RevivableWriter<PipeWriter>,
    connect_calls: Mutex<Vec<ConnectCall>>,
    so_timeout_ms: Mutex<Option<u64>>,
    closed: AtomicBool,
}

/// Surrogate socket handed to the code under test. Cheap to clone; clones
/// alias one socket.
#[derive(Clone)]
pub struct MockSocket {
    state: Arc<MockSocketState>,
}

impl MockSocket {
    fn new(input: RevivableReader<PipeReader>, output: RevivableWriter<PipeWriter>) -> Self {
        Self {
            state: Arc::new(MockSocketState {
                input,
                output,
                connect_calls: Mutex::new(Vec::new()),
                so_timeout_ms: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Record a connect attempt. Never blocks, never fails; the arguments
    /// are kept for later verification via [`connect_calls`](Self::connect_calls).
    pub fn connect(&self, host: &str, port: u16, timeout_ms: u64) {
        if let Ok(mut calls) = self.state.connect_calls.lock() {
            calls.push(ConnectCall {
                host: host.to_string(),
                port,
                timeout_ms,
            });
        }
    }

    /// The stream the code under test reads from.
    pub fn input_stream(&self) -> RevivableReader<PipeReader> {
        self.state.input.clone()
    }

    /// The stream the code under test writes to.
    pub fn output_stream(&self) -> RevivableWriter<PipeWriter> {
        self.state.output.clone()
    }

    /// Fixed peer address: [`MOCK_SOCKET_ADDR`].
    pub fn inet_address(&self) -> Ipv4Addr {
        MOCK_SOCKET_ADDR
    }

    /// Record a read-timeout setting.
    pub fn set_so_timeout(&self, timeout_ms: u64) {
        if let Ok(mut slot) = self.state.so_timeout_ms.lock() {
            *slot = Some(timeout_ms);
        }
    }

    /// The last recorded read-timeout setting, if any.
    pub fn so_timeout(&self) -> Option<u64> {
        self.state.so_timeout_ms.lock().ok().and_then(|slot| *slot)
    }

    /// Record the socket as closed. The streams stay usable; tests control
    /// stream lifecycle through the surrogate's control handles.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// All recorded connect invocations, in call order.
    pub fn connect_calls(&self) -> Vec<ConnectCall> {
        self.state
            .connect_calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// The most recent connect invocation.
    pub fn last_connect_call(&self) -> Option<ConnectCall> {
        self.state
            .connect_calls
            .lock()
            .ok()
            .and_then(|calls| calls.last().cloned())
    }

    /// Duplex view over the socket's two streams, for code that wants one
    /// `Read + Write` object.
    pub fn stream(&self) -> MockSocketStream {
        MockSocketStream {
            input: self.input_stream(),
            output: self.output_stream(),
        }
    }
}

/// Combined `Read + Write` view over a mock socket's streams.
pub struct MockSocketStream {
    input: RevivableReader<PipeReader>,
    output: RevivableWriter<PipeWriter>,
}

impl Read for MockSocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for MockSocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

/// Everything relevant to one mock socket: the surrogate handed to the code
/// under test, the test-side far ends of both pipes, and control handles
/// over the exact stream objects the surrogate returns.
#[derive(Clone)]
pub struct MockSocketData {
    socket: MockSocket,
    input: RevivableReader<PipeReader>,
    output: RevivableWriter<PipeWriter>,
    control_input: RevivableReader<PipeReader>,
    control_output: RevivableWriter<PipeWriter>,
}

impl std::fmt::Debug for MockSocketData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSocketData").finish_non_exhaustive()
    }
}

impl MockSocketData {
    /// Create a mock socket backed by two killable byte pipes.
    ///
    /// `buffer_size` bounds each internal buffer; with two batch buffers
    /// per pipe plus in-flight data, roughly three times this many bytes
    /// fit "in the pipes" per direction.
    pub fn create_socket(buffer_size: usize) -> Self {
        // Ingress carries test -> SUT data, egress carries SUT -> test.
        let (ingress_reader, ingress_writer) = killable_byte_pipe(buffer_size);
        let (egress_reader, egress_writer) = killable_byte_pipe(buffer_size);

        let socket = MockSocket::new(ingress_reader.clone(), egress_writer.clone());

        Self {
            socket,
            input: egress_reader,
            output: ingress_writer,
            control_input: ingress_reader,
            control_output: egress_writer,
        }
    }

    /// The surrogate socket for the code under test.
    pub fn socket(&self) -> MockSocket {
        self.socket.clone()
    }

    /// Test-side reader: yields whatever the code under test writes to the
    /// socket's output stream.
    pub fn input_stream(&self) -> RevivableReader<PipeReader> {
        self.input.clone()
    }

    /// Test-side writer: feeds whatever the code under test will read from
    /// the socket's input stream.
    pub fn output_stream(&self) -> RevivableWriter<PipeWriter> {
        self.output.clone()
    }

    /// Control over the stream the surrogate returns as its input stream;
    /// kill/queue-exception here interrupts reads the code under test is
    /// performing.
    pub fn control_for_socket_input(&self) -> RevivableReader<PipeReader> {
        self.control_input.clone()
    }

    /// Control over the stream the surrogate returns as its output stream.
    pub fn control_for_socket_output(&self) -> RevivableWriter<PipeWriter> {
        self.control_output.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    // --- wiring ---

    #[test]
    fn sut_writes_are_read_on_the_test_side() {
        let data = MockSocketData::create_socket(64);
        let mut sut_out = data.socket().output_stream();
        sut_out.write_all(b"from sut").unwrap();
        sut_out.flush().unwrap();

        let mut test_in = data.input_stream();
        let mut buf = [0u8; 8];
        test_in.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"from sut");
    }

    #[test]
    fn test_writes_are_read_by_the_sut() {
        let data = MockSocketData::create_socket(64);
        let mut test_out = data.output_stream();
        test_out.write_all(b"to sut").unwrap();
        test_out.flush().unwrap();

        let mut sut_in = data.socket().input_stream();
        let mut buf = [0u8; 6];
        sut_in.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"to sut");
    }

    #[test]
    fn control_input_aliases_the_sut_input_stream() {
        let data = MockSocketData::create_socket(64);
        data.control_for_socket_input().kill();

        let mut sut_in = data.socket().input_stream();
        assert_eq!(sut_in.read_byte().unwrap(), -1);

        data.control_for_socket_input().resurrect();
        let mut test_out = data.output_stream();
        test_out.write_all(&[7]).unwrap();
        test_out.flush().unwrap();
        assert_eq!(sut_in.read_byte().unwrap(), 7);
    }

    #[test]
    fn control_output_aliases_the_sut_output_stream() {
        let data = MockSocketData::create_socket(64);
        data.control_for_socket_output()
            .kill_with(io::Error::new(io::ErrorKind::TimedOut, "injected"));

        let mut sut_out = data.socket().output_stream();
        let err = sut_out.write(&[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    // --- facade recording ---

    #[test]
    fn facade_records_connect_and_so_timeout() {
        let data = MockSocketData::create_socket(16);
        let socket = data.socket();
        socket.connect("remote.example", 1234, 5000);
        socket.set_so_timeout(250);

        assert_eq!(
            socket.connect_calls(),
            vec![ConnectCall {
                host: "remote.example".to_string(),
                port: 1234,
                timeout_ms: 5000,
            }]
        );
        assert_eq!(socket.so_timeout(), Some(250));
        assert!(!socket.is_closed());
        socket.close();
        assert!(socket.is_closed());
    }

    #[test]
    fn inet_address_is_the_fixed_literal() {
        let data = MockSocketData::create_socket(16);
        assert_eq!(
            data.socket().inet_address(),
            Ipv4Addr::new(98, 76, 54, 32)
        );
    }

    #[test]
    fn duplex_stream_round_trip() {
        let data = MockSocketData::create_socket(64);
        let mut sut = data.socket().stream();
        sut.write_all(b"PING\n").unwrap();
        sut.flush().unwrap();

        let mut test_in = data.input_stream();
        let mut buf = [0u8; 5];
        test_in.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"PING\n");

        let mut test_out = data.output_stream();
        test_out.write_all(b"ACK\n").unwrap();
        test_out.flush().unwrap();

        let mut buf = [0u8; 4];
        sut.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ACK\n");
    }
}
