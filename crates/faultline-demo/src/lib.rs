//! Faultline demo — a trivial socket-using service and its mock-based tests
//!
//! [`PingClient`] is the kind of code faultline exists to test: it opens a
//! socket, writes a line, and expects an acknowledgement back. The client
//! is generic over a [`Connector`] so production code dials real TCP while
//! tests plug in [`MockConnector`] over a
//! [`MockSocketService`](faultline::socket::MockSocketService) and drive
//! both pipe directions plus the fault-injection controls.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

use faultline::socket::{MockSocketService, MockSocketStream};

/// Errors raised by [`PingClient`]
#[derive(Error, Debug)]
pub enum PingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Remote service sent a wrong answer: {0:?}")]
    UnexpectedResponse(String),
}

/// Opens a duplex byte stream to a remote endpoint.
pub trait Connector {
    type Stream: Read + Write;

    /// Connect to `host:port`, honouring the connect timeout and arranging
    /// for reads to give up after the read timeout.
    fn connect(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> io::Result<Self::Stream>;
}

/// Production connector dialing real TCP.
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> io::Result<TcpStream> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;
        let stream = if connect_timeout.is_zero() {
            TcpStream::connect(addr)?
        } else {
            TcpStream::connect_timeout(&addr, connect_timeout)?
        };
        if !read_timeout.is_zero() {
            stream.set_read_timeout(Some(read_timeout))?;
        }
        Ok(stream)
    }
}

/// Test connector producing mock sockets from a shared service.
pub struct MockConnector {
    service: MockSocketService,
}

impl MockConnector {
    pub fn new(service: MockSocketService) -> Self {
        Self { service }
    }
}

impl Connector for MockConnector {
    type Stream = MockSocketStream;

    fn connect(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> io::Result<MockSocketStream> {
        let socket = self.service.connect_socket_with_timeout(
            host,
            port,
            connect_timeout.as_millis() as u64,
        );
        socket.set_so_timeout(read_timeout.as_millis() as u64);
        Ok(socket.stream())
    }
}

/// Checks that a remote line-protocol service is alive: sends `PING`,
/// expects `ACK` back.
pub struct PingClient<C: Connector> {
    remote_addr: String,
    remote_port: u16,
    connect_timeout: Duration,
    /// Read timeout so that a check cannot hang indefinitely
    so_timeout: Duration,
    connector: C,
}

impl<C: Connector> PingClient<C> {
    pub fn new(
        remote_addr: impl Into<String>,
        remote_port: u16,
        connect_timeout: Duration,
        so_timeout: Duration,
        connector: C,
    ) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            remote_port,
            connect_timeout,
            so_timeout,
            connector,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Checks that the remote service is alive.
    pub fn check_remote_is_alive(&self) -> Result<(), PingError> {
        let mut stream = self.connector.connect(
            &self.remote_addr,
            self.remote_port,
            self.connect_timeout,
            self.so_timeout,
        )?;

        stream.write_all(b"PING\n")?;
        stream.flush()?;

        let response = read_line(&mut stream)?;
        if response != "ACK" {
            return Err(PingError::UnexpectedResponse(response));
        }
        Ok(())
    }
}

/// Read one `\n`-terminated line, without the terminator. EOF before the
/// terminator yields whatever was read.
fn read_line(stream: &mut impl Read) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte)? {
            0 => break,
            _ if byte[0] == b'\n' => break,
            _ => line.push(byte[0]),
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
