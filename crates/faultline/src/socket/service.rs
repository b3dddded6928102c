//! Mock socket service
//!
//! Creates mock sockets on demand and tracks every connected surrogate in a
//! live registry the test can inspect, drain or block on. Typical use:
//! hand the service (or a connector built over it) to the code under test,
//! let it "connect", then fetch the surrogate here and drive both pipe
//! directions plus the fault-injection controls.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::timing::INTERRUPT_POLL;
use crate::error::{MockSocketServiceError, ServiceResult};
use crate::task::take_interrupt;

use super::{MockSocket, MockSocketData};

struct RegistryInner {
    deque: Mutex<VecDeque<MockSocketData>>,
    available: Condvar,
}

/// Live, shared view of the connected-socket registry. Clones alias one
/// registry; mutations through any clone are visible everywhere.
#[derive(Clone)]
pub struct SocketRegistry {
    inner: Arc<RegistryInner>,
}

impl SocketRegistry {
    fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                deque: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.deque.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decoupled copy of the registry contents in insertion order.
    pub fn snapshot(&self) -> Vec<MockSocketData> {
        self.inner
            .deque
            .lock()
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn push_back(&self, data: MockSocketData) {
        if let Ok(mut deque) = self.inner.deque.lock() {
            deque.push_back(data);
        }
        self.inner.available.notify_all();
    }

    pub(crate) fn poll_front(&self) -> Option<MockSocketData> {
        self.inner
            .deque
            .lock()
            .ok()
            .and_then(|mut d| d.pop_front())
    }

    pub(crate) fn last(&self) -> Option<MockSocketData> {
        self.inner
            .deque
            .lock()
            .ok()
            .and_then(|d| d.back().cloned())
    }

    /// Blocking pop with a deadline. Observes the calling thread's
    /// interrupt flag.
    pub(crate) fn poll_front_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<MockSocketData>, MockSocketServiceError> {
        let deadline = Instant::now() + timeout;
        let mut deque = self
            .inner
            .deque
            .lock()
            .map_err(|_| MockSocketServiceError::WaitInterrupted)?;
        loop {
            if let Some(front) = deque.pop_front() {
                return Ok(Some(front));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if take_interrupt() {
                return Err(MockSocketServiceError::WaitInterrupted);
            }
            let wait = (deadline - now).min(INTERRUPT_POLL);
            deque = self
                .inner
                .available
                .wait_timeout(deque, wait)
                .map_err(|_| MockSocketServiceError::WaitInterrupted)?
                .0;
        }
    }
}

/// Service for creating and tracking mock sockets. Clones share one
/// registry, so the code under test can hold one clone while the test
/// drives another.
#[derive(Clone)]
pub struct MockSocketService {
    /// Buffer size for the pipes behind each socket's streams
    buffer_size: usize,
    registry: SocketRegistry,
}

impl MockSocketService {
    /// Create a service whose sockets buffer `buffer_size` bytes per pipe.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            registry: SocketRegistry::new(),
        }
    }

    /// Create and "connect" a mock socket with a zero connect timeout.
    pub fn connect_socket(&self, host: &str, port: u16) -> MockSocket {
        self.connect_socket_with_timeout(host, port, 0)
    }

    /// Create a mock socket, record the connect arguments on its facade for
    /// later verification, and append it to the registry.
    pub fn connect_socket_with_timeout(
        &self,
        host: &str,
        port: u16,
        connect_timeout_ms: u64,
    ) -> MockSocket {
        let data = MockSocketData::create_socket(self.buffer_size);
        let socket = data.socket();
        socket.connect(host, port, connect_timeout_ms);
        debug!(host, port, "mock socket connected");
        self.registry.push_back(data);
        socket
    }

    /// The live registry of connected sockets, in connection order.
    pub fn all_connected_socket_mocks(&self) -> SocketRegistry {
        self.registry.clone()
    }

    /// Decoupled copy of the registry in connection order.
    pub fn all_connected_socket_mocks_snapshot(&self) -> Vec<MockSocketData> {
        self.registry.snapshot()
    }

    /// Drain the registry, returning everything connected so far. The
    /// returned list is decoupled from later connects.
    pub fn take_all_connected_socket_mocks(&self) -> Vec<MockSocketData> {
        let mut drained = Vec::new();
        while let Some(next) = self.registry.poll_front() {
            drained.push(next);
        }
        drained
    }

    /// The most recently connected socket mock.
    pub fn last_connected_socket_mock(&self) -> ServiceResult<MockSocketData> {
        self.registry
            .last()
            .ok_or(MockSocketServiceError::NoConnectedSockets)
    }

    /// The only connected socket mock, left in the registry.
    pub fn the_only_connected_socket_mock(&self) -> ServiceResult<MockSocketData> {
        let snapshot = self.registry.snapshot();
        if snapshot.len() > 1 {
            return Err(MockSocketServiceError::WrongSocketCount {
                count: snapshot.len(),
                expectation: "exactly one".to_string(),
            });
        }
        snapshot
            .into_iter()
            .next()
            .ok_or(MockSocketServiceError::NoConnectedSockets)
    }

    /// Remove and return the only connected socket mock. Fails if there
    /// were none, or if more remain after removing one.
    pub fn take_the_only_connected_socket_mock(&self) -> ServiceResult<MockSocketData> {
        let front = self
            .registry
            .poll_front()
            .ok_or(MockSocketServiceError::NoConnectedSockets)?;

        let remaining = self.registry.len();
        if remaining > 0 {
            return Err(MockSocketServiceError::WrongSocketCount {
                count: 1 + remaining,
                expectation: "exactly one".to_string(),
            });
        }
        Ok(front)
    }

    /// Remove and return the only connected socket mock, waiting up to
    /// `timeout_ms` for one to connect. Fails upfront if more than one is
    /// already connected.
    pub fn wait_for_and_take_the_only_connected_socket_mock(
        &self,
        timeout_ms: u64,
    ) -> ServiceResult<MockSocketData> {
        let size = self.registry.len();
        if size > 1 {
            return Err(MockSocketServiceError::WrongSocketCount {
                count: size,
                expectation: "one or none (yet)".to_string(),
            });
        }

        match self
            .registry
            .poll_front_timeout(Duration::from_millis(timeout_ms))?
        {
            Some(data) => Ok(data),
            None => Err(MockSocketServiceError::WaitTimeout(timeout_ms)),
        }
    }

    /// Asserts the registry is empty.
    ///
    /// # Panics
    ///
    /// Panics with the connected count when any socket mocks remain.
    pub fn assert_no_connected_socket_mocks(&self) {
        let size = self.registry.len();
        assert!(
            size == 0,
            "There are {} connected socket mocks instead of none",
            size
        );
    }
}
