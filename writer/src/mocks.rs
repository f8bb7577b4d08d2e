//! Mock implementations for testing.

use std::{
    io::{self, IoSlice},
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex},
};

#[derive(Default)]
struct State {
    written: Vec<u8>,
    discard: bool,
    capacity: Option<usize>,
    writes: usize,
    destinations: Vec<Option<SocketAddr>>,
    fail_writes: Option<io::ErrorKind>,
    fail_readiness: bool,
    readiness_requests: usize,
    send_buffer_size: Option<usize>,
    shutdown: bool,
}

#[derive(Default)]
struct Gate {
    paused: bool,
    waiting: usize,
}

/// An in-memory [crate::Socket].
///
/// Clones share the same state, so a test can keep a handle to a socket owned
/// by a connection. The socket accepts everything by default. A capacity can
/// be set to simulate a full send buffer, in which case writes beyond it are
/// rejected with [io::ErrorKind::WouldBlock].
#[derive(Clone, Default)]
pub struct Socket {
    state: Arc<Mutex<State>>,
    gate: Arc<(Mutex<Gate>, Condvar)>,
}

impl Socket {
    /// Create a socket that accepts everything without keeping a copy.
    pub fn sink() -> Self {
        let socket = Self::default();
        socket.state.lock().unwrap().discard = true;
        socket
    }

    /// Create a socket that accepts `capacity` bytes before blocking.
    pub fn with_capacity(capacity: usize) -> Self {
        let socket = Self::default();
        socket.set_capacity(Some(capacity));
        socket
    }

    /// Set the number of bytes accepted before blocking (`None` for no limit).
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.state.lock().unwrap().capacity = capacity;
    }

    /// Accept `bytes` more bytes.
    pub fn add_capacity(&self, bytes: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(capacity) = state.capacity.as_mut() {
            *capacity += bytes;
        }
    }

    /// Report `size` as the kernel send buffer size.
    pub fn set_send_buffer_size(&self, size: Option<usize>) {
        self.state.lock().unwrap().send_buffer_size = size;
    }

    /// Fail every subsequent write with an error of `kind` (`None` to stop).
    pub fn fail_writes(&self, kind: Option<io::ErrorKind>) {
        self.state.lock().unwrap().fail_writes = kind;
    }

    /// Fail subsequent readiness requests.
    pub fn fail_readiness(&self, fail: bool) {
        self.state.lock().unwrap().fail_readiness = fail;
    }

    /// Bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    /// Number of successful write calls.
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Destination of every successful write call, in order.
    pub fn destinations(&self) -> Vec<Option<SocketAddr>> {
        self.state.lock().unwrap().destinations.clone()
    }

    /// Number of times readiness was requested.
    pub fn readiness_requests(&self) -> usize {
        self.state.lock().unwrap().readiness_requests
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    /// Hold every subsequent write until [Socket::resume] is called.
    pub fn pause(&self) {
        self.gate.0.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        let (gate, resumed) = &*self.gate;
        gate.lock().unwrap().paused = false;
        resumed.notify_all();
    }

    /// Number of writes currently held by [Socket::pause].
    pub fn paused_writes(&self) -> usize {
        self.gate.0.lock().unwrap().waiting
    }

    fn wait_while_paused(&self) {
        let (gate, resumed) = &*self.gate;
        let mut gate = gate.lock().unwrap();
        gate.waiting += 1;
        while gate.paused {
            gate = resumed.wait(gate).unwrap();
        }
        gate.waiting -= 1;
    }
}

impl crate::Socket for Socket {
    fn write_vectored(
        &self,
        destination: Option<SocketAddr>,
        bufs: &[IoSlice<'_>],
    ) -> io::Result<usize> {
        self.wait_while_paused();
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.fail_writes {
            return Err(io::Error::new(kind, "injected write failure"));
        }
        let allowed = state.capacity.unwrap_or(usize::MAX);
        if allowed == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut written = 0;
        for buf in bufs {
            let take = buf.len().min(allowed - written);
            if !state.discard {
                state.written.extend_from_slice(&buf[..take]);
            }
            written += take;
            if written == allowed {
                break;
            }
        }
        if let Some(capacity) = state.capacity.as_mut() {
            *capacity -= written;
        }
        state.writes += 1;
        state.destinations.push(destination);
        Ok(written)
    }

    fn request_writable(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_readiness {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "injected readiness failure",
            ));
        }
        state.readiness_requests += 1;
        Ok(())
    }

    fn send_buffer_size(&self) -> Option<usize> {
        self.state.lock().unwrap().send_buffer_size
    }

    fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
    }
}
