use crate::{
    queue::{Kind, TaskQueue},
    Limit, Message, Record, Socket,
};
use sluice_buffer::Buffer;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        OnceLock,
    },
};
use tracing::debug;

/// Source of connection identifiers.
static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(0);

/// Why a [Connection] was closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side.
    Local,
    /// Closed by the peer.
    Remote,
    /// Closed after an unrecoverable error.
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::Remote => write!(f, "closed by peer"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A socket together with its outbound write queue.
pub struct Connection<S: Socket, M: Message = Buffer> {
    id: u64,
    socket: S,
    queue: Box<dyn TaskQueue<Box<Record<M>>>>,
    open: AtomicBool,
    reason: OnceLock<CloseReason>,
    limit: Option<Limit>,
}

impl<S: Socket, M: Message> fmt::Debug for Connection<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("pending_bytes", &self.pending_bytes())
            .field("queued", &self.queued())
            .finish()
    }
}

impl<S: Socket, M: Message> Connection<S, M> {
    /// Create an open connection writing to `socket` through a queue of the
    /// given kind.
    pub fn new(socket: S, kind: Kind) -> Self {
        Self {
            id: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
            socket,
            queue: kind.create(),
            open: AtomicBool::new(true),
            reason: OnceLock::new(),
            limit: None,
        }
    }

    /// Override the writer's queue limit for this connection.
    pub fn with_limit(mut self, limit: Limit) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Per-connection queue limit, if overridden.
    pub fn limit(&self) -> Option<Limit> {
        self.limit
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Reason the connection was closed, if it is closed.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.reason.get()
    }

    /// Bytes reserved by writes that have not been flushed yet.
    pub fn pending_bytes(&self) -> usize {
        self.queue.space_in_bytes()
    }

    /// Number of writes waiting in the queue (excluding one in progress).
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn queue(&self) -> &dyn TaskQueue<Box<Record<M>>> {
        self.queue.as_ref()
    }

    /// Close the connection without failing pending writes.
    ///
    /// Returns `false` if the connection was already closed. Pending writes are
    /// failed by [crate::AsyncQueueWriter::on_close].
    pub fn close_silently(&self) -> bool {
        self.close(CloseReason::Local)
    }

    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        // The first reason recorded wins
        let _ = self.reason.set(reason);
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        debug!(connection = self.id, reason = ?self.reason.get(), "closing connection");
        self.socket.shutdown();
        true
    }
}
