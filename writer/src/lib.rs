//! Per-connection asynchronous write queues.
//!
//! # Overview
//!
//! [AsyncQueueWriter] moves messages from any number of producer threads to a
//! non-blocking [Socket]. Each [Connection] owns a [queue::TaskQueue] that
//! tracks the bytes reserved by every message not yet written:
//!
//! - A write against an idle connection (nothing reserved) is written straight
//!   to the socket on the caller's thread.
//! - A write that finds other data in flight is queued. The queue is drained by
//!   [AsyncQueueWriter::on_ready], which the event loop calls once the socket
//!   reports that it can accept more data.
//! - A partially written message is parked as the queue's current element and
//!   [Socket::request_writable] is called so the event loop resumes it later.
//!
//! Completion handlers may issue further writes. Nested writes on the same
//! thread are bounded by [Config::max_write_reentrants]; deeper writes are
//! deferred to the event loop instead of recursing.
//!
//! Producers learn about backpressure through [AsyncQueueWriter::can_write] and
//! [AsyncQueueWriter::notify_write_possible], or by supplying a [PushBack]
//! handler that gets the message back when the queue is over its limit.
//!
//! # Example
//!
//! ```
//! use prometheus_client::registry::Registry;
//! use sluice_buffer::Buffer;
//! use sluice_writer::{mocks, AsyncQueueWriter, Config};
//!
//! let writer = AsyncQueueWriter::new(Config::default(), &mut Registry::default());
//! let connection = writer.connect(mocks::Socket::default());
//! let completion = writer.write_future(&connection, None, Buffer::copy_from_slice(b"hello"));
//! assert_eq!(completion.wait().unwrap().written, 5);
//! assert_eq!(connection.socket().written(), b"hello");
//! ```

mod config;
pub use config::{Config, Limit};
mod connection;
pub use connection::{CloseReason, Connection};
mod message;
pub use message::Message;
pub mod mocks;
pub mod queue;
mod record;
pub use record::{PushBack, Record};
mod reentrant;
mod socket;
pub use socket::Socket;
mod writer;
pub use writer::AsyncQueueWriter;

use sluice_utils::future::Handler;
use std::{io, net::SocketAddr, sync::Arc};
use thiserror::Error;

/// Errors reported to write handlers and queue monitors.
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("connection closed: {0}")]
    Closed(CloseReason),
    #[error("write failed: {0}")]
    WriteFailed(Arc<io::Error>),
    #[error("queue limit exceeded: {pending} bytes pending (limit {limit})")]
    QueueLimitExceeded { pending: usize, limit: usize },
    #[error("readiness request failed: {0}")]
    ReadinessFailed(Arc<io::Error>),
    #[error("allocation failed: {0}")]
    Allocation(#[from] sluice_buffer::Error),
}

/// Outcome of [AsyncQueueWriter::on_ready].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    /// Nothing is left to write. Write interest can be withdrawn.
    Complete,
    /// The socket stopped accepting data before the queue was drained.
    HasMore,
    /// The queue is empty but a producer has reserved space and is about to
    /// enqueue. Write interest should be kept.
    ExpectingMore,
}

/// Result delivered to a [WriteHandler] once a message is fully written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    /// Bytes written to the socket for this message.
    pub written: usize,
    /// Destination the message was sent to, if any.
    pub destination: Option<SocketAddr>,
}

/// Callback notified when a write completes or fails.
///
/// Any `FnOnce(Result<WriteResult, Error>)` closure is a [WriteHandler], as is
/// a [sluice_utils::future::Promise].
pub type WriteHandler = Box<dyn Handler<WriteResult, Error>>;
