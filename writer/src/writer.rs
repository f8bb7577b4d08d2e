//! Move messages from producers to a non-blocking socket.
//!
//! A write reserves its size in the connection's queue before anything else.
//! The producer whose reservation brings the total up from zero owns the
//! connection until its message is fully written: it writes directly, and if
//! the socket does not take everything it parks the rest as the queue's current
//! element and asks the event loop for a readiness callback. Every other
//! producer appends to the FIFO, which [AsyncQueueWriter::on_ready] drains.
//!
//! A reservation is only released once its bytes have been written (or the
//! write has failed), so the total never drops to zero while anything is in
//! flight and at most one producer ever writes directly at a time.

use crate::{
    queue::{Kind, Monitor},
    record::RecordPool,
    reentrant::Reentrant,
    CloseReason, Config, Connection, Error, Limit, Message, PushBack, ReadyState, Record, Socket,
    WriteHandler, WriteResult,
};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use sluice_buffer::{Buffer, HeapMemoryManager, MemoryManager};
use sluice_utils::future::{promise, Completion, Handler};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{debug, trace};

/// Stored in place of [Limit::Auto].
const AUTO: usize = usize::MAX;
/// Stored in place of [Limit::Unlimited].
const UNLIMITED: usize = usize::MAX - 1;

fn encode_limit(limit: Limit) -> usize {
    match limit {
        Limit::Auto => AUTO,
        Limit::Unlimited => UNLIMITED,
        Limit::Bytes(bytes) => bytes.min(UNLIMITED - 1),
    }
}

fn decode_limit(encoded: usize) -> Limit {
    match encoded {
        AUTO => Limit::Auto,
        UNLIMITED => Limit::Unlimited,
        bytes => Limit::Bytes(bytes),
    }
}

/// Metrics for the writer.
struct Metrics {
    /// Writes performed on the producer's thread.
    direct_writes: Counter,
    /// Writes appended to a queue.
    queued_writes: Counter,
    /// Writes handed to the event loop because of nesting depth.
    deferred_writes: Counter,
    /// Messages fully written.
    completed: Counter,
    /// Messages that failed.
    failed: Counter,
    /// Messages handed back to their producer.
    pushed_back: Counter,
    /// Bytes written to sockets.
    bytes_written: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            direct_writes: Counter::default(),
            queued_writes: Counter::default(),
            deferred_writes: Counter::default(),
            completed: Counter::default(),
            failed: Counter::default(),
            pushed_back: Counter::default(),
            bytes_written: Counter::default(),
        };
        registry.register(
            "direct_writes",
            "Writes performed on the producer's thread",
            metrics.direct_writes.clone(),
        );
        registry.register(
            "queued_writes",
            "Writes appended to a connection queue",
            metrics.queued_writes.clone(),
        );
        registry.register(
            "deferred_writes",
            "Nested writes deferred to the event loop",
            metrics.deferred_writes.clone(),
        );
        registry.register(
            "completed",
            "Messages fully written",
            metrics.completed.clone(),
        );
        registry.register("failed", "Messages that failed", metrics.failed.clone());
        registry.register(
            "pushed_back",
            "Messages handed back because the queue was over its limit",
            metrics.pushed_back.clone(),
        );
        registry.register(
            "bytes_written",
            "Bytes written to sockets",
            metrics.bytes_written.clone(),
        );
        metrics
    }
}

/// Waits until a connection can accept `size` more bytes.
struct SpaceMonitor {
    size: usize,
    limit: usize,
    handler: Box<dyn Handler<(), Error>>,
}

impl Monitor for SpaceMonitor {
    fn should_notify(&self, reserved: usize) -> bool {
        fits(reserved, self.size, self.limit)
    }

    fn on_notify(self: Box<Self>) {
        self.handler.completed(());
    }

    fn on_error(self: Box<Self>, error: Error) {
        self.handler.failed(error);
    }
}

/// Returns whether `size` more bytes fit in a queue holding `reserved` bytes.
///
/// An empty queue accepts a message of any size.
fn fits(reserved: usize, size: usize, limit: usize) -> bool {
    reserved == 0 || reserved.saturating_add(size) <= limit
}

/// Writes messages of type `M` to any number of [Connection]s.
///
/// Settings can be changed at runtime and apply to subsequent writes.
pub struct AsyncQueueWriter<M: Message = Buffer> {
    max_pending: AtomicUsize,
    max_write_reentrants: AtomicUsize,
    direct_write: AtomicBool,
    queue: Kind,
    records: RecordPool<M>,
    manager: Arc<dyn MemoryManager>,
    metrics: Metrics,
}

impl<M: Message> AsyncQueueWriter<M> {
    /// Create a writer, registering its metrics (and those of its memory
    /// manager, under the `memory` prefix) with `registry`.
    pub fn new(config: Config, registry: &mut Registry) -> Self {
        let manager = HeapMemoryManager::new(
            config.memory.clone(),
            registry.sub_registry_with_prefix("memory"),
        );
        Self::with_manager(config, Arc::new(manager), registry)
    }

    /// Create a writer that copies borrowed slices with `manager`.
    pub fn with_manager(
        config: Config,
        manager: Arc<dyn MemoryManager>,
        registry: &mut Registry,
    ) -> Self {
        Self {
            max_pending: AtomicUsize::new(encode_limit(config.max_pending_bytes)),
            max_write_reentrants: AtomicUsize::new(config.max_write_reentrants),
            direct_write: AtomicBool::new(config.direct_write),
            queue: config.queue,
            records: RecordPool::new(config.record_pool_size.get()),
            manager,
            metrics: Metrics::new(registry),
        }
    }

    pub fn manager(&self) -> &Arc<dyn MemoryManager> {
        &self.manager
    }

    /// Create a connection writing to `socket`.
    pub fn connect<S: Socket>(&self, socket: S) -> Connection<S, M> {
        Connection::new(socket, self.queue)
    }

    /// Default limit on the bytes queued per connection.
    pub fn max_pending_bytes_per_connection(&self) -> Limit {
        decode_limit(self.max_pending.load(Ordering::Relaxed))
    }

    pub fn set_max_pending_bytes_per_connection(&self, limit: Limit) {
        self.max_pending.store(encode_limit(limit), Ordering::Relaxed);
    }

    pub fn max_write_reentrants(&self) -> usize {
        self.max_write_reentrants.load(Ordering::Relaxed)
    }

    pub fn set_max_write_reentrants(&self, reentrants: usize) {
        self.max_write_reentrants.store(reentrants, Ordering::Relaxed);
    }

    pub fn is_direct_write(&self) -> bool {
        self.direct_write.load(Ordering::Relaxed)
    }

    pub fn set_direct_write(&self, enabled: bool) {
        self.direct_write.store(enabled, Ordering::Relaxed);
    }

    /// Queue limit of `connection` in bytes, or `None` if unlimited.
    fn limit<S: Socket>(&self, connection: &Connection<S, M>) -> Option<usize> {
        connection
            .limit()
            .unwrap_or_else(|| self.max_pending_bytes_per_connection())
            .resolve(connection.socket().send_buffer_size())
    }

    /// Write `message` to `connection`.
    ///
    /// `handler` is notified exactly once: when the message has been fully
    /// written or when it fails. If the connection's queue is over its limit,
    /// the message is given to `push_back` instead (and `handler` is dropped
    /// without being notified) or, without a `push_back`, the write fails with
    /// [Error::QueueLimitExceeded].
    pub fn write<S: Socket>(
        &self,
        connection: &Connection<S, M>,
        destination: Option<SocketAddr>,
        message: M,
        handler: Option<WriteHandler>,
        push_back: Option<Box<dyn PushBack<M>>>,
    ) {
        let mut record = self.records.take();
        record.init(message, destination, handler, push_back);

        if !connection.is_open() {
            self.fail(record, closed(connection));
            connection.close_silently();
            return;
        }

        let queue = connection.queue();
        let bytes = record.bytes_to_reserve();
        let reserved = queue.reserve_space(bytes);
        record.notify_reserved();
        let is_current = reserved == bytes;

        if !is_current {
            if let Some(limit) = self.limit(connection) {
                if reserved > limit {
                    queue.release_space_and_notify(bytes);
                    self.reject(connection, record, reserved - bytes, limit);
                    return;
                }
            }
        }

        let reentrant = Reentrant::enter();
        if reentrant.depth() > self.max_write_reentrants() {
            self.metrics.deferred_writes.inc();
            trace!(
                connection = connection.id(),
                depth = reentrant.depth(),
                "deferring nested write"
            );
            if is_current {
                self.park(connection, record);
            } else {
                self.enqueue(connection, record);
            }
            return;
        }

        if !is_current {
            self.enqueue(connection, record);
            return;
        }
        if !self.is_direct_write() {
            self.park(connection, record);
            return;
        }

        self.metrics.direct_writes.inc();
        let written = match record.write_to(connection.socket()) {
            Ok(written) => written,
            Err(err) => {
                self.fail_io(connection, record, 0, err);
                return;
            }
        };
        self.metrics.bytes_written.inc_by(written as u64);
        let released = record.releasable(written);
        let reserved = queue.release_space_and_notify(released);
        if record.is_finished() {
            self.complete(record);
            // Producers queued behind this write need the event loop
            if reserved > 0 {
                self.request_ready(connection);
            }
            return;
        }

        trace!(
            connection = connection.id(),
            written,
            remaining = record.remaining(),
            "partial direct write"
        );
        if written > 0 {
            record.notify_incomplete();
        }
        self.park(connection, record);
    }

    /// Write `message` to `connection`, returning a [Completion] resolved
    /// when the write finishes.
    pub fn write_future<S: Socket>(
        &self,
        connection: &Connection<S, M>,
        destination: Option<SocketAddr>,
        message: M,
    ) -> Completion<WriteResult, Error> {
        let (promise, completion) = promise();
        self.write(connection, destination, message, Some(Box::new(promise)), None);
        completion
    }

    /// Write queued messages until the socket stops accepting data.
    ///
    /// Called by the event loop when the socket of `connection` becomes
    /// writable. Only one thread may drain a given connection at a time.
    pub fn on_ready<S: Socket>(&self, connection: &Connection<S, M>) -> ReadyState {
        if !connection.is_open() {
            return ReadyState::Complete;
        }
        let queue = connection.queue();

        // Releases are batched so that writes issued by completion handlers
        // are queued behind this drain rather than written directly.
        let mut released = 0;
        while let Some(mut record) = queue.take_current().or_else(|| queue.poll()) {
            let written = match record.write_to(connection.socket()) {
                Ok(written) => written,
                Err(err) => {
                    self.fail_io(connection, record, released, err);
                    return ReadyState::Complete;
                }
            };
            self.metrics.bytes_written.inc_by(written as u64);
            released += record.releasable(written);
            if record.is_finished() {
                self.complete(record);
                continue;
            }

            if written > 0 {
                record.notify_incomplete();
            }
            record.notify_queued();
            queue.set_current(record);
            queue.release_space_and_notify(released);
            return ReadyState::HasMore;
        }

        if queue.release_space_and_notify(released) == 0 {
            ReadyState::Complete
        } else {
            ReadyState::ExpectingMore
        }
    }

    /// Fail every pending write of `connection` and every producer waiting for
    /// space in its queue.
    ///
    /// Called by the event loop once the connection is closed. A connection
    /// that is still open is closed with [CloseReason::Remote].
    pub fn on_close<S: Socket>(&self, connection: &Connection<S, M>) {
        connection.close(CloseReason::Remote);
        let error = closed(connection);
        let queue = connection.queue();
        let mut released = 0;
        let mut failed = 0;
        while let Some(record) = queue.take_current().or_else(|| queue.poll()) {
            released += record.outstanding();
            failed += 1;
            self.fail(record, error.clone());
        }
        queue.release_space(released);
        let monitors = queue.take_monitors();
        if failed > 0 || !monitors.is_empty() {
            debug!(
                connection = connection.id(),
                failed,
                monitors = monitors.len(),
                "failed pending writes of closed connection"
            );
        }
        for monitor in monitors {
            monitor.on_error(error.clone());
        }
    }

    /// Close `connection` and fail its pending writes.
    pub fn close<S: Socket>(&self, connection: &Connection<S, M>) {
        connection.close(CloseReason::Local);
        self.on_close(connection);
    }

    /// Returns whether a message of `size` bytes fits in the queue of
    /// `connection` without exceeding its limit.
    ///
    /// An empty queue accepts a message of any size.
    pub fn can_write<S: Socket>(&self, connection: &Connection<S, M>, size: usize) -> bool {
        match self.limit(connection) {
            Some(limit) => fits(connection.pending_bytes(), size, limit),
            None => true,
        }
    }

    /// Notify `handler` once a message of `size` bytes fits in the queue of
    /// `connection` (see [AsyncQueueWriter::can_write]).
    ///
    /// `handler` fails with [Error::Closed] if the connection closes first.
    pub fn notify_write_possible<S: Socket>(
        &self,
        connection: &Connection<S, M>,
        handler: Box<dyn Handler<(), Error>>,
        size: usize,
    ) {
        if !connection.is_open() {
            handler.failed(closed(connection));
            return;
        }
        let Some(limit) = self.limit(connection) else {
            handler.completed(());
            return;
        };
        let queue = connection.queue();
        if queue
            .add_monitor(Box::new(SpaceMonitor {
                size,
                limit,
                handler,
            }))
            .is_none()
        {
            return;
        }

        // The connection may have been drained concurrently
        if !connection.is_open() {
            let error = closed(connection);
            for monitor in queue.take_monitors() {
                monitor.on_error(error.clone());
            }
        }
    }

    fn complete(&self, record: Box<Record<M>>) {
        self.metrics.completed.inc();
        record.notify_complete_and_recycle(&self.records);
    }

    fn fail(&self, record: Box<Record<M>>, error: Error) {
        self.metrics.failed.inc();
        trace!(?error, "write failed");
        record.notify_failure(error, &self.records);
    }

    /// Refuse a write because the queue of `connection` is over its limit.
    fn reject<S: Socket>(
        &self,
        connection: &Connection<S, M>,
        record: Box<Record<M>>,
        pending: usize,
        limit: usize,
    ) {
        if record.has_push_back() {
            self.metrics.pushed_back.inc();
            debug!(
                connection = connection.id(),
                pending, limit, "pushing back message"
            );
            record.notify_push_back(&self.records);
            return;
        }
        debug!(
            connection = connection.id(),
            pending, limit, "queue limit exceeded"
        );
        self.fail(record, Error::QueueLimitExceeded { pending, limit });
    }

    /// Install `record` as the current element of `connection` and ask the
    /// event loop to resume it.
    fn park<S: Socket>(&self, connection: &Connection<S, M>, mut record: Box<Record<M>>) {
        record.notify_queued();
        connection.queue().set_current(record);

        // A close racing with the write would otherwise strand the record
        if !connection.is_open() {
            self.on_close(connection);
            return;
        }
        self.request_ready(connection);
    }

    fn enqueue<S: Socket>(&self, connection: &Connection<S, M>, mut record: Box<Record<M>>) {
        self.metrics.queued_writes.inc();
        record.notify_queued();
        connection.queue().offer(record);

        // A close racing with the offer would otherwise strand the record
        if !connection.is_open() {
            self.on_close(connection);
        }
    }

    fn request_ready<S: Socket>(&self, connection: &Connection<S, M>) {
        let Err(err) = connection.socket().request_writable() else {
            return;
        };
        debug!(connection = connection.id(), ?err, "readiness request failed");
        let err = Arc::new(err);
        let queue = connection.queue();
        if let Some(record) = queue.take_current() {
            queue.release_space(record.outstanding());
            self.fail(record, Error::ReadinessFailed(err.clone()));
        }
        connection.close(CloseReason::Failed(err.to_string()));
        self.on_close(connection);
    }

    /// Fail `record` after a socket error, release its reservation along with
    /// `released` bytes already written, and close `connection`.
    fn fail_io<S: Socket>(
        &self,
        connection: &Connection<S, M>,
        record: Box<Record<M>>,
        released: usize,
        err: io::Error,
    ) {
        debug!(connection = connection.id(), ?err, "write failed");
        let err = Arc::new(err);
        connection
            .queue()
            .release_space(released + record.outstanding());
        self.fail(record, Error::WriteFailed(err.clone()));
        connection.close(CloseReason::Failed(err.to_string()));
        self.on_close(connection);
    }
}

impl AsyncQueueWriter<Buffer> {
    /// Copy `data` into a buffer from the writer's memory manager and write it
    /// to `connection`.
    ///
    /// If the copy cannot be allocated, `handler` fails with
    /// [Error::Allocation] and the connection is closed.
    pub fn write_slice<S: Socket>(
        &self,
        connection: &Connection<S, Buffer>,
        destination: Option<SocketAddr>,
        data: &[u8],
        handler: Option<WriteHandler>,
    ) {
        let buffer = self.manager.allocate(data.len()).and_then(|mut buffer| {
            buffer.put_slice(data)?;
            buffer.flip();
            Ok(buffer)
        });
        match buffer {
            Ok(buffer) => self.write(connection, destination, buffer, handler, None),
            Err(err) => {
                debug!(connection = connection.id(), ?err, "failed to copy message");
                self.metrics.failed.inc();
                connection.close(CloseReason::Failed(err.to_string()));
                if let Some(handler) = handler {
                    handler.failed(Error::Allocation(err));
                }
                self.on_close(connection);
            }
        }
    }
}

/// Error reported for writes against a closed connection.
fn closed<S: Socket, M: Message>(connection: &Connection<S, M>) -> Error {
    Error::Closed(
        connection
            .close_reason()
            .cloned()
            .unwrap_or(CloseReason::Local),
    )
}
