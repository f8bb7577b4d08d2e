use crate::{Error, Message, Socket, WriteHandler, WriteResult};
use crossbeam_queue::ArrayQueue;
use std::{
    io::{self, IoSlice},
    net::SocketAddr,
};
use tracing::trace;

/// Maximum number of slices handed to a single vectored write.
const MAX_SLICES: usize = 64;

/// Receives a message that was not accepted because the connection's queue is
/// over its limit.
///
/// Any `FnOnce(M, Option<SocketAddr>)` closure is a [PushBack].
pub trait PushBack<M>: Send + 'static {
    fn on_push_back(self: Box<Self>, message: M, destination: Option<SocketAddr>);
}

impl<M, F> PushBack<M> for F
where
    F: FnOnce(M, Option<SocketAddr>) + Send + 'static,
{
    fn on_push_back(self: Box<Self>, message: M, destination: Option<SocketAddr>) {
        (*self)(message, destination)
    }
}

/// Lifecycle of a [Record].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Created,
    Reserved,
    DirectWritten,
    Queued,
    PartiallyWritten,
    Finished,
    Recycled,
}

/// A pending write: the message and everything needed to complete it.
///
/// Records are pooled by the writer and reused once their handler has fired.
/// Accessing a recycled record is a bug: debug builds panic and release builds
/// treat the access as a no-op.
pub struct Record<M> {
    message: Option<M>,
    destination: Option<SocketAddr>,
    handler: Option<WriteHandler>,
    push_back: Option<Box<dyn PushBack<M>>>,
    initial_size: usize,
    uncountable: bool,
    written: usize,
    state: State,
}

impl<M: Message> Record<M> {
    fn new() -> Self {
        Self {
            message: None,
            destination: None,
            handler: None,
            push_back: None,
            initial_size: 0,
            uncountable: false,
            written: 0,
            state: State::Recycled,
        }
    }

    /// Returns whether the record may be used, tripping a debug assertion if
    /// it has been recycled.
    fn live(&self) -> bool {
        debug_assert!(self.state != State::Recycled, "record used after recycle");
        self.state != State::Recycled
    }

    pub(crate) fn init(
        &mut self,
        message: M,
        destination: Option<SocketAddr>,
        handler: Option<WriteHandler>,
        push_back: Option<Box<dyn PushBack<M>>>,
    ) {
        debug_assert_eq!(self.state, State::Recycled, "record initialized twice");
        self.initial_size = message.remaining();
        self.uncountable = self.initial_size == 0 || message.is_external();
        self.message = Some(message);
        self.destination = destination;
        self.handler = handler;
        self.push_back = push_back;
        self.written = 0;
        self.state = State::Created;
    }

    /// Message size when the record was created.
    pub fn initial_size(&self) -> usize {
        if !self.live() {
            return 0;
        }
        self.initial_size
    }

    /// Bytes of the message not yet written.
    pub fn remaining(&self) -> usize {
        if !self.live() {
            return 0;
        }
        self.message.as_ref().map_or(0, Message::remaining)
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns whether the message is reserved as a nominal single byte
    /// (empty or external messages).
    pub fn is_uncountable(&self) -> bool {
        self.live() && self.uncountable
    }

    /// Bytes this record reserves in its queue.
    pub fn bytes_to_reserve(&self) -> usize {
        if self.is_uncountable() {
            1
        } else {
            self.initial_size()
        }
    }

    /// Bytes of this record's reservation not yet released.
    pub(crate) fn outstanding(&self) -> usize {
        if self.is_uncountable() {
            1
        } else {
            self.remaining()
        }
    }

    /// Bytes of the reservation to release after `written` more bytes went out.
    pub(crate) fn releasable(&self, written: usize) -> usize {
        if !self.is_uncountable() {
            written
        } else if self.is_finished() {
            1
        } else {
            0
        }
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        if !self.live() {
            return None;
        }
        self.destination
    }

    pub(crate) fn has_push_back(&self) -> bool {
        self.live() && self.push_back.is_some()
    }

    pub(crate) fn notify_reserved(&mut self) {
        if self.live() {
            debug_assert_eq!(self.state, State::Created);
            self.state = State::Reserved;
        }
    }

    /// Called before each attempt to write the record.
    pub(crate) fn notify_before_write(&mut self) {
        if !self.live() {
            return;
        }
        debug_assert!(
            matches!(self.state, State::Reserved | State::Queued),
            "cannot write record in state {:?}",
            self.state
        );
        if self.state == State::Reserved {
            self.state = State::DirectWritten;
        }
    }

    /// Park the record in its queue (as the current element or in the FIFO).
    pub(crate) fn notify_queued(&mut self) {
        if self.live() {
            self.state = State::Queued;
        }
    }

    /// The record was partially written and will be resumed later.
    pub(crate) fn notify_incomplete(&mut self) {
        if !self.live() {
            return;
        }
        self.state = State::PartiallyWritten;
        let progress = WriteResult {
            written: self.written,
            destination: self.destination,
        };
        if let Some(handler) = self.handler.as_mut() {
            handler.updated(&progress);
        }
    }

    /// Write as much of the message as `socket` accepts.
    ///
    /// A socket that would block counts as writing nothing.
    pub(crate) fn write_to<S: Socket>(&mut self, socket: &S) -> io::Result<usize> {
        self.notify_before_write();
        let Some(message) = self.message.as_mut() else {
            return Ok(0);
        };
        if message.remaining() == 0 {
            return Ok(0);
        }
        let written = loop {
            let mut slices = [IoSlice::new(&[]); MAX_SLICES];
            let filled = message.chunks_vectored(&mut slices);
            match socket.write_vectored(self.destination, &slices[..filled]) {
                Ok(written) => break written,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break 0,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };
        message.advance(written);
        self.written += written;
        Ok(written)
    }

    /// Release the message, fire the completion handler and return the record
    /// to `pool`.
    pub(crate) fn notify_complete_and_recycle(mut self: Box<Self>, pool: &RecordPool<M>) {
        if !self.live() {
            return;
        }
        self.state = State::Finished;
        self.release_message();
        let result = WriteResult {
            written: self.written,
            destination: self.destination,
        };
        if let Some(handler) = self.handler.take() {
            handler.completed(result);
        }
        pool.recycle(self);
    }

    /// Release the message, fail the completion handler and return the record
    /// to `pool`.
    pub(crate) fn notify_failure(mut self: Box<Self>, error: Error, pool: &RecordPool<M>) {
        if !self.live() {
            return;
        }
        self.state = State::Finished;
        self.release_message();
        if let Some(handler) = self.handler.take() {
            handler.failed(error);
        }
        pool.recycle(self);
    }

    /// Hand the message back to the push-back handler and return the record
    /// to `pool`. The completion handler is dropped without firing.
    pub(crate) fn notify_push_back(mut self: Box<Self>, pool: &RecordPool<M>) {
        if !self.live() {
            return;
        }
        self.state = State::Finished;
        if let (Some(push_back), Some(message)) = (self.push_back.take(), self.message.take()) {
            push_back.on_push_back(message, self.destination);
        }
        pool.recycle(self);
    }

    fn release_message(&mut self) {
        let Some(message) = self.message.take() else {
            return;
        };
        // The transport may have already disposed of the storage
        if let Err(err) = message.release() {
            trace!(?err, "failed to release message");
        }
    }

    fn reset(&mut self) {
        self.message = None;
        self.destination = None;
        self.handler = None;
        self.push_back = None;
        self.initial_size = 0;
        self.uncountable = false;
        self.written = 0;
        self.state = State::Recycled;
    }
}

/// Free list of idle [Record]s.
pub(crate) struct RecordPool<M> {
    free: ArrayQueue<Box<Record<M>>>,
}

impl<M: Message> RecordPool<M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity),
        }
    }

    /// Take an idle record, allocating one if the pool is empty.
    pub fn take(&self) -> Box<Record<M>> {
        self.free
            .pop()
            .unwrap_or_else(|| Box::new(Record::new()))
    }

    fn recycle(&self, mut record: Box<Record<M>>) {
        record.reset();
        // A full pool drops the record
        let _ = self.free.push(record);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use bytes::Bytes;
    use sluice_buffer::Buffer;
    use std::sync::{Arc, Mutex};

    type Outcomes = Arc<Mutex<Vec<Result<WriteResult, String>>>>;

    fn handler(outcomes: &Outcomes) -> WriteHandler {
        let outcomes = outcomes.clone();
        Box::new(move |result: Result<WriteResult, Error>| {
            outcomes
                .lock()
                .unwrap()
                .push(result.map_err(|err| err.to_string()))
        })
    }

    fn record(pool: &RecordPool<Bytes>, data: &'static [u8], outcomes: &Outcomes) -> Box<Record<Bytes>> {
        let mut record = pool.take();
        record.init(Bytes::from_static(data), None, Some(handler(outcomes)), None);
        record.notify_reserved();
        record
    }

    #[test]
    fn test_sizes() {
        let pool = RecordPool::new(4);
        let outcomes = Outcomes::default();
        let record = record(&pool, b"hello", &outcomes);
        assert_eq!(record.initial_size(), 5);
        assert_eq!(record.remaining(), 5);
        assert_eq!(record.bytes_to_reserve(), 5);
        assert!(!record.is_uncountable());
        assert!(!record.is_finished());

        let empty = self::record(&pool, b"", &outcomes);
        assert!(empty.is_uncountable());
        assert_eq!(empty.bytes_to_reserve(), 1);
        assert_eq!(empty.outstanding(), 1);
        assert!(empty.is_finished());
        assert_eq!(empty.releasable(0), 1);
    }

    #[test]
    fn test_partial_write_then_complete() {
        let pool = RecordPool::new(4);
        let outcomes = Outcomes::default();
        let socket = mocks::Socket::with_capacity(3);
        let mut record = record(&pool, b"hello", &outcomes);

        assert_eq!(record.write_to(&socket).unwrap(), 3);
        assert_eq!(record.remaining(), 2);
        assert_eq!(record.outstanding(), 2);
        record.notify_incomplete();
        record.notify_queued();

        // Blocked socket writes nothing
        assert_eq!(record.write_to(&socket).unwrap(), 0);

        socket.add_capacity(10);
        assert_eq!(record.write_to(&socket).unwrap(), 2);
        assert!(record.is_finished());
        record.notify_complete_and_recycle(&pool);

        assert_eq!(socket.written(), b"hello");
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![Ok(WriteResult {
                written: 5,
                destination: None
            })]
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_failure() {
        let pool = RecordPool::new(4);
        let outcomes = Outcomes::default();
        let record = record(&pool, b"data", &outcomes);
        record.notify_failure(Error::QueueLimitExceeded { pending: 1, limit: 1 }, &pool);
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_err());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_push_back() {
        let pool = RecordPool::new(4);
        let returned = Arc::new(Mutex::new(None));
        let mut record = pool.take();
        let destination: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let push_back: Box<dyn PushBack<Bytes>> = Box::new({
            let returned = returned.clone();
            move |message: Bytes, destination: Option<SocketAddr>| {
                *returned.lock().unwrap() = Some((message, destination));
            }
        });
        record.init(Bytes::from_static(b"later"), Some(destination), None, Some(push_back));
        assert!(record.has_push_back());
        record.notify_push_back(&pool);
        assert_eq!(
            returned.lock().unwrap().take(),
            Some((Bytes::from_static(b"later"), Some(destination)))
        );
    }

    #[test]
    fn test_release_errors_swallowed() {
        let pool = RecordPool::new(4);
        let outcomes = Outcomes::default();
        let mut record = pool.take();
        record.init(
            Buffer::wrap(Bytes::from_static(b"")),
            None,
            Some(handler(&outcomes)),
            None,
        );
        record.notify_reserved();
        record.notify_complete_and_recycle(&pool);
        assert_eq!(outcomes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_pool_reuses_records() {
        let pool = RecordPool::<Bytes>::new(1);
        let outcomes = Outcomes::default();
        record(&pool, b"a", &outcomes).notify_complete_and_recycle(&pool);
        record(&pool, b"b", &outcomes).notify_complete_and_recycle(&pool);
        assert_eq!(pool.len(), 1);
        assert_eq!(outcomes.lock().unwrap().len(), 2);

        // Extra records are dropped when the pool is full
        let first = record(&pool, b"c", &outcomes);
        let second = record(&pool, b"d", &outcomes);
        first.notify_complete_and_recycle(&pool);
        second.notify_complete_and_recycle(&pool);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "record used after recycle")]
    fn test_recycled_access_panics() {
        let pool = RecordPool::<Bytes>::new(1);
        let record = pool.take();
        record.remaining();
    }
}
