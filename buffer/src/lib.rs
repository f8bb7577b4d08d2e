//! Pooled byte buffers and the memory managers that produce them.
//!
//! # Overview
//!
//! A [Buffer] is a window (`position..limit`) over a region of bytes with a
//! fixed capacity. Buffers allocated by a [MemoryManager] remember their owner
//! and are handed back to it when dropped, so short-lived buffers are cheap to
//! create. Buffers can be split, sliced and duplicated without copying, and
//! several buffers can be composed into a single [Composite] message.
//!
//! [HeapMemoryManager] slices allocations out of thread-local arenas. Space is
//! only reclaimed in LIFO order: trimming or dropping the most recent slice of
//! the calling thread's arena returns its bytes, anything else simply drops the
//! reference and lets the arena be freed once every slice is gone.
//!
//! # Example
//!
//! ```
//! use bytes::Buf;
//! use prometheus_client::registry::Registry;
//! use sluice_buffer::{Config, HeapMemoryManager, MemoryManager};
//!
//! let manager = HeapMemoryManager::new(Config::default(), &mut Registry::default());
//! let mut buffer = manager.allocate(64).unwrap();
//! buffer.put_slice(b"hello").unwrap();
//! buffer.trim();
//! assert_eq!(buffer.capacity(), 5);
//! assert_eq!(buffer.chunk(), b"hello");
//! ```

mod arena;
mod buffer;
pub use buffer::Buffer;
mod composite;
pub use composite::Composite;
mod heap;
pub use heap::{Config, HeapMemoryManager};

use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur when working with buffers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("failed to allocate {0} bytes")]
    AllocationFailed(usize),
    #[error("overflow: requested {requested} bytes with {available} available")]
    Overflow { requested: usize, available: usize },
    #[error("underflow: requested {requested} bytes with {available} remaining")]
    Underflow { requested: usize, available: usize },
    #[error("index {index} out of bounds (bound {bound})")]
    OutOfBounds { index: usize, bound: usize },
    #[error("buffer is read-only")]
    ReadOnly,
    #[error("buffer does not allow dispose")]
    DisposeNotAllowed,
}

/// Source of [Buffer]s.
pub trait MemoryManager: Send + Sync + 'static {
    /// Allocate a zeroed buffer of exactly `size` bytes.
    ///
    /// The returned buffer has `position == 0` and `limit == capacity == size`.
    fn allocate(&self, size: usize) -> Result<Buffer, Error>;

    /// Change the capacity of `buffer` to `new_size`.
    ///
    /// Content up to `min(capacity, new_size)` is preserved, as are position
    /// and limit (clamped to the new capacity).
    fn reallocate(&self, buffer: Buffer, new_size: usize) -> Result<Buffer, Error>;

    /// Release `buffer`, returning its space to the arena when possible.
    fn release(&self, buffer: Buffer);

    /// Flip `buffer` and shrink its capacity to the bytes written so far.
    fn trim(&self, buffer: &mut Buffer);

    /// Adapt existing bytes into a read-only [Buffer] without taking ownership of
    /// the underlying storage.
    fn wrap(&self, bytes: Bytes) -> Buffer;

    /// Bytes currently handed out by this manager.
    fn allocated(&self) -> usize;
}
