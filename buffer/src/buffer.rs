use crate::{arena::Slot, heap::Inner, Composite, Error};
use bytes::{Buf, Bytes, BytesMut};
use std::{
    ops::Range,
    sync::{Arc, Weak},
};

/// Backing bytes of a [Buffer].
pub(crate) enum Storage {
    /// Exclusively owned and writable.
    Owned(BytesMut),
    /// Shared with other views and read-only.
    Shared(Bytes),
}

impl Storage {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Owned(bytes) => bytes.len(),
            Self::Shared(bytes) => bytes.len(),
        }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Shared(bytes) => bytes,
        }
    }

    /// Convert to shared storage (if not already) and return another handle to it.
    fn share(&mut self) -> Bytes {
        if let Self::Owned(bytes) = self {
            *self = Self::Shared(std::mem::take(bytes).freeze());
        }
        match self {
            Self::Shared(bytes) => bytes.clone(),
            Self::Owned(_) => unreachable!("storage was just shared"),
        }
    }

    fn split_off(&mut self, at: usize) -> Self {
        match self {
            Self::Owned(bytes) => Self::Owned(bytes.split_off(at)),
            Self::Shared(bytes) => Self::Shared(bytes.split_off(at)),
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::Owned(BytesMut::new())
    }
}

/// A window over a region of bytes.
///
/// The region has a fixed capacity. Data is written at `position` and the
/// buffer is then flipped so the written bytes (`position..limit`) can be read
/// through [Buf]. `position <= limit <= capacity` always holds.
///
/// A buffer allocated by a [crate::MemoryManager] is handed back to it on drop.
/// Views created with [Buffer::duplicate] or [Buffer::slice] share the region,
/// which makes it read-only for every view.
pub struct Buffer {
    pub(crate) storage: Storage,
    pub(crate) position: usize,
    pub(crate) limit: usize,
    pub(crate) owner: Option<Weak<Inner>>,
    pub(crate) slot: Option<Slot>,
    allow_dispose: bool,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity())
            .field("read_only", &self.is_read_only())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::unpooled(Storage::default(), true)
    }
}

impl Buffer {
    fn unpooled(storage: Storage, allow_dispose: bool) -> Self {
        let limit = storage.len();
        Self {
            storage,
            position: 0,
            limit,
            owner: None,
            slot: None,
            allow_dispose,
        }
    }

    pub(crate) fn pooled(storage: BytesMut, owner: &Arc<Inner>, slot: Option<Slot>) -> Self {
        let limit = storage.len();
        Self {
            storage: Storage::Owned(storage),
            position: 0,
            limit,
            owner: Some(Arc::downgrade(owner)),
            slot,
            allow_dispose: true,
        }
    }

    /// Create a zeroed buffer that does not belong to any manager.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::unpooled(Storage::Owned(BytesMut::zeroed(capacity)), true)
    }

    /// Create a read-only view of `bytes`.
    ///
    /// The buffer does not own the bytes, so [Buffer::dispose] reports
    /// [Error::DisposeNotAllowed].
    pub fn wrap(bytes: Bytes) -> Self {
        Self::unpooled(Storage::Shared(bytes), false)
    }

    /// Create a writable buffer holding a copy of `data`, ready to be read.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::unpooled(Storage::Owned(BytesMut::from(data)), true)
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between position and limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Returns whether writes are rejected because the region is shared.
    pub fn is_read_only(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    /// Returns whether the buffer is handed back to a memory manager on drop.
    pub fn is_pooled(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_dispose_allowed(&self) -> bool {
        self.allow_dispose
    }

    /// Control whether the buffer may be disposed.
    ///
    /// A buffer that is not allowed to be disposed is never returned to its
    /// arena, so the region can be safely retained elsewhere.
    pub fn allow_dispose(&mut self, allow: bool) {
        self.allow_dispose = allow;
    }

    pub fn set_position(&mut self, position: usize) -> Result<(), Error> {
        if position > self.limit {
            return Err(Error::OutOfBounds {
                index: position,
                bound: self.limit,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Set the limit, pulling the position back if it lies beyond it.
    pub fn set_limit(&mut self, limit: usize) -> Result<(), Error> {
        let capacity = self.capacity();
        if limit > capacity {
            return Err(Error::OutOfBounds {
                index: limit,
                bound: capacity,
            });
        }
        self.limit = limit;
        self.position = self.position.min(limit);
        Ok(())
    }

    /// Make the bytes written so far readable.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Make the whole capacity writable again.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Read the readable bytes again from the start.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Move the unread bytes to the front and prepare for more writes.
    pub fn compact(&mut self) -> Result<(), Error> {
        let Storage::Owned(bytes) = &mut self.storage else {
            return Err(Error::ReadOnly);
        };
        let remaining = self.limit - self.position;
        bytes.copy_within(self.position..self.limit, 0);
        self.position = remaining;
        self.limit = bytes.len();
        Ok(())
    }

    /// Write `src` at the current position.
    pub fn put_slice(&mut self, src: &[u8]) -> Result<(), Error> {
        let available = self.limit - self.position;
        let Storage::Owned(bytes) = &mut self.storage else {
            return Err(Error::ReadOnly);
        };
        if src.len() > available {
            return Err(Error::Overflow {
                requested: src.len(),
                available,
            });
        }
        bytes[self.position..self.position + src.len()].copy_from_slice(src);
        self.position += src.len();
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        self.put_slice(&[value])
    }

    /// Fill `dst` from the current position.
    pub fn get_slice(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        let available = self.remaining();
        if dst.len() > available {
            return Err(Error::Underflow {
                requested: dst.len(),
                available,
            });
        }
        dst.copy_from_slice(&self.storage.as_slice()[self.position..self.position + dst.len()]);
        self.position += dst.len();
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        let mut value = [0u8; 1];
        self.get_slice(&mut value)?;
        Ok(value[0])
    }

    /// Split the region at `at`.
    ///
    /// This buffer keeps `[0, at)` and the returned buffer gets `[at, capacity)`.
    /// Position and limit are adjusted to stay within each half.
    pub fn split(&mut self, at: usize) -> Result<Self, Error> {
        let capacity = self.capacity();
        if at > capacity {
            return Err(Error::OutOfBounds {
                index: at,
                bound: capacity,
            });
        }
        let storage = self.storage.split_off(at);
        let tail = Self {
            storage,
            position: self.position.saturating_sub(at),
            limit: self.limit.saturating_sub(at),
            owner: self.owner.clone(),
            // The tail borders the arena's free space, so it inherits the slot
            slot: self.slot.take(),
            allow_dispose: self.allow_dispose,
        };
        self.position = self.position.min(at);
        self.limit = self.limit.min(at);
        Ok(tail)
    }

    /// Create a view sharing this buffer's region, position and limit.
    ///
    /// Both views become read-only.
    pub fn duplicate(&mut self) -> Self {
        let shared = self.storage.share();
        Self {
            storage: Storage::Shared(shared),
            position: self.position,
            limit: self.limit,
            owner: None,
            slot: None,
            allow_dispose: false,
        }
    }

    /// Create a view of `range` within the region.
    ///
    /// Both views become read-only. The returned view is ready to be read.
    pub fn slice(&mut self, range: Range<usize>) -> Result<Self, Error> {
        let capacity = self.capacity();
        if range.end > capacity {
            return Err(Error::OutOfBounds {
                index: range.end,
                bound: capacity,
            });
        }
        if range.start > range.end {
            return Err(Error::OutOfBounds {
                index: range.start,
                bound: range.end,
            });
        }
        let shared = self.storage.share().slice(range);
        Ok(Self::unpooled(Storage::Shared(shared), false))
    }

    /// Flip the buffer and shrink its capacity to the bytes written so far.
    ///
    /// The unused tail is only returned to the arena when this buffer is the
    /// most recent allocation of the calling thread's arena. Otherwise this is
    /// just a [Buffer::flip].
    pub fn trim(&mut self) {
        let position = self.position;
        if position < self.capacity() {
            if let (Storage::Owned(bytes), Some(slot), Some(owner)) =
                (&mut self.storage, self.slot, self.owner.as_ref())
            {
                if let Some(owner) = owner.upgrade() {
                    owner.trim(bytes, slot, position);
                }
            }
        }
        self.flip();
    }

    /// Combine this buffer with `other` into a single message, without copying.
    pub fn compose(self, other: Self) -> Composite {
        let mut composite = Composite::new();
        composite.append(self);
        composite.append(other);
        composite
    }

    /// Release the buffer.
    ///
    /// Returns [Error::DisposeNotAllowed] if the buffer has been marked as not
    /// disposable. The buffer is dropped either way, but only disposable
    /// buffers give their space back to the arena.
    pub fn dispose(self) -> Result<(), Error> {
        let allowed = self.allow_dispose;
        drop(self);
        if allowed {
            Ok(())
        } else {
            Err(Error::DisposeNotAllowed)
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        let Some(owner) = owner.upgrade() else {
            return;
        };
        let storage = std::mem::take(&mut self.storage);
        owner.release(storage, self.slot.take(), self.allow_dispose);
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize {
        self.limit - self.position
    }

    fn chunk(&self) -> &[u8] {
        &self.storage.as_slice()[self.position..self.limit]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.limit - self.position,
            "cannot advance past limit"
        );
        self.position += cnt;
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.chunk()
    }
}

impl From<Bytes> for Buffer {
    fn from(bytes: Bytes) -> Self {
        Self::wrap(bytes)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self::unpooled(Storage::Shared(Bytes::from(data)), true)
    }
}

impl From<&'static [u8]> for Buffer {
    fn from(data: &'static [u8]) -> Self {
        Self::wrap(Bytes::from_static(data))
    }
}

impl From<BytesMut> for Buffer {
    fn from(bytes: BytesMut) -> Self {
        Self::unpooled(Storage::Owned(bytes), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_flip_read() {
        let mut buffer = Buffer::with_capacity(8);
        assert_eq!(buffer.remaining(), 8);
        buffer.put_slice(b"abc").unwrap();
        buffer.put_u8(b'd').unwrap();
        assert_eq!(buffer.position(), 4);

        buffer.flip();
        assert_eq!(buffer.limit(), 4);
        assert_eq!(buffer.chunk(), b"abcd");
        assert_eq!(buffer.get_u8().unwrap(), b'a');

        let mut rest = [0u8; 3];
        buffer.get_slice(&mut rest).unwrap();
        assert_eq!(&rest, b"bcd");
        assert!(!buffer.has_remaining());
    }

    #[test]
    fn test_overflow_underflow() {
        let mut buffer = Buffer::with_capacity(2);
        assert_eq!(
            buffer.put_slice(b"abc"),
            Err(Error::Overflow {
                requested: 3,
                available: 2
            })
        );
        buffer.put_slice(b"ab").unwrap();
        buffer.flip();
        let mut dst = [0u8; 3];
        assert_eq!(
            buffer.get_slice(&mut dst),
            Err(Error::Underflow {
                requested: 3,
                available: 2
            })
        );
    }

    #[test]
    fn test_cursor_bounds() {
        let mut buffer = Buffer::with_capacity(10);
        buffer.set_limit(5).unwrap();
        assert!(matches!(
            buffer.set_position(6),
            Err(Error::OutOfBounds { index: 6, bound: 5 })
        ));
        buffer.set_position(5).unwrap();
        buffer.set_limit(3).unwrap();
        assert_eq!(buffer.position(), 3);
        assert!(buffer.set_limit(11).is_err());

        buffer.clear();
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.limit(), 10);
    }

    #[test]
    fn test_compact() {
        let mut buffer = Buffer::copy_from_slice(b"hello");
        buffer.advance(3);
        buffer.compact().unwrap();
        assert_eq!(buffer.position(), 2);
        assert_eq!(buffer.limit(), 5);
        buffer.flip();
        assert_eq!(buffer.chunk(), b"lo");
    }

    #[test]
    fn test_split() {
        let mut head = Buffer::copy_from_slice(b"0123456789");
        head.set_position(2).unwrap();
        head.set_limit(7).unwrap();

        let tail = head.split(4).unwrap();
        assert_eq!(head.capacity(), 4);
        assert_eq!(head.position(), 2);
        assert_eq!(head.limit(), 4);
        assert_eq!(head.chunk(), b"23");

        assert_eq!(tail.capacity(), 6);
        assert_eq!(tail.position(), 0);
        assert_eq!(tail.limit(), 3);
        assert_eq!(tail.chunk(), b"456");

        assert!(head.split(5).is_err());
    }

    #[test]
    fn test_duplicate_is_read_only() {
        let mut original = Buffer::copy_from_slice(b"shared");
        original.advance(2);
        let mut copy = original.duplicate();
        assert_eq!(copy.chunk(), b"ared");
        assert!(original.is_read_only());
        assert!(copy.is_read_only());
        assert_eq!(original.put_u8(0), Err(Error::ReadOnly));

        // Cursors are independent
        copy.advance(4);
        assert_eq!(original.remaining(), 4);
        assert_eq!(copy.remaining(), 0);
    }

    #[test]
    fn test_slice() {
        let mut original = Buffer::copy_from_slice(b"abcdef");
        let view = original.slice(1..4).unwrap();
        assert_eq!(view.chunk(), b"bcd");
        assert!(!view.is_dispose_allowed());
        assert!(original.slice(4..7).is_err());
        let (start, end) = (4, 2);
        assert!(original.slice(start..end).is_err());
    }

    #[test]
    fn test_wrap_dispose_not_allowed() {
        let buffer = Buffer::wrap(Bytes::from_static(b"static"));
        assert!(buffer.is_read_only());
        assert_eq!(buffer.chunk(), b"static");
        assert_eq!(buffer.dispose(), Err(Error::DisposeNotAllowed));

        let buffer = Buffer::from(vec![1, 2, 3]);
        assert!(buffer.dispose().is_ok());
    }

    #[test]
    fn test_allow_dispose() {
        let mut buffer = Buffer::with_capacity(4);
        buffer.allow_dispose(false);
        assert_eq!(buffer.dispose(), Err(Error::DisposeNotAllowed));
    }

    #[test]
    fn test_trim_unpooled_flips() {
        let mut buffer = Buffer::with_capacity(16);
        buffer.put_slice(b"xy").unwrap();
        buffer.trim();
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.chunk(), b"xy");
    }

    #[test]
    fn test_compose() {
        let first = Buffer::copy_from_slice(b"ab");
        let second = Buffer::copy_from_slice(b"cd");
        let mut composite = first.compose(second);
        assert_eq!(composite.remaining(), 4);
        assert_eq!(composite.copy_to_bytes(4).as_ref(), b"abcd");
    }

    #[test]
    #[should_panic(expected = "cannot advance past limit")]
    fn test_advance_past_limit() {
        let mut buffer = Buffer::copy_from_slice(b"a");
        buffer.advance(2);
    }
}
