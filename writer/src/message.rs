use bytes::{Buf, Bytes};
use sluice_buffer::{Buffer, Composite, Error};
use std::io::IoSlice;

/// Payload accepted by [crate::AsyncQueueWriter].
pub trait Message: Send + 'static {
    /// Bytes left to write.
    fn remaining(&self) -> usize;

    /// Fill `dst` with the unwritten bytes, returning the number of slices used.
    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize;

    /// Mark `cnt` bytes as written.
    fn advance(&mut self, cnt: usize);

    /// Returns whether the payload lives outside of memory (for example a file
    /// region), in which case its size is not counted against queue limits.
    fn is_external(&self) -> bool {
        false
    }

    /// Give the payload's storage back once it has been written.
    fn release(self) -> Result<(), Error>;
}

impl Message for Buffer {
    fn remaining(&self) -> usize {
        Buffer::remaining(self)
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        Buf::chunks_vectored(self, dst)
    }

    fn advance(&mut self, cnt: usize) {
        Buf::advance(self, cnt)
    }

    fn release(self) -> Result<(), Error> {
        self.dispose()
    }
}

impl Message for Composite {
    fn remaining(&self) -> usize {
        Composite::remaining(self)
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        Buf::chunks_vectored(self, dst)
    }

    fn advance(&mut self, cnt: usize) {
        Buf::advance(self, cnt)
    }

    fn release(self) -> Result<(), Error> {
        self.dispose()
    }
}

impl Message for Bytes {
    fn remaining(&self) -> usize {
        Buf::remaining(self)
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        Buf::chunks_vectored(self, dst)
    }

    fn advance(&mut self, cnt: usize) {
        Buf::advance(self, cnt)
    }

    fn release(self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<M: Message>(mut message: M) -> Vec<u8> {
        let mut out = Vec::new();
        while message.remaining() > 0 {
            let mut slices = [IoSlice::new(&[]); 4];
            let filled = message.chunks_vectored(&mut slices);
            let first = slices[..filled][0].to_vec();
            message.advance(first.len());
            out.extend(first);
        }
        message.release().unwrap();
        out
    }

    #[test]
    fn test_buffer() {
        assert_eq!(drain(Buffer::copy_from_slice(b"buffer")), b"buffer");
    }

    #[test]
    fn test_composite() {
        let composite = Buffer::copy_from_slice(b"com").compose(Buffer::copy_from_slice(b"posite"));
        assert_eq!(drain(composite), b"composite");
    }

    #[test]
    fn test_bytes() {
        assert_eq!(drain(Bytes::from_static(b"bytes")), b"bytes");
    }

    #[test]
    fn test_release_wrapped() {
        let wrapped = Buffer::wrap(Bytes::from_static(b"x"));
        assert_eq!(Message::release(wrapped), Err(Error::DisposeNotAllowed));
    }
}
