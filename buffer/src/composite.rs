use crate::{Buffer, Error, MemoryManager};
use bytes::Buf;
use std::{collections::VecDeque, io::IoSlice};

/// A message made of several [Buffer]s, read in order without copying.
///
/// Parts are dropped (and so returned to their manager) as soon as they have
/// been fully consumed.
#[derive(Debug, Default)]
pub struct Composite {
    parts: VecDeque<Buffer>,
}

impl Composite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `buffer` after the existing parts.
    pub fn append(&mut self, buffer: Buffer) {
        self.parts.push_back(buffer);
    }

    /// Add `buffer` before the existing parts.
    pub fn prepend(&mut self, buffer: Buffer) {
        self.parts.push_front(buffer);
    }

    /// Number of parts not yet fully consumed.
    pub fn parts(&self) -> usize {
        self.parts.len()
    }

    /// Total readable bytes across all parts.
    pub fn remaining(&self) -> usize {
        self.parts.iter().map(Buffer::remaining).sum()
    }

    pub fn has_remaining(&self) -> bool {
        self.parts.iter().any(Buffer::has_remaining)
    }

    pub fn into_parts(self) -> Vec<Buffer> {
        self.parts.into()
    }

    /// Copy the readable bytes into a single buffer allocated from `manager`.
    pub fn flatten(self, manager: &dyn MemoryManager) -> Result<Buffer, Error> {
        let mut flat = manager.allocate(self.remaining())?;
        for part in &self.parts {
            flat.put_slice(part.chunk())?;
        }
        flat.flip();
        Ok(flat)
    }

    /// Dispose every part.
    ///
    /// All parts are released even if some fail. The first failure is returned.
    pub fn dispose(self) -> Result<(), Error> {
        let mut result = Ok(());
        for part in self.parts {
            let outcome = part.dispose();
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }
}

impl Buf for Composite {
    fn remaining(&self) -> usize {
        Composite::remaining(self)
    }

    fn chunk(&self) -> &[u8] {
        self.parts
            .iter()
            .find(|part| part.has_remaining())
            .map(|part| part.chunk())
            .unwrap_or_default()
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut filled = 0;
        for part in &self.parts {
            if filled == dst.len() {
                break;
            }
            if part.has_remaining() {
                filled += part.chunks_vectored(&mut dst[filled..]);
            }
        }
        filled
    }

    fn advance(&mut self, mut cnt: usize) {
        while let Some(front) = self.parts.front_mut() {
            let remaining = front.remaining();
            if cnt < remaining {
                front.advance(cnt);
                return;
            }
            cnt -= remaining;
            self.parts.pop_front();
        }
        assert!(cnt == 0, "cannot advance past end of composite");
    }
}

impl From<Vec<Buffer>> for Composite {
    fn from(parts: Vec<Buffer>) -> Self {
        Self {
            parts: parts.into(),
        }
    }
}

impl FromIterator<Buffer> for Composite {
    fn from_iter<I: IntoIterator<Item = Buffer>>(iter: I) -> Self {
        Self {
            parts: iter.into_iter().collect(),
        }
    }
}
