//! Depth of nested writes on the current thread.

use std::cell::Cell;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII guard counting one level of write nesting on the current thread.
///
/// The depth is incremented when the guard is created and decremented when it
/// is dropped, however the enclosing scope is left.
pub(crate) struct Reentrant {
    depth: usize,
}

impl Reentrant {
    pub fn enter() -> Self {
        let depth = DEPTH.with(|depth| {
            let next = depth.get() + 1;
            depth.set(next);
            next
        });
        Self { depth }
    }

    /// Nesting level of this guard, starting at 1 for the outermost write.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for Reentrant {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}
