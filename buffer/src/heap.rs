//! Memory manager backed by thread-local arenas.
//!
//! Each thread that allocates from a [HeapMemoryManager] gets its own arena
//! for that manager, so the allocation fast path never contends with other
//! threads. Requests up to [Config::arena_size] are sliced off the front of the
//! thread's current arena. When the arena runs out of room it is retired and a
//! new one takes its place; slices that are still alive keep the retired
//! region alive until they are dropped. Larger requests bypass the arenas.
//!
//! Space is given back to an arena in LIFO order only: trimming or dropping the
//! most recent slice of the calling thread's current arena returns its bytes.
//! Anything else (an older slice, a slice of a retired arena, a slice dropped
//! on another thread) just drops its reference to the region.

use crate::{
    arena::{Arena, Slot},
    buffer::Storage,
    Buffer, Error, MemoryManager,
};
use bytes::{Bytes, BytesMut};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use sluice_utils::{env, NZUsize};
use std::{
    cell::RefCell,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};
use tracing::trace;

/// Environment variable overriding [Config::arena_size].
pub const ARENA_SIZE_VAR: &str = "SLUICE_ARENA_SIZE";

/// Configuration for a [HeapMemoryManager].
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of each thread-local arena. Requests larger than this are served by
    /// a dedicated allocation.
    pub arena_size: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arena_size: NZUsize!(128 * 1024),
        }
    }
}

impl Config {
    /// Read the configuration from the environment, falling back to the
    /// defaults for unset variables.
    pub fn from_env() -> Result<Self, env::Error> {
        let mut config = Self::default();
        if let Some(arena_size) = env::var(ARENA_SIZE_VAR)? {
            config.arena_size = arena_size;
        }
        Ok(config)
    }
}

/// Source of manager identities used to key thread-local arenas.
static NEXT_MANAGER: AtomicU64 = AtomicU64::new(0);

/// An arena owned by the current thread on behalf of one manager.
struct Local {
    manager: u64,
    owner: Weak<Inner>,
    arena: Arena,
}

thread_local! {
    static ARENAS: RefCell<Vec<Local>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` against the calling thread's arena for `manager`, if there is one.
///
/// Returns `None` when the thread has no arena for `manager` or thread-local
/// storage is unavailable (e.g. during thread teardown).
fn with_arena<R>(manager: u64, f: impl FnOnce(&mut Arena) -> R) -> Option<R> {
    ARENAS
        .try_with(|arenas| {
            let mut arenas = arenas.try_borrow_mut().ok()?;
            let local = arenas.iter_mut().find(|local| local.manager == manager)?;
            Some(f(&mut local.arena))
        })
        .ok()
        .flatten()
}

/// Metrics for the memory manager.
struct Metrics {
    /// Bytes currently handed out.
    allocated: Gauge,
    /// Allocations served by an arena.
    arena_allocations: Counter,
    /// Allocations too large for an arena.
    direct_allocations: Counter,
    /// Arenas created.
    arenas: Counter,
    /// Trims that returned bytes to an arena.
    trims: Counter,
    /// Released buffers whose space went back to an arena.
    reclaims: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            allocated: Gauge::default(),
            arena_allocations: Counter::default(),
            direct_allocations: Counter::default(),
            arenas: Counter::default(),
            trims: Counter::default(),
            reclaims: Counter::default(),
        };
        registry.register(
            "allocated_bytes",
            "Bytes currently handed out by the memory manager",
            metrics.allocated.clone(),
        );
        registry.register(
            "arena_allocations",
            "Allocations served from a thread-local arena",
            metrics.arena_allocations.clone(),
        );
        registry.register(
            "direct_allocations",
            "Allocations larger than an arena",
            metrics.direct_allocations.clone(),
        );
        registry.register(
            "arenas",
            "Thread-local arenas created",
            metrics.arenas.clone(),
        );
        registry.register(
            "trims",
            "Trims that returned bytes to an arena",
            metrics.trims.clone(),
        );
        registry.register(
            "reclaims",
            "Released buffers whose space was returned to an arena",
            metrics.reclaims.clone(),
        );
        metrics
    }
}

/// State shared by a manager and the buffers it hands out.
pub(crate) struct Inner {
    id: u64,
    config: Config,
    allocated: AtomicUsize,
    metrics: Metrics,
}

impl Inner {
    fn add_allocated(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
        self.metrics.allocated.inc_by(bytes as i64);
    }

    fn sub_allocated(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
        self.metrics.allocated.dec_by(bytes as i64);
    }

    /// Give the bytes of `bytes` past `position` back to the calling thread's
    /// arena, if `slot` is its most recent slice.
    pub(crate) fn trim(&self, bytes: &mut BytesMut, slot: Slot, position: usize) -> bool {
        let trimmed = with_arena(self.id, |arena| {
            if !arena.is_last(slot) {
                return None;
            }
            let tail = bytes.split_off(position);
            let returned = tail.len();
            arena.reclaim_tail(tail);
            Some(returned)
        })
        .flatten();
        let Some(returned) = trimmed else {
            return false;
        };
        self.sub_allocated(returned);
        self.metrics.trims.inc();
        trace!(manager = self.id, returned, "trimmed buffer");
        true
    }

    /// Account for a dropped buffer and return its space to the calling
    /// thread's arena when it was the most recent slice.
    pub(crate) fn release(&self, storage: Storage, slot: Option<Slot>, allow_dispose: bool) {
        self.sub_allocated(storage.len());
        let (Storage::Owned(bytes), Some(slot), true) = (storage, slot, allow_dispose) else {
            return;
        };
        let reclaimed = with_arena(self.id, |arena| {
            if arena.is_last(slot) {
                arena.reclaim(bytes);
                true
            } else {
                false
            }
        });
        if reclaimed == Some(true) {
            self.metrics.reclaims.inc();
        }
    }

    /// Extend the most recent slice of the calling thread's arena in place.
    fn grow(&self, bytes: &mut BytesMut, slot: Slot, extra: usize) -> bool {
        let grown = with_arena(self.id, |arena| {
            arena.is_last(slot) && arena.grow(bytes, extra)
        })
        .unwrap_or(false);
        if grown {
            self.add_allocated(extra);
        }
        grown
    }
}

/// Allocate `size` zeroed bytes from the global allocator.
fn zeroed(size: usize) -> Result<BytesMut, Error> {
    if size > isize::MAX as usize {
        return Err(Error::AllocationFailed(size));
    }
    Ok(BytesMut::zeroed(size))
}

/// A [MemoryManager] that slices allocations out of thread-local arenas.
///
/// Cloning a manager is cheap and every clone shares the same arenas.
#[derive(Clone)]
pub struct HeapMemoryManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HeapMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapMemoryManager")
            .field("config", &self.inner.config)
            .field("allocated", &self.allocated())
            .finish()
    }
}

impl HeapMemoryManager {
    /// Create a new manager, registering its metrics with `registry`.
    pub fn new(config: Config, registry: &mut Registry) -> Self {
        let metrics = Metrics::new(registry);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_MANAGER.fetch_add(1, Ordering::Relaxed),
                config,
                allocated: AtomicUsize::new(0),
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns whether `buffer` was allocated by this manager.
    fn owns(&self, buffer: &Buffer) -> bool {
        buffer
            .owner
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(owner.as_ptr(), Arc::as_ptr(&self.inner)))
    }

    /// Slice `size` bytes out of the calling thread's arena, replacing the arena
    /// when it lacks room.
    fn slice(&self, size: usize) -> Option<(BytesMut, Slot)> {
        let inner = &self.inner;
        let arena_size = inner.config.arena_size.get();
        ARENAS
            .try_with(|arenas| {
                let mut arenas = arenas.try_borrow_mut().ok()?;
                let index = match arenas.iter().position(|local| local.manager == inner.id) {
                    Some(index) => index,
                    None => {
                        // Forget arenas of managers that no longer exist
                        arenas.retain(|local| local.owner.strong_count() > 0);
                        arenas.push(Local {
                            manager: inner.id,
                            owner: Arc::downgrade(inner),
                            arena: Arena::new(arena_size),
                        });
                        inner.metrics.arenas.inc();
                        arenas.len() - 1
                    }
                };
                let arena = &mut arenas[index].arena;
                if arena.available() < size {
                    trace!(
                        manager = inner.id,
                        available = arena.available(),
                        size,
                        "retiring arena"
                    );
                    *arena = Arena::new(arena_size);
                    inner.metrics.arenas.inc();
                }
                arena.allocate(size)
            })
            .ok()
            .flatten()
    }
}

impl MemoryManager for HeapMemoryManager {
    fn allocate(&self, size: usize) -> Result<Buffer, Error> {
        if size == 0 {
            return Ok(Buffer::pooled(BytesMut::new(), &self.inner, None));
        }
        if size <= self.inner.config.arena_size.get() {
            if let Some((bytes, slot)) = self.slice(size) {
                self.inner.add_allocated(size);
                self.inner.metrics.arena_allocations.inc();
                return Ok(Buffer::pooled(bytes, &self.inner, Some(slot)));
            }
        }
        let bytes = zeroed(size)?;
        self.inner.add_allocated(size);
        self.inner.metrics.direct_allocations.inc();
        Ok(Buffer::pooled(bytes, &self.inner, None))
    }

    fn reallocate(&self, mut buffer: Buffer, new_size: usize) -> Result<Buffer, Error> {
        let capacity = buffer.capacity();
        if new_size == capacity {
            return Ok(buffer);
        }
        let owned = self.owns(&buffer);

        if new_size < capacity {
            // Try to keep the slot by giving the tail straight back to the arena
            let trimmed = match (&mut buffer.storage, buffer.slot) {
                (Storage::Owned(bytes), Some(slot)) if owned => {
                    self.inner.trim(bytes, slot, new_size)
                }
                _ => false,
            };
            if trimmed {
                buffer.position = buffer.position.min(new_size);
                buffer.limit = buffer.limit.min(new_size);
            } else {
                drop(buffer.split(new_size)?);
            }
            return Ok(buffer);
        }

        let extra = new_size - capacity;
        if let (Storage::Owned(bytes), Some(slot)) = (&mut buffer.storage, buffer.slot) {
            if owned && self.inner.grow(bytes, slot, extra) {
                return Ok(buffer);
            }
        }

        let mut fresh = self.allocate(new_size)?;
        if let Storage::Owned(bytes) = &mut fresh.storage {
            bytes[..capacity].copy_from_slice(buffer.storage.as_slice());
        }
        fresh.position = buffer.position;
        fresh.limit = buffer.limit;
        drop(buffer);
        Ok(fresh)
    }

    fn release(&self, buffer: Buffer) {
        drop(buffer);
    }

    fn trim(&self, buffer: &mut Buffer) {
        buffer.trim();
    }

    fn wrap(&self, bytes: Bytes) -> Buffer {
        Buffer::wrap(bytes)
    }

    fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use prometheus_client::encoding::text::encode;
    use std::thread;

    fn test_registry() -> Registry {
        Registry::default()
    }

    fn test_manager(arena_size: usize) -> HeapMemoryManager {
        HeapMemoryManager::new(
            Config {
                arena_size: NZUsize!(arena_size),
            },
            &mut test_registry(),
        )
    }

    /// Bytes left in the calling thread's arena for `manager`.
    fn available(manager: &HeapMemoryManager) -> Option<usize> {
        with_arena(manager.inner.id, |arena| arena.available())
    }

    #[test]
    fn test_config_default() {
        assert_eq!(Config::default().arena_size.get(), 131072);
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var(ARENA_SIZE_VAR, "4096");
        let config = Config::from_env().unwrap();
        std::env::remove_var(ARENA_SIZE_VAR);
        assert_eq!(config.arena_size.get(), 4096);
    }

    #[test]
    fn test_allocate() {
        let manager = test_manager(1024);
        let buffer = manager.allocate(100).unwrap();
        assert_eq!(buffer.capacity(), 100);
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.limit(), 100);
        assert!(buffer.chunk().iter().all(|b| *b == 0));
        assert!(buffer.is_pooled());
        assert_eq!(manager.allocated(), 100);
        assert_eq!(available(&manager), Some(924));

        drop(buffer);
        assert_eq!(manager.allocated(), 0);
        assert_eq!(available(&manager), Some(1024));
    }

    #[test]
    fn test_allocate_zero() {
        let manager = test_manager(1024);
        let buffer = manager.allocate(0).unwrap();
        assert_eq!(buffer.capacity(), 0);
        assert_eq!(manager.allocated(), 0);
    }

    #[test]
    fn test_allocate_larger_than_arena() {
        let manager = test_manager(64);
        let buffer = manager.allocate(65).unwrap();
        assert_eq!(buffer.capacity(), 65);
        assert_eq!(manager.allocated(), 65);
        assert_eq!(available(&manager), None);
        drop(buffer);
        assert_eq!(manager.allocated(), 0);
    }

    #[test]
    fn test_allocate_too_large() {
        let manager = test_manager(64);
        let size = isize::MAX as usize + 1;
        assert_eq!(
            manager.allocate(size).unwrap_err(),
            Error::AllocationFailed(size)
        );
    }

    #[test]
    fn test_arena_replaced_when_full() {
        let manager = test_manager(100);
        let first = manager.allocate(80).unwrap();
        let second = manager.allocate(40).unwrap();
        assert_eq!(available(&manager), Some(60));

        // The retired arena stays valid while its slice is alive
        drop(first);
        assert_eq!(available(&manager), Some(60));
        assert_eq!(manager.allocated(), 40);
        drop(second);
        assert_eq!(available(&manager), Some(100));
    }

    #[test]
    fn test_release_out_of_order() {
        let manager = test_manager(100);
        let first = manager.allocate(10).unwrap();
        let second = manager.allocate(20).unwrap();
        manager.release(first);
        assert_eq!(available(&manager), Some(70));
        assert_eq!(manager.allocated(), 20);

        manager.release(second);
        assert_eq!(available(&manager), Some(90));
        assert_eq!(manager.allocated(), 0);
    }

    #[test]
    fn test_trim_lifo() {
        let manager = test_manager(256);
        let mut buffer = manager.allocate(100).unwrap();
        buffer.put_slice(b"hello").unwrap();
        manager.trim(&mut buffer);
        assert_eq!(buffer.capacity(), 5);
        assert_eq!(buffer.chunk(), b"hello");
        assert_eq!(manager.allocated(), 5);
        assert_eq!(available(&manager), Some(251));

        // Still the last slice, so dropping it returns the rest
        drop(buffer);
        assert_eq!(available(&manager), Some(256));
    }

    #[test]
    fn test_trim_not_last_only_flips() {
        let manager = test_manager(256);
        let mut first = manager.allocate(100).unwrap();
        let _second = manager.allocate(50).unwrap();
        first.put_slice(b"abc").unwrap();
        first.trim();
        assert_eq!(first.capacity(), 100);
        assert_eq!(first.chunk(), b"abc");
        assert_eq!(available(&manager), Some(106));
    }

    #[test]
    fn test_dispose_not_allowed_not_reclaimed() {
        let manager = test_manager(128);
        let mut buffer = manager.allocate(64).unwrap();
        buffer.allow_dispose(false);
        assert_eq!(buffer.dispose(), Err(Error::DisposeNotAllowed));
        assert_eq!(manager.allocated(), 0);
        assert_eq!(available(&manager), Some(64));
    }

    #[test]
    fn test_duplicate_not_reclaimed() {
        let manager = test_manager(128);
        let mut buffer = manager.allocate(64).unwrap();
        let copy = buffer.duplicate();
        drop(buffer);
        assert_eq!(available(&manager), Some(64));
        assert_eq!(copy.capacity(), 64);
    }

    #[test]
    fn test_split_tail_keeps_slot() {
        let manager = test_manager(128);
        let mut head = manager.allocate(64).unwrap();
        let tail = head.split(16).unwrap();
        assert_eq!(manager.allocated(), 64);
        drop(tail);
        assert_eq!(manager.allocated(), 16);
        assert_eq!(available(&manager), Some(112));
        drop(head);
        assert_eq!(manager.allocated(), 0);
    }

    #[test]
    fn test_reallocate_grow_in_place() {
        let manager = test_manager(256);
        let mut buffer = manager.allocate(16).unwrap();
        buffer.put_slice(b"data").unwrap();
        let buffer = manager.reallocate(buffer, 64).unwrap();
        assert_eq!(buffer.capacity(), 64);
        assert_eq!(buffer.position(), 4);
        assert_eq!(manager.allocated(), 64);
        assert_eq!(available(&manager), Some(192));
    }

    #[test]
    fn test_reallocate_grow_copies() {
        let manager = test_manager(256);
        let mut buffer = manager.allocate(16).unwrap();
        let _blocker = manager.allocate(16).unwrap();
        buffer.put_slice(b"data").unwrap();
        let mut buffer = manager.reallocate(buffer, 32).unwrap();
        assert_eq!(buffer.capacity(), 32);
        assert_eq!(buffer.position(), 4);
        assert_eq!(manager.allocated(), 48);
        buffer.flip();
        assert_eq!(buffer.chunk(), b"data");
    }

    #[test]
    fn test_reallocate_shrink() {
        let manager = test_manager(256);
        let mut buffer = manager.allocate(64).unwrap();
        buffer.put_slice(&[1; 40]).unwrap();
        let buffer = manager.reallocate(buffer, 32).unwrap();
        assert_eq!(buffer.capacity(), 32);
        assert_eq!(buffer.position(), 32);
        assert_eq!(buffer.limit(), 32);
        assert_eq!(manager.allocated(), 32);
        assert_eq!(available(&manager), Some(224));
    }

    #[test]
    fn test_reallocate_unpooled() {
        let manager = test_manager(256);
        let buffer = Buffer::copy_from_slice(b"abc");
        let mut buffer = manager.reallocate(buffer, 8).unwrap();
        assert!(buffer.is_pooled());
        assert_eq!(buffer.capacity(), 8);
        buffer.set_limit(3).unwrap();
        assert_eq!(buffer.chunk(), b"abc");
    }

    #[test]
    fn test_wrap() {
        let manager = test_manager(64);
        let buffer = manager.wrap(Bytes::from_static(b"wrapped"));
        assert!(!buffer.is_pooled());
        assert!(buffer.is_read_only());
        assert_eq!(manager.allocated(), 0);
        assert_eq!(buffer.dispose(), Err(Error::DisposeNotAllowed));
    }

    #[test]
    fn test_drop_on_other_thread() {
        let manager = test_manager(128);
        let buffer = manager.allocate(32).unwrap();
        thread::spawn(move || drop(buffer)).join().unwrap();
        assert_eq!(manager.allocated(), 0);
        // The other thread never touched this thread's arena
        assert_eq!(available(&manager), Some(96));
    }

    #[test]
    fn test_arenas_per_thread() {
        let manager = test_manager(128);
        let _local = manager.allocate(100).unwrap();
        let remote = {
            let manager = manager.clone();
            thread::spawn(move || {
                let buffer = manager.allocate(100).unwrap();
                (buffer.capacity(), available(&manager))
            })
            .join()
            .unwrap()
        };
        assert_eq!(remote, (100, Some(28)));
        assert_eq!(available(&manager), Some(28));
    }

    #[test]
    fn test_managers_have_separate_arenas() {
        let first = test_manager(64);
        let second = test_manager(64);
        let _a = first.allocate(10).unwrap();
        let _b = second.allocate(20).unwrap();
        assert_eq!(available(&first), Some(54));
        assert_eq!(available(&second), Some(44));
    }

    #[test]
    fn test_buffer_outlives_manager() {
        let manager = test_manager(64);
        let mut buffer = manager.allocate(8).unwrap();
        drop(manager);
        buffer.put_slice(b"still ok").unwrap();
        buffer.trim();
        assert_eq!(buffer.chunk(), b"still ok");
    }

    #[test]
    fn test_metrics() {
        let mut registry = test_registry();
        let manager = HeapMemoryManager::new(
            Config {
                arena_size: NZUsize!(64),
            },
            &mut registry,
        );
        let _small = manager.allocate(8).unwrap();
        let _large = manager.allocate(128).unwrap();

        let mut encoded = String::new();
        encode(&mut encoded, &registry).unwrap();
        assert!(encoded.contains("allocated_bytes 136"));
        assert!(encoded.contains("arena_allocations_total 1"));
        assert!(encoded.contains("direct_allocations_total 1"));
        assert!(encoded.contains("arenas_total 1"));
    }
}
