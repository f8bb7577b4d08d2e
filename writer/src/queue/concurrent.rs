use super::{
    monitor::{notify, Monitors},
    Monitor, MonitorId, TaskQueue,
};
use crossbeam_queue::{ArrayQueue, SegQueue};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

/// A [TaskQueue] for many producers and a single consumer.
///
/// Tasks are kept in a lock-free [SegQueue] and the reserved total in an atomic
/// counter. Monitors sit behind a mutex that is only taken when at least one
/// monitor is registered.
pub struct Concurrent<T> {
    queue: SegQueue<T>,
    current: ArrayQueue<T>,
    reserved: AtomicUsize,
    monitors: Mutex<Monitors>,
    monitor_count: AtomicUsize,
}

impl<T> Default for Concurrent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Concurrent<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            current: ArrayQueue::new(1),
            reserved: AtomicUsize::new(0),
            monitors: Mutex::new(Monitors::default()),
            monitor_count: AtomicUsize::new(0),
        }
    }
}

impl<T: Send> TaskQueue<T> for Concurrent<T> {
    fn reserve_space(&self, bytes: usize) -> usize {
        self.reserved.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    fn release_space(&self, bytes: usize) -> usize {
        let previous = self.reserved.fetch_sub(bytes, Ordering::SeqCst);
        debug_assert!(previous >= bytes, "released more than reserved");
        previous - bytes
    }

    fn release_space_and_notify(&self, bytes: usize) -> usize {
        let total = self.release_space(bytes);

        // Pairs with the counter increment in `add_monitor`: either that call
        // sees the released total or this one sees the monitor.
        if self.monitor_count.load(Ordering::SeqCst) == 0 {
            return total;
        }
        let satisfied = {
            let mut monitors = self.monitors.lock().unwrap();
            let satisfied = monitors.take_satisfied(self.reserved.load(Ordering::SeqCst));
            self.monitor_count.store(monitors.len(), Ordering::SeqCst);
            satisfied
        };
        notify(satisfied);
        total
    }

    fn space_in_bytes(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    fn offer(&self, task: T) {
        self.queue.push(task);
    }

    fn poll(&self) -> Option<T> {
        self.queue.pop()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn set_current(&self, task: T) {
        let replaced = self.current.force_push(task);
        debug_assert!(replaced.is_none(), "current element already set");
    }

    fn take_current(&self) -> Option<T> {
        self.current.pop()
    }

    fn has_current(&self) -> bool {
        !self.current.is_empty()
    }

    fn add_monitor(&self, monitor: Box<dyn Monitor>) -> Option<MonitorId> {
        let mut monitors = self.monitors.lock().unwrap();
        let id = monitors.insert(monitor);
        self.monitor_count.store(monitors.len(), Ordering::SeqCst);

        // Pairs with the counter load in `release_space_and_notify`: space
        // released before the store above is visible here.
        let reserved = self.reserved.load(Ordering::SeqCst);
        if monitors
            .get(id)
            .is_some_and(|monitor| monitor.should_notify(reserved))
        {
            let monitor = monitors.remove(id);
            self.monitor_count.store(monitors.len(), Ordering::SeqCst);
            drop(monitors);
            if let Some(monitor) = monitor {
                monitor.on_notify();
            }
            return None;
        }
        Some(id)
    }

    fn remove_monitor(&self, id: MonitorId) -> bool {
        let mut monitors = self.monitors.lock().unwrap();
        let removed = monitors.remove(id).is_some();
        self.monitor_count.store(monitors.len(), Ordering::SeqCst);
        removed
    }

    fn take_monitors(&self) -> Vec<Box<dyn Monitor>> {
        let mut monitors = self.monitors.lock().unwrap();
        self.monitor_count.store(0, Ordering::SeqCst);
        monitors.take_all()
    }
}
