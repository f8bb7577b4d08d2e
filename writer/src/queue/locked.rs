use super::{
    monitor::{notify, Monitors},
    Monitor, MonitorId, TaskQueue,
};
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

struct State<T> {
    queue: VecDeque<T>,
    current: Option<T>,
    reserved: usize,
    monitors: Monitors,
}

/// A [TaskQueue] guarded by a single mutex.
///
/// Suited to connections written by one thread at a time. [Locked::lock]
/// exposes the lock so several operations can be applied atomically.
pub struct Locked<T> {
    state: Mutex<State<T>>,
}

impl<T> Default for Locked<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Locked<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                current: None,
                reserved: 0,
                monitors: Monitors::default(),
            }),
        }
    }

    /// Acquire the queue's lock.
    ///
    /// Monitors satisfied by releases made through the guard fire once the
    /// guard is dropped, after the lock is released.
    pub fn lock(&self) -> Guard<'_, T> {
        Guard {
            state: Some(self.state.lock().unwrap()),
            satisfied: Vec::new(),
        }
    }
}

/// Exclusive access to a [Locked] queue.
pub struct Guard<'a, T> {
    state: Option<MutexGuard<'a, State<T>>>,
    satisfied: Vec<Box<dyn Monitor>>,
}

impl<T> Guard<'_, T> {
    fn state(&mut self) -> &mut State<T> {
        self.state.as_mut().expect("guard is held until dropped")
    }

    fn state_ref(&self) -> &State<T> {
        self.state.as_ref().expect("guard is held until dropped")
    }

    pub fn reserve_space(&mut self, bytes: usize) -> usize {
        let state = self.state();
        state.reserved += bytes;
        state.reserved
    }

    pub fn release_space(&mut self, bytes: usize) -> usize {
        let state = self.state();
        debug_assert!(state.reserved >= bytes, "released more than reserved");
        state.reserved -= bytes;
        state.reserved
    }

    pub fn release_space_and_notify(&mut self, bytes: usize) -> usize {
        let reserved = self.release_space(bytes);
        let satisfied = self.state().monitors.take_satisfied(reserved);
        self.satisfied.extend(satisfied);
        reserved
    }

    pub fn space_in_bytes(&self) -> usize {
        self.state_ref().reserved
    }

    pub fn offer(&mut self, task: T) {
        self.state().queue.push_back(task);
    }

    pub fn poll(&mut self) -> Option<T> {
        self.state().queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state_ref().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state_ref().queue.is_empty()
    }

    pub fn set_current(&mut self, task: T) {
        let replaced = self.state().current.replace(task);
        debug_assert!(replaced.is_none(), "current element already set");
    }

    pub fn take_current(&mut self) -> Option<T> {
        self.state().current.take()
    }

    pub fn has_current(&self) -> bool {
        self.state_ref().current.is_some()
    }
}

impl<T> Drop for Guard<'_, T> {
    fn drop(&mut self) {
        drop(self.state.take());
        notify(std::mem::take(&mut self.satisfied));
    }
}

impl<T: Send> TaskQueue<T> for Locked<T> {
    fn reserve_space(&self, bytes: usize) -> usize {
        self.lock().reserve_space(bytes)
    }

    fn release_space(&self, bytes: usize) -> usize {
        self.lock().release_space(bytes)
    }

    fn release_space_and_notify(&self, bytes: usize) -> usize {
        self.lock().release_space_and_notify(bytes)
    }

    fn space_in_bytes(&self) -> usize {
        self.lock().space_in_bytes()
    }

    fn offer(&self, task: T) {
        self.lock().offer(task);
    }

    fn poll(&self) -> Option<T> {
        self.lock().poll()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn set_current(&self, task: T) {
        self.lock().set_current(task);
    }

    fn take_current(&self) -> Option<T> {
        self.lock().take_current()
    }

    fn has_current(&self) -> bool {
        self.lock().has_current()
    }

    fn add_monitor(&self, monitor: Box<dyn Monitor>) -> Option<MonitorId> {
        let mut state = self.state.lock().unwrap();
        if monitor.should_notify(state.reserved) {
            drop(state);
            monitor.on_notify();
            return None;
        }
        Some(state.monitors.insert(monitor))
    }

    fn remove_monitor(&self, id: MonitorId) -> bool {
        self.state.lock().unwrap().monitors.remove(id).is_some()
    }

    fn take_monitors(&self) -> Vec<Box<dyn Monitor>> {
        self.state.lock().unwrap().monitors.take_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    /// Fires when the queue is empty, checking that the lock is free by then.
    struct Drained<T: Send + 'static> {
        queue: Arc<Locked<T>>,
        fired: Arc<AtomicBool>,
    }

    impl<T: Send + 'static> Monitor for Drained<T> {
        fn should_notify(&self, reserved: usize) -> bool {
            reserved == 0
        }

        fn on_notify(self: Box<Self>) {
            assert!(self.queue.state.try_lock().is_ok(), "fired under lock");
            self.fired.store(true, Ordering::SeqCst);
        }

        fn on_error(self: Box<Self>, _: Error) {}
    }

    #[test]
    fn test_guard_brackets_operations() {
        let queue = Locked::new();
        {
            let mut guard = queue.lock();
            let total = guard.reserve_space(3);
            assert_eq!(total, 3);
            guard.offer("a");
            guard.reserve_space(4);
            guard.offer("b");
            assert_eq!(guard.len(), 2);
            assert_eq!(guard.space_in_bytes(), 7);
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.poll(), Some("a"));
    }

    #[test]
    fn test_monitors_fire_after_unlock() {
        let queue = Arc::new(Locked::<u8>::new());
        let fired = Arc::new(AtomicBool::new(false));
        queue.reserve_space(5);
        queue
            .add_monitor(Box::new(Drained {
                queue: queue.clone(),
                fired: fired.clone(),
            }))
            .unwrap();

        let mut guard = queue.lock();
        guard.release_space_and_notify(5);
        assert!(!fired.load(Ordering::SeqCst));
        drop(guard);
        assert!(fired.load(Ordering::SeqCst));
    }
}
