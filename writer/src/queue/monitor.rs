use crate::Error;

/// One-shot callback waiting for the reserved total of a queue to satisfy a
/// predicate.
pub trait Monitor: Send + 'static {
    /// Returns whether the monitor is satisfied by `reserved` bytes.
    fn should_notify(&self, reserved: usize) -> bool;

    /// The predicate was satisfied.
    fn on_notify(self: Box<Self>);

    /// The queue will never satisfy the predicate (e.g. the connection closed).
    fn on_error(self: Box<Self>, error: Error);
}

/// Identifies a registered [Monitor].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MonitorId(u64);

/// Registered monitors of one queue.
#[derive(Default)]
pub(crate) struct Monitors {
    next: u64,
    entries: Vec<(MonitorId, Box<dyn Monitor>)>,
}

impl Monitors {
    pub fn insert(&mut self, monitor: Box<dyn Monitor>) -> MonitorId {
        let id = MonitorId(self.next);
        self.next += 1;
        self.entries.push((id, monitor));
        id
    }

    pub fn get(&self, id: MonitorId) -> Option<&dyn Monitor> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, monitor)| monitor.as_ref())
    }

    pub fn remove(&mut self, id: MonitorId) -> Option<Box<dyn Monitor>> {
        let index = self.entries.iter().position(|(entry, _)| *entry == id)?;
        Some(self.entries.remove(index).1)
    }

    /// Remove and return every monitor satisfied by `reserved`, in registration
    /// order.
    pub fn take_satisfied(&mut self, reserved: usize) -> Vec<Box<dyn Monitor>> {
        let mut satisfied = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].1.should_notify(reserved) {
                satisfied.push(self.entries.remove(index).1);
            } else {
                index += 1;
            }
        }
        satisfied
    }

    pub fn take_all(&mut self) -> Vec<Box<dyn Monitor>> {
        self.entries.drain(..).map(|(_, monitor)| monitor).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Fire `monitors` in order.
pub(crate) fn notify(monitors: Vec<Box<dyn Monitor>>) {
    for monitor in monitors {
        monitor.on_notify();
    }
}
