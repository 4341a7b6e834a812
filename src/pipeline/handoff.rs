use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Outcome of a bounded wait on a [`Handoff`].
#[derive(Debug, PartialEq, Eq)]
pub enum Take<K, T> {
    Item(K, T),
    TimedOut,
    Closed,
}

/// Keyed single-slot hand-off between producers and one consumer.
///
/// Each key holds at most one value. Depositing under a key whose previous
/// value was not collected yet overwrites it, so only the most recent result
/// per key is ever consumed. Keys are collected in the order they first became
/// occupied. Depositing never waits for the consumer.
#[derive(Debug)]
pub struct Handoff<K, T> {
    state: Mutex<Slots<K, T>>,
    ready: Condvar,
}

#[derive(Debug)]
struct Slots<K, T> {
    order: VecDeque<K>,
    values: HashMap<K, T>,
    closed: bool,
}

impl<K: Eq + Hash + Clone, T> Default for Handoff<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, T> Handoff<K, T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Slots {
                order: VecDeque::new(),
                values: HashMap::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<K, T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `value` under `key`, returning the uncollected value it
    /// overwrote. Deposits after [`close`](Self::close) are discarded.
    pub fn deposit(&self, key: K, value: T) -> Option<T> {
        let mut slots = self.lock();
        if slots.closed {
            return None;
        }
        let replaced = slots.values.insert(key.clone(), value);
        if replaced.is_none() {
            slots.order.push_back(key);
        }
        drop(slots);
        self.ready.notify_one();
        replaced
    }

    /// Waits up to `timeout` for a value.
    pub fn take_timeout(&self, timeout: Duration) -> Take<K, T> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.lock();
        loop {
            if let Some((key, value)) = slots.pop() {
                return Take::Item(key, value);
            }
            if slots.closed {
                return Take::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Take::TimedOut;
            }
            slots = self
                .ready
                .wait_timeout(slots, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Stops accepting deposits. Values already stored can still be taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash, T> Slots<K, T> {
    fn pop(&mut self) -> Option<(K, T)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(value) = self.values.remove(&key) {
                return Some((key, value));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn next<K: Eq + Hash + Clone, T>(handoff: &Handoff<K, T>) -> Take<K, T> {
        handoff.take_timeout(Duration::from_millis(10))
    }

    #[test]
    fn later_deposit_overwrites_uncollected_one() {
        let handoff = Handoff::new();
        assert_eq!(handoff.deposit("a.cc", 1), None);
        assert_eq!(handoff.deposit("a.cc", 2), Some(1));
        assert_eq!(handoff.len(), 1);
        assert_eq!(next(&handoff), Take::Item("a.cc", 2));
        assert_eq!(next(&handoff), Take::TimedOut);
    }

    #[test]
    fn keys_are_collected_in_deposit_order() {
        let handoff = Handoff::new();
        handoff.deposit("b.cc", 1);
        handoff.deposit("a.cc", 2);
        handoff.deposit("b.cc", 3);
        assert_eq!(next(&handoff), Take::Item("b.cc", 3));
        assert_eq!(next(&handoff), Take::Item("a.cc", 2));
        assert!(handoff.is_empty());
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let handoff = Handoff::new();
        handoff.deposit(1u32, "x");
        handoff.close();
        assert_eq!(handoff.deposit(2u32, "y"), None);
        assert_eq!(next(&handoff), Take::Item(1, "x"));
        assert_eq!(next(&handoff), Take::Closed);
    }

    #[test]
    fn blocked_consumer_wakes_on_deposit() {
        let handoff = Arc::new(Handoff::new());
        let consumer = {
            let handoff = Arc::clone(&handoff);
            thread::spawn(move || handoff.take_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        handoff.deposit("unit", 7);
        assert_eq!(consumer.join().unwrap(), Take::Item("unit", 7));
    }
}
