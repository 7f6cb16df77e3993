//! Bounded in-memory logs
//!
//! `BoundedLog` is a fixed-capacity ring buffer: the backing slots are
//! allocated once and a head index tracks the oldest entry, so inserting
//! past capacity overwrites (evicts) the oldest record first.

use crate::models::{DiagnosticsEntry, ReceiveLogEntry, SendLogEntry};
use crate::state::{new_state, Shared};

pub const LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, head: 0, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends an entry, returning the evicted oldest entry when full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let capacity = self.capacity();
        if self.len < capacity {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = Some(entry);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(entry);
            self.head = (self.head + 1) % capacity;
            evicted
        }
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, entries: I) {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (front, back) = self.slots.split_at(self.head);
        back.iter().chain(front.iter()).filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        let (front, back) = self.slots.split_at_mut(self.head);
        back.iter_mut().chain(front.iter_mut()).filter_map(Option::as_mut)
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.iter().cloned().collect()
    }
}

/// The three monitor-fed logs, each behind its own lock.
#[derive(Clone)]
pub struct LogStores {
    pub diagnostics: Shared<BoundedLog<DiagnosticsEntry>>,
    pub sendlog: Shared<BoundedLog<SendLogEntry>>,
    pub receivelog: Shared<BoundedLog<ReceiveLogEntry>>,
}

impl LogStores {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            diagnostics: new_state(BoundedLog::new(capacity)),
            sendlog: new_state(BoundedLog::new(capacity)),
            receivelog: new_state(BoundedLog::new(capacity)),
        }
    }
}

impl Default for LogStores {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let mut log = BoundedLog::new(LOG_CAPACITY);
        for i in 0..=500 {
            log.push(format!("e{i}"));
        }

        assert_eq!(log.len(), 500);
        assert!(!log.iter().any(|e| e == "e0"));
        assert!(log.iter().any(|e| e == "e500"));
        assert_eq!(log.iter().next().map(String::as_str), Some("e1"));
        assert_eq!(log.iter().last().map(String::as_str), Some("e500"));
    }

    #[test]
    fn test_push_reports_evicted_entry() {
        let mut log = BoundedLog::new(2);
        assert_eq!(log.push(1), None);
        assert_eq!(log.push(2), None);
        assert_eq!(log.push(3), Some(1));
        assert_eq!(log.to_vec(), vec![2, 3]);
    }

    #[test]
    fn test_order_survives_wraparound() {
        let mut log = BoundedLog::new(3);
        log.extend(0..7);
        assert_eq!(log.to_vec(), vec![4, 5, 6]);

        for value in log.iter_mut() {
            *value *= 10;
        }
        assert_eq!(log.to_vec(), vec![40, 50, 60]);
    }

    #[test]
    fn test_partial_fill() {
        let mut log: BoundedLog<u8> = BoundedLog::new(4);
        assert!(log.is_empty());
        log.push(7);
        assert_eq!(log.to_vec(), vec![7]);
        assert_eq!(log.capacity(), 4);
    }
}
