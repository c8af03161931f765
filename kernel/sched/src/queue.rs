//! The ready queue.
//!
//! A single FIFO: priorities are recorded on threads and processes but
//! deliberately not consulted, so scheduling order is purely
//! first-posted-first-served.

extern crate alloc;

use alloc::collections::VecDeque;

use muon_core::id::Tid;

/// FIFO queue of READY threads.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    queue: VecDeque<Tid>,
}

impl ReadyQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    /// Appends a thread at the tail.
    pub fn push(&mut self, tid: Tid) {
        self.queue.push_back(tid);
    }

    /// Removes and returns the head.
    pub fn pop(&mut self) -> Option<Tid> {
        self.queue.pop_front()
    }

    /// Removes a specific thread wherever it sits in the queue.
    pub fn remove(&mut self, tid: Tid) {
        self.queue.retain(|&t| t != tid);
    }

    /// Returns `true` if no thread is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if `tid` is queued.
    #[must_use]
    pub fn contains(&self, tid: Tid) -> bool {
        self.queue.contains(&tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_on_creation() {
        let mut q = ReadyQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn fifo_order() {
        let mut q = ReadyQueue::new();
        q.push(Tid(1));
        q.push(Tid(2));
        q.push(Tid(3));
        assert_eq!(q.pop(), Some(Tid(1)));
        assert_eq!(q.pop(), Some(Tid(2)));
        assert_eq!(q.pop(), Some(Tid(3)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn remove_from_middle() {
        let mut q = ReadyQueue::new();
        q.push(Tid(1));
        q.push(Tid(2));
        q.push(Tid(3));
        q.remove(Tid(2));
        assert_eq!(q.len(), 2);
        assert!(!q.contains(Tid(2)));
        assert_eq!(q.pop(), Some(Tid(1)));
        assert_eq!(q.pop(), Some(Tid(3)));
    }

    #[test]
    fn remove_head_and_tail() {
        let mut q = ReadyQueue::new();
        q.push(Tid(1));
        q.push(Tid(2));
        q.push(Tid(3));
        q.remove(Tid(1));
        q.remove(Tid(3));
        assert_eq!(q.pop(), Some(Tid(2)));
        assert!(q.is_empty());
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut q = ReadyQueue::new();
        q.push(Tid(1));
        q.remove(Tid(9));
        assert_eq!(q.len(), 1);
    }
}
