use std::collections::VecDeque;
use tracing::error;

use super::Event;

/// Bounded ring buffer of pending events (spec §4.A). `post_event` drops the
/// event and logs an error when the buffer is already at capacity; overflow
/// never corrupts the machine's state.
#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    items: VecDeque<Event>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Enqueue `event`, returning `false` (and logging) if the queue was full.
    pub fn post(&mut self, event: Event) -> bool {
        if self.items.len() >= self.capacity {
            error!(?event, capacity = self.capacity, "event queue full, dropping event");
            return false;
        }
        self.items.push_back(event);
        true
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_and_keeps_earlier_events() {
        let mut q = EventQueue::new(2);
        assert!(q.post(Event::Ok));
        assert!(q.post(Event::Failed));
        assert!(!q.post(Event::Wait));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(Event::Ok));
        assert_eq!(q.pop(), Some(Event::Failed));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn capacity_sixteen_drops_seventeenth() {
        let mut q = EventQueue::new(16);
        for _ in 0..16 {
            assert!(q.post(Event::Ok));
        }
        assert!(!q.post(Event::Ok));
        assert_eq!(q.len(), 16);
    }
}
