use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Values stored in a [TimeQueue] know the simulation step at which they become due.
pub trait DueStep {
    fn due_step(&self) -> u64;
}

struct Entry<T> {
    due: u64,
    // insertion order, so that values due in the same step come out first-in-first-out
    order: u64,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // reversed, BinaryHeap is a max heap and we want the earliest step on top
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.order.cmp(&self.order))
    }
}

pub struct TimeQueue<T: DueStep> {
    q: BinaryHeap<Entry<T>>,
    next_order: u64,
}

impl<T: DueStep> Default for TimeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DueStep> TimeQueue<T> {
    pub fn new() -> Self {
        TimeQueue {
            q: BinaryHeap::new(),
            next_order: 0,
        }
    }

    pub fn add(&mut self, value: T) {
        let due = value.due_step();
        self.q.push(Entry {
            due,
            order: self.next_order,
            value,
        });
        self.next_order += 1;
    }

    /// Removes and returns all values which are due at or before `now`.
    pub fn pop(&mut self, now: u64) -> Vec<T> {
        let mut result = Vec::new();
        while self.q.peek().is_some_and(|entry| entry.due <= now) {
            if let Some(entry) = self.q.pop() {
                result.push(entry.value);
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn clear(&mut self) {
        self.q.clear();
        self.next_order = 0;
    }
}
