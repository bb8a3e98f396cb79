//! Pending queue and completed history for cleanup operations

use crate::core::models::CleanupPriority;
use std::collections::VecDeque;

/// Strict-priority queue, FIFO within a tier
#[derive(Debug)]
pub struct PriorityQueue<T> {
    tiers: [VecDeque<T>; 4],
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            tiers: std::array::from_fn(|_| VecDeque::new()),
        }
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn tier_index(priority: CleanupPriority) -> usize {
        match priority {
            CleanupPriority::Critical => 0,
            CleanupPriority::High => 1,
            CleanupPriority::Medium => 2,
            CleanupPriority::Low => 3,
        }
    }

    pub fn push(&mut self, priority: CleanupPriority, item: T) {
        self.tiers[Self::tier_index(priority)].push_back(item);
    }

    /// Oldest item of the highest non-empty tier
    pub fn pop(&mut self) -> Option<T> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Items in dequeue order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.tiers.iter().flat_map(|tier| tier.iter())
    }
}

/// Fixed-capacity history that evicts the oldest entry
#[derive(Debug)]
pub struct CompletedRing<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> CompletedRing<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The newest `limit` entries, oldest first
    pub fn recent(&self, limit: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(limit))
    }
}
