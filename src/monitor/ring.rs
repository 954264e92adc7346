//! Time-windowed event ring
//!
//! Bounded by both count and age. Events are appended in arrival order, so
//! the oldest live at the front and pruning only touches the head.

use std::collections::VecDeque;

/// Anything carrying an epoch-millisecond timestamp
pub trait Timestamped {
    fn timestamp_ms(&self) -> u64;
}

/// Bounded, time-windowed event store
///
/// Not synchronized; owners wrap it in a lock.
#[derive(Debug, Clone)]
pub struct MetricRing<T> {
    events: VecDeque<T>,
    capacity: usize,
    max_age_ms: u64,
}

impl<T: Timestamped + Clone> MetricRing<T> {
    /// Create a ring holding at most `capacity` events younger than `max_age_ms`
    pub fn new(capacity: usize, max_age_ms: u64) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            max_age_ms,
        }
    }

    /// Append an event, then drop anything past the age or count bound.
    ///
    /// Returns the number of events dropped.
    pub fn push(&mut self, event: T, now_ms: u64) -> usize {
        self.events.push_back(event);
        let mut dropped = self.prune(now_ms);
        while self.events.len() > self.capacity {
            self.events.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Drop events at or beyond the age bound
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let before = self.events.len();
        while let Some(front) = self.events.front() {
            if now_ms.saturating_sub(front.timestamp_ms()) < self.max_age_ms {
                break;
            }
            self.events.pop_front();
        }
        before - self.events.len()
    }

    /// Events strictly newer than `from_ms`, oldest first
    pub fn since(&self, from_ms: u64) -> Vec<T> {
        let start = self
            .events
            .iter()
            .position(|e| e.timestamp_ms() > from_ms)
            .unwrap_or(self.events.len());
        self.events.range(start..).cloned().collect()
    }

    /// Copy of every held event
    pub fn snapshot(&self) -> Vec<T> {
        self.events.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tick(u64);

    impl Timestamped for Tick {
        fn timestamp_ms(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_age_bound() {
        let mut ring = MetricRing::new(100, 1_000);
        ring.push(Tick(100), 100);
        ring.push(Tick(600), 600);
        assert_eq!(ring.len(), 2);

        // 100 is exactly max_age old at t=1100
        let dropped = ring.push(Tick(1_100), 1_100);
        assert_eq!(dropped, 1);
        assert_eq!(ring.snapshot(), vec![Tick(600), Tick(1_100)]);
    }

    #[test]
    fn test_count_bound() {
        let mut ring = MetricRing::new(3, u64::MAX);
        for t in 1..=5 {
            ring.push(Tick(t), t);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), vec![Tick(3), Tick(4), Tick(5)]);
    }

    #[test]
    fn test_since_window() {
        let mut ring = MetricRing::new(10, 10_000);
        for t in [1_000, 2_000, 3_000, 4_000] {
            ring.push(Tick(t), t);
        }
        assert_eq!(ring.since(2_000), vec![Tick(3_000), Tick(4_000)]);
        assert!(ring.since(4_000).is_empty());
        assert_eq!(ring.since(0).len(), 4);
    }

    #[test]
    fn test_prune_without_push() {
        let mut ring = MetricRing::new(10, 500);
        ring.push(Tick(0), 0);
        ring.push(Tick(400), 400);
        assert_eq!(ring.prune(950), 2);
        assert!(ring.is_empty());
    }
}
