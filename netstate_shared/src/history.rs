//! Bounded history ring.
//!
//! Backs the predicted command/state history on the client and the snapshot
//! history on the authority. Memory never grows past the configured capacity:
//! pushing onto a full ring evicts the oldest entry and hands it back to the
//! caller.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct History<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> History<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an entry, returning the evicted oldest one if the ring was full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn newest(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries.get_mut(index)
    }

    /// Index of the newest entry matching `pred`, oldest being 0.
    pub fn position_newest(&self, pred: impl Fn(&T) -> bool) -> Option<usize> {
        self.entries.iter().rposition(|e| pred(e))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    /// Newest entry matching `pred`.
    pub fn find_newest(&self, pred: impl Fn(&T) -> bool) -> Option<&T> {
        self.entries.iter().rev().find(|e| pred(e))
    }

    pub fn retain(&mut self, pred: impl FnMut(&T) -> bool) {
        self.entries.retain(pred);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ring_evicts_oldest_first() {
        let mut h = History::new(3);
        assert_eq!(h.push(1), None);
        assert_eq!(h.push(2), None);
        assert_eq!(h.push(3), None);
        assert_eq!(h.push(4), Some(1));
        assert_eq!(h.len(), 3);
        assert_eq!(h.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(h.newest(), Some(&4));
    }

    #[test]
    fn find_newest_prefers_latest_match() {
        let mut h = History::new(8);
        for v in [1, 5, 3, 5, 2] {
            h.push(v);
        }
        assert_eq!(h.find_newest(|v| *v <= 3), Some(&2));
        assert_eq!(h.find_newest(|v| *v > 10), None);
    }

    #[test]
    fn overwrite_by_position_or_append() {
        let mut h = History::new(4);
        for v in [10, 20, 30] {
            h.push(v);
        }
        let i = h.position_newest(|v| *v == 20).unwrap();
        *h.get_mut(i).unwrap() = 21;
        assert_eq!(h.position_newest(|v| *v == 40), None);
        h.push(40);
        assert_eq!(h.iter().copied().collect::<Vec<_>>(), vec![10, 21, 30, 40]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut h = History::new(0);
        h.push('a');
        assert_eq!(h.push('b'), Some('a'));
        assert_eq!(h.len(), 1);
    }
}
