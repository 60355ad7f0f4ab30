use std::collections::VecDeque;

/// Fixed-capacity ring buffer used for rolling samples and retained inbound messages.
///
/// Memory is bounded by `capacity`; pushing onto a full buffer evicts the oldest entry
/// and hands it back to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircularBuffer<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `item`, returning the entry it displaced (or `item` itself at capacity 0).
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.buffer.len() == self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(item);
        evicted
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.buffer.iter()
    }

    pub fn front(&self) -> Option<&T> {
        self.buffer.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.buffer.drain(..)
    }
}

impl<'a, T> IntoIterator for &'a CircularBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffer.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_evicts_oldest_at_capacity() {
        let mut buf = CircularBuffer::new(3);
        assert_eq!(buf.push(1), None);
        assert_eq!(buf.push(2), None);
        assert_eq!(buf.push(3), None);
        assert!(buf.is_full());
        assert_eq!(buf.push(4), Some(1));
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(buf.front(), Some(&2));
        assert_eq!(buf.back(), Some(&4));
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let mut buf = CircularBuffer::new(0);
        assert_eq!(buf.push("x"), Some("x"));
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_empties_in_order() {
        let mut buf = CircularBuffer::new(4);
        for i in 0..6 {
            buf.push(i);
        }
        assert_eq!(buf.drain().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 4);
    }
}
