use std::collections::VecDeque;

/// A fixed-capacity FIFO window. Positions are relative to the current head.
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> RingBuffer<T> {
        RingBuffer {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_remaining_capacity(&self) -> bool {
        self.items.len() < self.capacity
    }

    /// Returns the item back if the buffer is full
    pub fn push_tail(&mut self, item: T) -> Result<(), T> {
        if !self.has_remaining_capacity() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn pop_head(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// drops up to `n` items from the head, returning the number of dropped items
    pub fn move_head(&mut self, n: usize) -> usize {
        let n = n.min(self.items.len());
        self.items.drain(..n);
        n
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_capacity() {
        let mut buffer = RingBuffer::new(2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.push_tail(1), Ok(()));
        assert_eq!(buffer.push_tail(2), Ok(()));
        assert!(!buffer.has_remaining_capacity());
        assert_eq!(buffer.push_tail(3), Err(3));

        assert_eq!(buffer.pop_head(), Some(1));
        assert_eq!(buffer.push_tail(3), Ok(()));
        assert_eq!(buffer.get(0), Some(&2));
        assert_eq!(buffer.get(1), Some(&3));
        assert_eq!(buffer.get(2), None);
    }

    #[rstest]
    #[case::none(0, 0, vec![1, 2, 3])]
    #[case::some(2, 2, vec![3])]
    #[case::all(3, 3, vec![])]
    #[case::more_than_all(5, 3, vec![])]
    fn test_move_head(#[case] n: usize, #[case] expected_moved: usize, #[case] expected_rest: Vec<i32>) {
        let mut buffer = RingBuffer::new(4);
        for i in 1..=3 {
            buffer.push_tail(i).unwrap();
        }
        assert_eq!(buffer.move_head(n), expected_moved);
        let rest = (0..buffer.len()).map(|i| *buffer.get(i).unwrap()).collect::<Vec<_>>();
        assert_eq!(rest, expected_rest);
    }
}
