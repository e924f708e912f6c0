use std::collections::VecDeque;

use crate::types::Shape;

/// Parameter vectors kept for constant-velocity prediction.
pub const PARAMETER_HISTORY: usize = 2;

/// Position snapshots kept for convergence detection.
pub const POSITION_HISTORY: usize = 10;

/// Fixed-capacity FIFO; pushing onto a full history evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entry `i`, oldest first.
    pub fn get(&self, i: usize) -> Option<&T> {
        self.entries.get(i)
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

/// Movement of the landmark centroid across the position history.
///
/// Averages the coordinate sums of the first and last five snapshots and
/// returns the squared difference divided by the history length. `None`
/// until the history holds ten snapshots.
pub fn convergence_measure(history: &BoundedHistory<Shape>) -> Option<f64> {
    if history.len() < POSITION_HISTORY {
        return None;
    }

    let half = POSITION_HISTORY / 2;
    let average = |range: std::ops::Range<usize>| {
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        for shape in history.iter().skip(range.start).take(range.len()) {
            let s = shape.coordinate_sum();
            sum_x += s.x;
            sum_y += s.y;
        }
        (sum_x / half as f64, sum_y / half as f64)
    };

    let (older_x, older_y) = average(0..half);
    let (newer_x, newer_y) = average(half..POSITION_HISTORY);
    let dx = newer_x - older_x;
    let dy = newer_y - older_y;
    Some((dx * dx + dy * dy) / history.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    fn snapshot(x: f64) -> Shape {
        Shape::new(vec![Point::new(x, 0.0), Point::new(x, 1.0)])
    }

    #[test]
    fn eviction_is_fifo() {
        let mut history = BoundedHistory::new(POSITION_HISTORY);
        for i in 0..11 {
            history.push(snapshot(i as f64));
        }
        assert_eq!(history.len(), 10);
        assert!(history.is_full());
        assert_eq!(history.get(0).unwrap()[0].x, 1.0);
        assert_eq!(history.latest().unwrap()[0].x, 10.0);
    }

    #[test]
    fn parameter_history_keeps_two() {
        let mut history = BoundedHistory::new(PARAMETER_HISTORY);
        history.push(1);
        history.push(2);
        history.push(3);
        assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn convergence_needs_full_history() {
        let mut history = BoundedHistory::new(POSITION_HISTORY);
        for _ in 0..9 {
            history.push(snapshot(3.0));
        }
        assert!(convergence_measure(&history).is_none());
        history.push(snapshot(3.0));
        assert_eq!(convergence_measure(&history), Some(0.0));
    }

    #[test]
    fn convergence_reflects_drift() {
        let mut history = BoundedHistory::new(POSITION_HISTORY);
        for i in 0..10 {
            history.push(snapshot(if i < 5 { 0.0 } else { 1.0 }));
        }
        // two landmarks moved by 1 in x: summed dx = 2, 2² / 10
        let m = convergence_measure(&history).unwrap();
        assert!((m - 0.4).abs() < 1e-12);
    }

    #[test]
    fn clear_empties() {
        let mut history = BoundedHistory::new(2);
        history.push(1.0);
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.capacity(), 2);
    }
}
