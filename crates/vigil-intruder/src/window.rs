use std::collections::VecDeque;

/// Fixed-capacity record of whether each recent processed frame held an
/// unknown face. Always holds exactly `capacity` entries, newest first.
#[derive(Debug, Clone)]
pub struct IntruderWindow {
    slots: VecDeque<bool>,
    capacity: usize,
    hits: usize,
}

impl IntruderWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: std::iter::repeat(false).take(capacity).collect(),
            capacity,
            hits: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of `true` slots.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Records the newest frame and evicts the oldest.
    pub fn push(&mut self, unknown_seen: bool) {
        if let Some(evicted) = self.slots.pop_back() {
            if evicted {
                self.hits -= 1;
            }
        }
        self.slots.push_front(unknown_seen);
        if unknown_seen {
            self.hits += 1;
        }
    }

    pub fn all_true(&self) -> bool {
        self.hits == self.capacity
    }

    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = false);
        self.hits = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.slots.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_all_false_at_capacity() {
        let window = IntruderWindow::new(4);
        assert_eq!(window.len(), 4);
        assert_eq!(window.hits(), 0);
        assert!(!window.all_true());
    }

    #[test]
    fn push_keeps_length_and_puts_newest_first() {
        let mut window = IntruderWindow::new(3);
        window.push(true);
        window.push(false);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![false, true, false]);
        for _ in 0..10 {
            window.push(true);
            assert_eq!(window.len(), 3);
        }
        assert!(window.all_true());
    }

    #[test]
    fn single_false_breaks_the_run() {
        let mut window = IntruderWindow::new(3);
        window.push(true);
        window.push(true);
        window.push(false);
        window.push(true);
        window.push(true);
        assert!(!window.all_true());
        window.push(true);
        assert!(window.all_true());
    }

    #[test]
    fn reset_clears_every_slot() {
        let mut window = IntruderWindow::new(2);
        window.push(true);
        window.push(true);
        window.reset();
        assert_eq!(window.len(), 2);
        assert_eq!(window.hits(), 0);
        assert!(window.iter().all(|slot| !slot));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut window = IntruderWindow::new(0);
        assert_eq!(window.capacity(), 1);
        window.push(true);
        assert!(window.all_true());
    }
}
