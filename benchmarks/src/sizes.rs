//! Message size progression shared by the benchmarks.

/// Repetitions for one message size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationCounts {
    /// Measured iterations
    pub iterations: usize,
    /// Warm-up iterations run before the measured ones
    pub skip: usize,
}

impl IterationCounts {
    pub fn total(&self) -> usize {
        self.iterations + self.skip
    }
}

/// Sizes from `min` to `max`, doubling each step. A zero minimum starts
/// the sequence at one byte.
#[derive(Debug, Clone)]
pub struct MessageSizes {
    next: Option<usize>,
    max: usize,
}

impl MessageSizes {
    pub fn new(min: usize, max: usize) -> MessageSizes {
        MessageSizes {
            next: Some(min.max(1)),
            max,
        }
    }
}

impl Iterator for MessageSizes {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let size = self.next?;
        if size > self.max {
            self.next = None;
            return None;
        }
        self.next = size.checked_mul(2);
        Some(size)
    }
}

/// Which sizes run and how often each one is repeated.
///
/// Sizes strictly above `large_message_size` switch to the `large` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSchedule {
    pub min_size: usize,
    pub max_size: usize,
    pub small: IterationCounts,
    pub large: IterationCounts,
    pub large_message_size: usize,
}

impl SizeSchedule {
    pub fn sizes(&self) -> MessageSizes {
        MessageSizes::new(self.min_size, self.max_size)
    }

    pub fn counts(&self, size: usize) -> IterationCounts {
        if size > self.large_message_size {
            self.large
        } else {
            self.small
        }
    }

    /// Every epoch as `(size, counts)`, in increasing size order.
    pub fn epochs(&self) -> impl Iterator<Item = (usize, IterationCounts)> + '_ {
        self.sizes().map(move |size| (size, self.counts(size)))
    }

    /// Largest `iterations + skip` over all epochs.
    pub fn max_total(&self) -> usize {
        self.epochs().map(|(_, counts)| counts.total()).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(min: usize, max: usize, large_message_size: usize) -> SizeSchedule {
        SizeSchedule {
            min_size: min,
            max_size: max,
            small: IterationCounts { iterations: 100, skip: 10 },
            large: IterationCounts { iterations: 10, skip: 1 },
            large_message_size,
        }
    }

    #[test]
    fn test_doubling_from_zero() {
        let sizes: Vec<usize> = MessageSizes::new(0, 16).collect();
        assert_eq!(sizes, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_max_below_min_is_empty() {
        assert_eq!(MessageSizes::new(64, 32).count(), 0);
        assert_eq!(MessageSizes::new(1, 0).count(), 0);
    }

    #[test]
    fn test_single_size() {
        let sizes: Vec<usize> = MessageSizes::new(8, 8).collect();
        assert_eq!(sizes, vec![8]);
        let sizes: Vec<usize> = MessageSizes::new(5, 15).collect();
        assert_eq!(sizes, vec![5, 10]);
    }

    #[test]
    fn test_no_overflow_at_top() {
        let top = usize::MAX / 2 + 1;
        let sizes: Vec<usize> = MessageSizes::new(top, usize::MAX).collect();
        assert_eq!(sizes, vec![top]);
    }

    #[test]
    fn test_large_counts_start_above_threshold() {
        let schedule = schedule(1, 64, 16);
        let epochs: Vec<(usize, usize)> = schedule
            .epochs()
            .map(|(size, counts)| (size, counts.iterations))
            .collect();
        assert_eq!(
            epochs,
            vec![(1, 100), (2, 100), (4, 100), (8, 100), (16, 100), (32, 10), (64, 10)]
        );
        assert_eq!(schedule.max_total(), 110);
    }

    #[test]
    fn test_empty_schedule_total() {
        assert_eq!(schedule(8, 4, 16).max_total(), 0);
    }
}
