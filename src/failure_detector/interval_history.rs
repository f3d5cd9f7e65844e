use std::collections::VecDeque;

/// Sliding window over the most recent `N` intervals (in seconds). Sum and sum of squares are
///  maintained incrementally so that mean and standard deviation are cheap to read on every
///  phi calculation.
pub struct IntervalHistory<const N: usize> {
    intervals: VecDeque<f64>,
    sum: f64,
    square_sum: f64,
}

impl<const N: usize> IntervalHistory<N> {
    pub fn new() -> IntervalHistory<N> {
        IntervalHistory {
            intervals: VecDeque::with_capacity(N),
            sum: 0.0,
            square_sum: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn add(&mut self, interval: f64) {
        if self.intervals.len() == N {
            if let Some(evicted) = self.intervals.pop_front() {
                self.sum -= evicted;
                self.square_sum -= evicted * evicted;
            }
        }

        self.intervals.push_back(interval);
        self.sum += interval;
        self.square_sum += interval * interval;
    }

    pub fn mean(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        self.sum / self.intervals.len() as f64
    }

    /// sample standard deviation, 0 for fewer than two values
    pub fn std_dev(&self) -> f64 {
        let n = self.intervals.len();
        if n < 2 {
            return 0.0;
        }

        let mean = self.mean();
        let variance = (self.square_sum - mean * mean * n as f64) / (n - 1) as f64;

        // incremental sums can drift slightly below zero for constant input
        variance.max(0.0).sqrt()
    }
}

impl<const N: usize> Default for IntervalHistory<N> {
    fn default() -> Self {
        Self::new()
    }
}
