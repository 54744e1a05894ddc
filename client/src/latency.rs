//! Rolling round-trip history for game data frames

use std::collections::VecDeque;

/// Keeps the most recent round trips of sent input frames
#[derive(Debug, Clone)]
pub struct LatencyHistory {
    samples: VecDeque<f32>,
    max_samples: usize,
}

impl LatencyHistory {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&mut self, ping_ms: f32) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(ping_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f32>() / self.samples.len() as f32)
    }

    pub fn min(&self) -> Option<f32> {
        self.samples.iter().copied().reduce(f32::min)
    }

    pub fn max(&self) -> Option<f32> {
        self.samples.iter().copied().reduce(f32::max)
    }
}

impl Default for LatencyHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_statistics() {
        let mut history = LatencyHistory::new(10);
        assert!(history.average().is_none());

        for ping in [10.0, 20.0, 30.0] {
            history.record(ping);
        }
        assert_approx_eq!(history.average().unwrap(), 20.0);
        assert_approx_eq!(history.min().unwrap(), 10.0);
        assert_approx_eq!(history.max().unwrap(), 30.0);
    }

    #[test]
    fn test_oldest_samples_are_evicted() {
        let mut history = LatencyHistory::new(2);
        history.record(100.0);
        history.record(10.0);
        history.record(20.0);
        assert_eq!(history.len(), 2);
        assert_approx_eq!(history.average().unwrap(), 15.0);
    }
}
