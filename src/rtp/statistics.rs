//! Rolling inter-arrival statistics for paced sources

use std::collections::VecDeque;
use std::time::Duration;

/// Average of the last `window` measured durations
#[derive(Debug, Clone)]
pub struct Statistics {
    samples: VecDeque<Duration>,
    window: usize,
    sum: Duration,
}

impl Statistics {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            sum: Duration::ZERO,
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// Zero until the first sample
    pub fn average(&self) -> Duration {
        match self.samples.len() {
            0 => Duration::ZERO,
            n => self.sum / n as u32,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = Duration::ZERO;
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new(50)
    }
}
