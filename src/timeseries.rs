use crate::decoder::SignalSample;
use std::collections::VecDeque;

/// Number of samples kept for the live display
pub const DEFAULT_WINDOW_LEN: usize = 20;

// Bars are scaled against at least this value so quiet signals stay small
const DISPLAY_FLOOR: u8 = 100;

/// Fixed-capacity FIFO of the most recent samples, oldest first
#[derive(Debug, Clone)]
pub struct SampleWindow {
    data: VecDeque<SignalSample>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: SignalSample) {
        if self.data.len() == self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn last(&self) -> Option<SignalSample> {
        self.data.back().copied()
    }

    /// Copy of the window contents in arrival order
    pub fn values(&self) -> Vec<u8> {
        self.data.iter().map(|s| s.value()).collect()
    }
}

/// Upper bound used when drawing copied-out window values as bars
pub fn display_max(values: &[u8]) -> u8 {
    values.iter().copied().max().unwrap_or(0).max(DISPLAY_FLOOR)
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_LEN)
    }
}
