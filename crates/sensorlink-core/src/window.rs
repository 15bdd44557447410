//! Fixed-size sliding windows with incrementally maintained sums.
//!
//! Each quantity gets its own bounded FIFO of the most recent samples. The
//! running sum is updated by one addition per push and one subtraction per
//! eviction; it is never recomputed by scanning the window.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::ConfigError;
use crate::record::{Record, Tag};

/// Default number of samples per window.
pub const DEFAULT_WINDOW_SIZE: usize = 50;

/// When a full window surfaces its average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPolicy {
    /// Report once, on the push that first brings the window to capacity.
    /// Later pushes evict but never report again for the lifetime of the window.
    #[default]
    FirstFill,
    /// Report on every push once the window is at capacity.
    EveryFullWindow,
}

/// Bounded FIFO of samples plus their running sum.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    values: VecDeque<f64>,
    sum: f64,
    policy: ReportPolicy,
}

impl SlidingWindow {
    pub fn new(capacity: usize, policy: ReportPolicy) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::EmptyWindow);
        }
        Ok(Self::with_capacity(capacity, policy))
    }

    fn with_capacity(capacity: usize, policy: ReportPolicy) -> Self {
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity + 1),
            sum: 0.0,
            policy,
        }
    }

    /// Append a sample, evicting the oldest once over capacity.
    ///
    /// Returns the window mean when the policy says this push reports.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let was_full = self.is_full();

        self.values.push_back(value);
        self.sum += value;
        if self.values.len() > self.capacity {
            if let Some(oldest) = self.values.pop_front() {
                self.sum -= oldest;
            }
        }

        let report = match self.policy {
            ReportPolicy::FirstFill => !was_full && self.is_full(),
            ReportPolicy::EveryFullWindow => self.is_full(),
        };
        report.then(|| self.sum / self.capacity as f64)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Running sum of the held samples.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Mean of the held samples, `None` while empty.
    pub fn mean(&self) -> Option<f64> {
        (!self.values.is_empty()).then(|| self.sum / self.values.len() as f64)
    }

    /// Held samples, oldest first.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
    }
}

/// A surfaced window average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowAverage {
    pub tag: Tag,
    pub mean: f64,
    pub samples: usize,
}

/// One sliding window per tag.
#[derive(Debug, Clone)]
pub struct Aggregator {
    windows: [SlidingWindow; 4],
}

impl Aggregator {
    pub fn new(window_size: usize, policy: ReportPolicy) -> Result<Self, ConfigError> {
        let window = SlidingWindow::new(window_size, policy)?;
        Ok(Self {
            windows: [window.clone(), window.clone(), window.clone(), window],
        })
    }

    /// Route a record into its tag's window.
    pub fn push(&mut self, record: Record) -> Option<WindowAverage> {
        let window = &mut self.windows[record.tag.index()];
        window.push(record.value).map(|mean| WindowAverage {
            tag: record.tag,
            mean,
            samples: window.capacity(),
        })
    }

    pub fn window(&self, tag: Tag) -> &SlidingWindow {
        &self.windows[tag.index()]
    }

    pub fn clear(&mut self) {
        for window in &mut self.windows {
            window.clear();
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        let window = SlidingWindow::with_capacity(DEFAULT_WINDOW_SIZE, ReportPolicy::default());
        Self {
            windows: [window.clone(), window.clone(), window.clone(), window],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            SlidingWindow::new(0, ReportPolicy::FirstFill).unwrap_err(),
            ConfigError::EmptyWindow
        );
    }

    #[test]
    fn test_first_fill_boundary() {
        let mut w = SlidingWindow::new(50, ReportPolicy::FirstFill).unwrap();
        for i in 1..=49 {
            assert_eq!(w.push(i as f64), None, "push {i} must not report");
        }
        let avg = w.push(50.0).expect("50th push reports");
        assert_eq!(avg, w.sum() / 50.0);
        assert_eq!(avg, 25.5);
        assert_eq!(w.push(51.0), None);
        for i in 52..=500 {
            assert_eq!(w.push(i as f64), None);
        }
        assert_eq!(w.len(), 50);
    }

    #[test]
    fn test_every_full_window_reports_each_push_once_full() {
        let mut w = SlidingWindow::new(3, ReportPolicy::EveryFullWindow).unwrap();
        assert_eq!(w.push(1.0), None);
        assert_eq!(w.push(2.0), None);
        assert_eq!(w.push(3.0), Some(2.0));
        assert_eq!(w.push(4.0), Some(3.0));
        assert_eq!(w.push(5.0), Some(4.0));
    }

    #[test]
    fn test_fifo_eviction_order() {
        let mut w = SlidingWindow::new(3, ReportPolicy::FirstFill).unwrap();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            w.push(v);
        }
        assert_eq!(w.values().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
        assert_eq!(w.sum(), 12.0);
        assert_eq!(w.mean(), Some(4.0));
    }

    #[test]
    fn test_sum_tracks_contents_over_many_pushes() {
        let mut w = SlidingWindow::new(50, ReportPolicy::FirstFill).unwrap();
        // Deterministic LCG mapped onto [0, 360).
        let mut state: u64 = 0x2545_F491_4F6C_DD1D;
        for i in 0..5000 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let value = (state >> 11) as f64 / (1u64 << 53) as f64 * 360.0;
            w.push(value);

            let exact: f64 = w.values().sum();
            assert!(
                (w.sum() - exact).abs() <= 1e-9 * exact.abs().max(1.0),
                "push {i}: running sum {} drifted from {exact}",
                w.sum()
            );
            assert!(w.len() <= 50);
        }
    }

    #[test]
    fn test_sum_exact_for_integer_samples() {
        let mut w = SlidingWindow::new(7, ReportPolicy::FirstFill).unwrap();
        for i in 0..1200 {
            w.push((i % 97) as f64);
            let exact: f64 = w.values().sum();
            assert_eq!(w.sum(), exact);
        }
    }

    #[test]
    fn test_clear_resets_first_fill() {
        let mut w = SlidingWindow::new(2, ReportPolicy::FirstFill).unwrap();
        w.push(1.0);
        assert_eq!(w.push(3.0), Some(2.0));
        w.clear();
        assert!(w.is_empty());
        assert_eq!(w.mean(), None);
        assert_eq!(w.push(5.0), None);
        assert_eq!(w.push(7.0), Some(6.0));
    }

    #[test]
    fn test_aggregator_windows_are_independent() {
        let mut agg = Aggregator::new(2, ReportPolicy::FirstFill).unwrap();
        let az = |value| Record {
            tag: Tag::Azimuth,
            value,
        };
        let hu = |value| Record {
            tag: Tag::Humidity,
            value,
        };

        assert_eq!(agg.push(az(10.0)), None);
        assert_eq!(agg.push(hu(50.0)), None);
        assert_eq!(
            agg.push(az(20.0)),
            Some(WindowAverage {
                tag: Tag::Azimuth,
                mean: 15.0,
                samples: 2
            })
        );
        assert_eq!(agg.window(Tag::Humidity).len(), 1);
        assert_eq!(agg.window(Tag::Elevation).len(), 0);
    }

    #[test]
    fn test_default_aggregator_uses_default_size() {
        let agg = Aggregator::default();
        for tag in Tag::ALL {
            assert_eq!(agg.window(tag).capacity(), DEFAULT_WINDOW_SIZE);
        }
    }
}
