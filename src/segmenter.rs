//! Partitioning a duration into contiguous, bounded time windows.

use crate::config::MIN_WINDOW_SECS;

/// One slice of the source: `start` and `length` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct TimeWindow {
    pub start: f64,
    pub length: f64,
}

impl TimeWindow {
    pub fn end(&self) -> f64 {
        self.start + self.length
    }
}

/// Lazily yields windows of `length` seconds covering `total` seconds. The last window
/// is shortened to the remainder and dropped entirely if under one second.
#[derive(Debug, Clone)]
pub struct Windows {
    total: f64,
    length: f64,
    start: f64,
}

impl Windows {
    /// `length` must already be clamped into the configured segment bounds.
    pub fn new(total: f64, length: f64) -> Self {
        let total = if total.is_finite() { total } else { 0.0 };
        Self {
            total,
            length: length.max(MIN_WINDOW_SECS),
            start: 0.0,
        }
    }
}

impl Iterator for Windows {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        if self.start >= self.total {
            return None;
        }
        let length = self.length.min(self.total - self.start);
        if length < MIN_WINDOW_SECS {
            self.start = self.total;
            return None;
        }
        let window = TimeWindow {
            start: self.start,
            length,
        };
        self.start += length;
        Some(window)
    }
}

/// Eager form of [`Windows`]. `requested` is clamped into `[min, max]` first.
pub fn segment(total_duration: f64, requested: f64, min: f64, max: f64) -> Vec<TimeWindow> {
    let length = if requested.is_finite() {
        requested.clamp(min, max)
    } else {
        max
    };
    Windows::new(total_duration, length).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(windows: &[TimeWindow]) -> Vec<(f64, f64)> {
        windows.iter().map(|w| (w.start, w.length)).collect()
    }

    #[test]
    fn twenty_five_seconds_by_ten() {
        let w = segment(25.0, 10.0, 5.0, 15.0);
        assert_eq!(pairs(&w), vec![(0.0, 10.0), (10.0, 10.0), (20.0, 5.0)]);
    }

    #[test]
    fn short_source_gives_single_window() {
        let w = segment(10.0, 15.0, 5.0, 15.0);
        assert_eq!(pairs(&w), vec![(0.0, 10.0)]);
    }

    #[test]
    fn requested_length_is_clamped() {
        let w = segment(40.0, 60.0, 5.0, 15.0);
        assert_eq!(w[0].length, 15.0);
        let w = segment(40.0, 1.0, 5.0, 15.0);
        assert_eq!(w[0].length, 5.0);
    }

    #[test]
    fn zero_or_negative_duration_is_empty() {
        assert!(segment(0.0, 10.0, 5.0, 15.0).is_empty());
        assert!(segment(-3.0, 10.0, 5.0, 15.0).is_empty());
        assert!(segment(f64::NAN, 10.0, 5.0, 15.0).is_empty());
    }

    #[test]
    fn trailing_sliver_is_dropped() {
        let w = segment(20.4, 10.0, 5.0, 15.0);
        assert_eq!(pairs(&w), vec![(0.0, 10.0), (10.0, 10.0)]);
    }

    #[test]
    fn source_under_one_second_is_empty() {
        assert!(segment(0.8, 10.0, 5.0, 15.0).is_empty());
    }

    #[test]
    fn windows_are_contiguous_and_cover_the_duration() {
        let durations = [0.5, 1.0, 4.99, 9.97, 10.0, 33.333, 61.2, 125.04, 3599.9];
        for &total in &durations {
            for requested in 5..=15 {
                let w = segment(total, requested as f64, 5.0, 15.0);
                for pair in w.windows(2) {
                    assert_eq!(pair[0].start + pair[0].length, pair[1].start);
                }
                for window in &w {
                    assert!(window.length >= MIN_WINDOW_SECS);
                    assert!(window.start >= 0.0);
                    assert!(window.end() <= total + 1e-9);
                }
                let covered = w.last().map(TimeWindow::end).unwrap_or(0.0);
                assert!(
                    total - covered < MIN_WINDOW_SECS,
                    "total={total} requested={requested} covered={covered}"
                );
            }
        }
    }

    #[test]
    fn iterator_is_lazy_and_finite() {
        let mut it = Windows::new(1e9, 15.0);
        assert_eq!(it.next().map(|w| w.start), Some(0.0));
        assert_eq!(it.next().map(|w| w.start), Some(15.0));
    }
}
