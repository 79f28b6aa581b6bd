//! Progress rendering for terminal output.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const BAR_FILL: char = '\u{2588}';
const BAR_EMPTY: char = '-';

/// Renders `|███---| 42.0%` for `completed` of `total` units.
///
/// `total == 0` renders as an empty bar at 0%.
pub fn render_progress_bar(completed: u64, total: u64, width: usize) -> String {
    let completed = completed.min(total);
    let (filled, percent) = if total == 0 {
        (0, 0.0)
    } else {
        (
            (width as u64 * completed / total) as usize,
            100.0 * completed as f64 / total as f64,
        )
    };
    let mut bar = String::with_capacity(width * 3 + 16);
    bar.push('|');
    bar.extend(std::iter::repeat_n(BAR_FILL, filled));
    bar.extend(std::iter::repeat_n(BAR_EMPTY, width - filled));
    bar.push_str(&format!("| {percent:.1}%"));
    bar
}

/// Transfer rate over a sliding time window.
///
/// Keeps the running byte total at each sample, so the rate is the growth of
/// that total between the oldest and newest retained sample. Bytes reported
/// by the oldest sample happened before the window opened and do not count.
#[derive(Debug)]
pub struct SpeedCalculator {
    /// `(instant, cumulative bytes)`, oldest first.
    samples: VecDeque<(Instant, u64)>,
    total: u64,
    window: Duration,
    max_samples: usize,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 100)
    }
}

impl SpeedCalculator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            total: 0,
            window,
            max_samples: max_samples.max(2),
        }
    }

    /// Records `bytes` transferred since the previous sample.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(Instant::now(), bytes);
    }

    fn add_sample_at(&mut self, now: Instant, bytes: u64) {
        self.total = self.total.saturating_add(bytes);
        self.samples.push_back((now, self.total));

        if let Some(cutoff) = now.checked_sub(self.window) {
            while self.samples.len() > 2
                && self.samples.front().is_some_and(|(t, _)| *t < cutoff)
            {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Bytes per second across the retained window; 0.0 until two samples
    /// at distinct instants exist.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = t1.saturating_duration_since(t0);
        if elapsed.is_zero() {
            return 0.0;
        }
        (b1 - b0) as f64 / elapsed.as_secs_f64()
    }

    /// Time left for `remaining_bytes` at the current rate.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        (speed > 0.0).then(|| Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_empty_half_full() {
        assert_eq!(render_progress_bar(0, 4, 4), "|----| 0.0%");
        assert_eq!(render_progress_bar(2, 4, 4), "|\u{2588}\u{2588}--| 50.0%");
        assert_eq!(
            render_progress_bar(4, 4, 4),
            "|\u{2588}\u{2588}\u{2588}\u{2588}| 100.0%"
        );
    }

    #[test]
    fn bar_clamps_and_handles_zero_total() {
        assert_eq!(render_progress_bar(9, 4, 2), "|\u{2588}\u{2588}| 100.0%");
        assert_eq!(render_progress_bar(0, 0, 3), "|---| 0.0%");
    }

    #[test]
    fn no_rate_before_two_samples() {
        let mut calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());

        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn first_sample_bytes_are_not_counted() {
        let mut calc = SpeedCalculator::default();
        let t0 = Instant::now();
        calc.add_sample_at(t0, 4096);
        calc.add_sample_at(t0 + Duration::from_secs(1), 1000);
        calc.add_sample_at(t0 + Duration::from_secs(2), 1000);

        assert!((calc.bytes_per_second() - 1000.0).abs() < 1e-9);
        let eta = calc.eta(5000).unwrap();
        assert_eq!(eta.as_secs(), 5);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let mut calc = SpeedCalculator::new(Duration::from_secs(2), 100);
        let t0 = Instant::now();
        calc.add_sample_at(t0, 0);
        calc.add_sample_at(t0 + Duration::from_secs(1), 10_000);
        for s in 2..=6 {
            calc.add_sample_at(t0 + Duration::from_secs(s), 100);
        }
        // Only seconds 4..=6 remain: 200 bytes over 2 s.
        assert!((calc.bytes_per_second() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn sample_count_is_capped() {
        let mut calc = SpeedCalculator::new(Duration::from_secs(60), 5);
        let t0 = Instant::now();
        for i in 0..20 {
            calc.add_sample_at(t0 + Duration::from_millis(i * 10), 10);
        }
        assert_eq!(calc.samples.len(), 5);
        assert!(calc.bytes_per_second() > 0.0);
    }
}
