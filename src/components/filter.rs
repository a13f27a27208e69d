//! Sample Filter
//!
//! Drops sensor glitches and hides unreliable readings while reliable ones are
//! still fresh. Unreliable readings pass again once no `Medium`/`High` sample
//! was accepted for a whole grace period, so the stream never goes silent on a
//! loose strap.

use crate::core::constants::{DEFAULT_GRACE_PERIOD, MAX_BPM};
use crate::model::sample::{HeartRateSample, SensorAccuracy};
use log::trace;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SampleFilter {
    grace_period: Duration,
    /// Timestamp of the last accepted `Medium`/`High` sample.
    last_reliable: Option<Instant>,
}

impl Default for SampleFilter {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl SampleFilter {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            last_reliable: None,
        }
    }

    /// Validates a raw sample.
    ///
    /// # Returns
    /// The sample unchanged if it passes, `None` if it must be dropped.
    pub fn accept(&mut self, raw: HeartRateSample) -> Option<HeartRateSample> {
        if raw.bpm == 0 || raw.bpm > MAX_BPM {
            trace!("rejecting out-of-range reading of {} bpm", raw.bpm);
            return None;
        }
        match raw.accuracy {
            SensorAccuracy::Unreliable if self.reliable_within_grace(raw.timestamp) => {
                trace!("rejecting unreliable reading of {} bpm", raw.bpm);
                return None;
            }
            accuracy if accuracy.is_reliable() => self.last_reliable = Some(raw.timestamp),
            _ => {}
        }
        Some(raw)
    }

    fn reliable_within_grace(&self, now: Instant) -> bool {
        self.last_reliable
            .is_some_and(|at| now.saturating_duration_since(at) < self.grace_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bpm: u16, accuracy: SensorAccuracy, at: Instant) -> HeartRateSample {
        HeartRateSample::new(bpm, accuracy, at)
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut filter = SampleFilter::default();
        let now = Instant::now();
        for bpm in [0, 301, 302, 1000, u16::MAX] {
            assert!(filter.accept(sample(bpm, SensorAccuracy::High, now)).is_none());
        }
    }

    #[test]
    fn test_reliable_pass_through() {
        let mut filter = SampleFilter::default();
        let now = Instant::now();
        for bpm in 1..=MAX_BPM {
            for accuracy in [SensorAccuracy::Medium, SensorAccuracy::High] {
                let raw = sample(bpm, accuracy, now);
                assert_eq!(filter.accept(raw), Some(raw));
            }
        }
    }

    #[test]
    fn test_low_accuracy_is_accepted() {
        let mut filter = SampleFilter::default();
        let now = Instant::now();
        filter.accept(sample(70, SensorAccuracy::High, now));
        let low = sample(71, SensorAccuracy::Low, now + Duration::from_secs(1));
        assert_eq!(filter.accept(low), Some(low));
    }

    #[test]
    fn test_unreliable_accepted_without_history() {
        let mut filter = SampleFilter::default();
        let raw = sample(80, SensorAccuracy::Unreliable, Instant::now());
        assert_eq!(filter.accept(raw), Some(raw));
    }

    #[test]
    fn test_unreliable_suppressed_within_grace() {
        let mut filter = SampleFilter::new(Duration::from_secs(10));
        let start = Instant::now();
        assert!(filter
            .accept(sample(70, SensorAccuracy::Medium, start))
            .is_some());
        assert!(filter
            .accept(sample(140, SensorAccuracy::Unreliable, start + Duration::from_secs(9)))
            .is_none());
    }

    #[test]
    fn test_unreliable_fallback_after_grace() {
        let mut filter = SampleFilter::new(Duration::from_secs(10));
        let start = Instant::now();
        filter.accept(sample(70, SensorAccuracy::High, start));
        let late = sample(75, SensorAccuracy::Unreliable, start + Duration::from_secs(10));
        assert_eq!(filter.accept(late), Some(late));
    }

    #[test]
    fn test_low_does_not_extend_grace() {
        let mut filter = SampleFilter::new(Duration::from_secs(10));
        let start = Instant::now();
        filter.accept(sample(70, SensorAccuracy::High, start));
        filter.accept(sample(71, SensorAccuracy::Low, start + Duration::from_secs(8)));
        let late = sample(72, SensorAccuracy::Unreliable, start + Duration::from_secs(11));
        assert_eq!(filter.accept(late), Some(late));
    }
}
