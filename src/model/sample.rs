//! Heart-rate samples as handed over by the host sensor framework.

use tokio::time::Instant;

/// Confidence the sensor attaches to a reading.
///
/// Ordered from least to most trustworthy, so `accuracy >= SensorAccuracy::Medium`
/// reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorAccuracy {
    Unreliable,
    Low,
    Medium,
    High,
}

impl SensorAccuracy {
    /// Maps the host's integer status code to an accuracy.
    ///
    /// `-1` (no contact) and any unknown code are treated as unreliable.
    pub fn from_status(status: i32) -> Self {
        match status {
            1 => SensorAccuracy::Low,
            2 => SensorAccuracy::Medium,
            3 => SensorAccuracy::High,
            _ => SensorAccuracy::Unreliable,
        }
    }

    /// Whether the reading counts as reliable for the filter's grace window.
    pub fn is_reliable(&self) -> bool {
        *self >= SensorAccuracy::Medium
    }
}

/// A single heart-rate reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateSample {
    pub bpm: u16,
    pub timestamp: Instant,
    pub accuracy: SensorAccuracy,
}

impl HeartRateSample {
    pub fn new(bpm: u16, accuracy: SensorAccuracy, timestamp: Instant) -> Self {
        Self {
            bpm,
            timestamp,
            accuracy,
        }
    }

    /// Creates a sample stamped with the current instant.
    pub fn now(bpm: u16, accuracy: SensorAccuracy) -> Self {
        Self::new(bpm, accuracy, Instant::now())
    }

    /// Whether the sensor reported skin contact for this reading.
    pub fn contact_detected(&self) -> bool {
        self.accuracy > SensorAccuracy::Unreliable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert_eq!(SensorAccuracy::from_status(-1), SensorAccuracy::Unreliable);
        assert_eq!(SensorAccuracy::from_status(0), SensorAccuracy::Unreliable);
        assert_eq!(SensorAccuracy::from_status(1), SensorAccuracy::Low);
        assert_eq!(SensorAccuracy::from_status(2), SensorAccuracy::Medium);
        assert_eq!(SensorAccuracy::from_status(3), SensorAccuracy::High);
        assert_eq!(SensorAccuracy::from_status(42), SensorAccuracy::Unreliable);
    }

    #[test]
    fn test_ordering() {
        assert!(SensorAccuracy::High > SensorAccuracy::Medium);
        assert!(SensorAccuracy::Medium.is_reliable());
        assert!(!SensorAccuracy::Low.is_reliable());
    }

    #[test]
    fn test_contact_detected() {
        assert!(HeartRateSample::now(70, SensorAccuracy::Low).contact_detected());
        assert!(!HeartRateSample::now(70, SensorAccuracy::Unreliable).contact_detected());
    }
}
