//! Heart Rate Measurement Wire Format
//!
//! Every notification and read response carries exactly three bytes:
//!
//! | byte | meaning                                                       |
//! |------|---------------------------------------------------------------|
//! | 0    | flags: bit 0 contact supported, bit 1 contact detected        |
//! | 1..3 | heart rate in BPM, `u16` little-endian                        |
//!
//! The layout never changes for the life of a service.

use crate::core::error::WireError;
use crate::model::sample::HeartRateSample;
use crate::{get_u16_little_endian, is_bit_set};
use serde::{Deserialize, Serialize};
use std::fmt;

const CONTACT_SUPPORTED_BIT: u8 = 0;
const CONTACT_DETECTED_BIT: u8 = 1;
const KNOWN_FLAGS: u8 = (1 << CONTACT_SUPPORTED_BIT) | (1 << CONTACT_DETECTED_BIT);

/// Encoded length of a measurement.
pub const MEASUREMENT_LEN: usize = 3;

/// Skin contact status carried in the flags byte.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorContact {
    pub supported: bool,
    pub detected: bool,
}

/// A decoded Heart Rate Measurement characteristic value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateMeasurement {
    /// Heart rate value in beats per minute (BPM).
    pub bpm: u16,
    pub contact: SensorContact,
}

impl HeartRateMeasurement {
    pub fn new(bpm: u16, contact: SensorContact) -> Self {
        Self { bpm, contact }
    }

    /// Builds the measurement for an accepted sample.
    ///
    /// Contact detection is only claimed when the sensor supports it.
    pub fn from_sample(sample: &HeartRateSample, contact_supported: bool) -> Self {
        Self {
            bpm: sample.bpm,
            contact: SensorContact {
                supported: contact_supported,
                detected: contact_supported && sample.contact_detected(),
            },
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.contact.supported {
            flags |= 1 << CONTACT_SUPPORTED_BIT;
        }
        if self.contact.detected {
            flags |= 1 << CONTACT_DETECTED_BIT;
        }
        flags
    }

    /// Encodes the measurement into its fixed three-byte form.
    pub fn encode(&self) -> [u8; MEASUREMENT_LEN] {
        let [lsb, msb] = self.bpm.to_le_bytes();
        [self.flags(), lsb, msb]
    }

    /// Decodes a characteristic value.
    ///
    /// Trailing bytes are ignored; unknown flag bits are rejected.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < MEASUREMENT_LEN {
            return Err(WireError::Truncated(data.len()));
        }
        let flags = data[0];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(WireError::UnknownFlags(flags));
        }
        Ok(Self {
            bpm: get_u16_little_endian!(data, 1),
            contact: SensorContact {
                supported: is_bit_set!(flags, CONTACT_SUPPORTED_BIT),
                detected: is_bit_set!(flags, CONTACT_DETECTED_BIT),
            },
        })
    }
}

impl fmt::Display for HeartRateMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bpm (flags 0b{:08b}", self.bpm, self.flags())?;
        if self.contact.supported {
            write!(
                f,
                ", contact {}",
                if self.contact.detected { "detected" } else { "lost" }
            )?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample::SensorAccuracy;

    #[test]
    fn test_round_trip_contact_detected() {
        let msg = HeartRateMeasurement::new(
            75,
            SensorContact {
                supported: true,
                detected: true,
            },
        );
        let decoded = HeartRateMeasurement::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.bpm, 75);
        assert!(decoded.contact.detected);
    }

    #[test]
    fn test_encoding_layout() {
        let msg = HeartRateMeasurement::new(
            0x012C,
            SensorContact {
                supported: true,
                detected: false,
            },
        );
        assert_eq!(msg.encode(), [0b01, 0x2C, 0x01]);
    }

    #[test]
    fn test_from_sample() {
        let sample = HeartRateSample::now(82, SensorAccuracy::High);
        let msg = HeartRateMeasurement::from_sample(&sample, true);
        assert_eq!(msg.encode(), [0b11, 82, 0]);

        let msg = HeartRateMeasurement::from_sample(&sample, false);
        assert_eq!(msg.encode(), [0b00, 82, 0]);

        let unreliable = HeartRateSample::now(82, SensorAccuracy::Unreliable);
        let msg = HeartRateMeasurement::from_sample(&unreliable, true);
        assert!(msg.contact.supported);
        assert!(!msg.contact.detected);
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(
            HeartRateMeasurement::decode(&[0x03, 75]),
            Err(WireError::Truncated(2))
        );
        assert_eq!(
            HeartRateMeasurement::decode(&[]),
            Err(WireError::Truncated(0))
        );
    }

    #[test]
    fn test_decode_unknown_flags() {
        assert_eq!(
            HeartRateMeasurement::decode(&[0x10, 75, 0]),
            Err(WireError::UnknownFlags(0x10))
        );
    }

    #[test]
    fn test_display() {
        let msg = HeartRateMeasurement::new(
            64,
            SensorContact {
                supported: true,
                detected: true,
            },
        );
        assert_eq!(msg.to_string(), "64 bpm (flags 0b00000011, contact detected)");
    }
}
