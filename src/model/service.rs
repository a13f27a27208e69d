//! GATT service definition exposed by the peripheral.

use crate::core::constants::{
    CLIENT_CHARACTERISTIC_CONFIG_UUID, HEARTRATE_MEASUREMENT_UUID, HEARTRATE_SERVICE_UUID,
};
use crate::model::measurement::HeartRateMeasurement;
use crate::model::sample::HeartRateSample;
use uuid::Uuid;

/// Encoding used for characteristic values.
///
/// Only one encoding exists; the tag is kept so a descriptor states explicitly
/// what its peers must expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// Flags byte followed by a `u16` little-endian BPM.
    HeartRateMeasurement,
}

impl WireFormat {
    pub fn encode(&self, sample: &HeartRateSample, contact_supported: bool) -> Vec<u8> {
        match self {
            WireFormat::HeartRateMeasurement => HeartRateMeasurement::from_sample(
                sample,
                contact_supported,
            )
            .encode()
            .to_vec(),
        }
    }
}

/// Immutable description of the advertised service.
///
/// Built once at startup; fields are private so nothing can swap the wire
/// format under connected peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    cccd_uuid: Uuid,
    wire_format: WireFormat,
}

impl ServiceDescriptor {
    pub fn new(service_uuid: Uuid, characteristic_uuid: Uuid, wire_format: WireFormat) -> Self {
        Self {
            service_uuid,
            characteristic_uuid,
            cccd_uuid: CLIENT_CHARACTERISTIC_CONFIG_UUID,
            wire_format,
        }
    }

    /// The standard Heart Rate Service with its measurement characteristic.
    pub fn heart_rate() -> Self {
        Self::new(
            HEARTRATE_SERVICE_UUID,
            HEARTRATE_MEASUREMENT_UUID,
            WireFormat::HeartRateMeasurement,
        )
    }

    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    pub fn characteristic_uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    /// Descriptor a central writes to enable notifications.
    pub fn cccd_uuid(&self) -> Uuid {
        self.cccd_uuid
    }

    pub fn wire_format(&self) -> WireFormat {
        self.wire_format
    }
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        Self::heart_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample::SensorAccuracy;

    #[test]
    fn test_heart_rate_descriptor() {
        let desc = ServiceDescriptor::heart_rate();
        assert_eq!(
            desc.service_uuid().to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            desc.characteristic_uuid().to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            desc.cccd_uuid().to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_wire_format_encode() {
        let sample = HeartRateSample::now(120, SensorAccuracy::Medium);
        assert_eq!(
            WireFormat::HeartRateMeasurement.encode(&sample, true),
            vec![0b11, 120, 0]
        );
    }
}
