use btleplug::api::bleuuid::uuid_from_u16;
use std::time::Duration;
use uuid::Uuid;

/// UUID for the Heart Rate Service.
pub const HEARTRATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);
/// UUID for the Heart Rate Measurement Characteristic.
pub const HEARTRATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2A37);
/// UUID for the Client Characteristic Configuration Descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = uuid_from_u16(0x2902);

/// Highest heart rate the sensor may plausibly report.
pub const MAX_BPM: u16 = 300;

/// CCCD value enabling notifications.
pub const CCCD_NOTIFY_ENABLE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications.
pub const CCCD_INDICATE_ENABLE: [u8; 2] = [0x02, 0x00];
/// CCCD value disabling both.
pub const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(2);
/// Floor for the delay between two advertising attempts.
pub const MIN_ADVERTISE_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_ADVERTISE_BACKOFF_MAX: Duration = Duration::from_secs(30);
