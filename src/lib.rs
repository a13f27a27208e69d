//! Heart-Rate Peripheral
//!
//! Core of a BLE heart-rate peripheral running on a wearable. Readings from
//! the host's sensor are filtered, encoded as heart-rate measurements and
//! notified to every subscribed central over a GATT server provided by the
//! host Bluetooth stack.

/// Core utilities shared by every module.
pub mod core {
    /// Runtime configuration.
    pub mod config;
    /// Assigned numbers and defaults.
    pub mod constants;
    /// Error taxonomy of the sensor and radio collaborators.
    pub mod error;
    /// Events consumed by the peripheral's owner task.
    pub mod events;
    /// Custom macros for bit handling.
    pub mod macros;
}

/// Traits at the boundary to the host platform and to observers.
pub mod api {
    /// Radio and sensor collaborators.
    pub mod host;
    /// Read-only view of the peripheral state.
    pub mod model;
}

/// Data models of the heart-rate domain.
pub mod model {
    /// Wire encoding of a heart-rate measurement.
    pub mod measurement;
    /// Connected centrals and their link state.
    pub mod peer;
    /// Raw sensor readings.
    pub mod sample;
    /// The advertised GATT service.
    pub mod service;
}

/// Components driving the peripheral.
pub mod components {
    /// Per-peer notification fan-out.
    pub mod dispatcher;
    /// Reading validation.
    pub mod filter;
    /// Cloneable front door to a running peripheral.
    pub mod handle;
    /// The peripheral and its event loop.
    pub mod peripheral;
    /// In-memory radio and sensor.
    pub mod simulation;
}
