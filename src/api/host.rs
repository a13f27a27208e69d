//! Host Collaborator API
//!
//! The peripheral never talks to a radio or a sensor directly. The host
//! platform implements [`BleHost`] and drives the peripheral through the
//! callback traits, which [`PeripheralHandle`](crate::components::handle::PeripheralHandle)
//! implements.

use crate::core::config::AdvertiseSettings;
use crate::core::error::{BleError, NotifyFailure, SensorError};
use crate::core::events::ConnectionState;
use crate::model::sample::SensorAccuracy;
use crate::model::service::ServiceDescriptor;
use async_trait::async_trait;
use btleplug::api::BDAddr;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque handle of an opened GATT server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerHandle(pub u64);

/// Radio control offered by the host Bluetooth stack.
#[async_trait]
pub trait BleHost: Send + Sync + 'static {
    /// Registers the service and starts delivering server callbacks.
    ///
    /// # Arguments
    /// - `descriptor`: The service to expose.
    /// - `callbacks`: Receiver of connection, descriptor and read events.
    async fn open_server(
        &self,
        descriptor: &ServiceDescriptor,
        callbacks: Box<dyn GattServerCallbacks>,
    ) -> Result<ServerHandle, BleError>;

    /// Unregisters the service. Callbacks stop after this returns.
    async fn close_server(&self, server: ServerHandle);

    /// Starts connectable advertising of the service.
    ///
    /// # Returns
    /// `BleError::RadioUnavailable` if the radio is already advertising, off,
    /// or cannot advertise; `BleError::AdvertiseFailed` with the host code
    /// for any other refusal.
    async fn advertise(
        &self,
        descriptor: &ServiceDescriptor,
        local_name: &str,
        settings: &AdvertiseSettings,
    ) -> Result<(), BleError>;

    async fn stop_advertising(&self) -> Result<(), BleError>;

    /// Sends a characteristic value notification to one central.
    async fn notify(
        &self,
        peer: BDAddr,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), NotifyFailure>;

    /// Answers a characteristic read request.
    async fn send_read_response(
        &self,
        peer: BDAddr,
        request_id: u32,
        value: &[u8],
    ) -> Result<(), BleError>;
}

/// Callbacks the host's GATT server invokes.
///
/// Implementations must return quickly; they run on host threads.
pub trait GattServerCallbacks: Send + Sync {
    fn on_connection_state_change(&self, peer: BDAddr, state: ConnectionState);
    fn on_descriptor_write(&self, peer: BDAddr, descriptor: Uuid, value: Vec<u8>);
    fn on_notify_sent(&self, peer: BDAddr, result: Result<(), NotifyFailure>);
    fn on_characteristic_read_request(&self, peer: BDAddr, request_id: u32, offset: u16);
}

/// Callbacks the host's sensor framework invokes.
pub trait SensorCallbacks: Send + Sync {
    fn on_sample(&self, bpm: i32, accuracy: SensorAccuracy, timestamp: Instant);
    fn on_sensor_error(&self, error: SensorError);
}
