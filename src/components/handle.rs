//! Peripheral Handle
//!
//! Cloneable front door of a running peripheral. GATT server callbacks are
//! turned into events on the owner task's queue; application requests travel
//! the same queue and wait for a reply. Sensor readings overwrite a single
//! latest-value slot.

use crate::api::host::{GattServerCallbacks, SensorCallbacks};
use crate::api::model::PeripheralSnapshot;
use crate::core::config::PeripheralConfig;
use crate::core::constants::MIN_ADVERTISE_BACKOFF;
use crate::core::error::{BleError, NotifyFailure, SensorError};
use crate::core::events::{ConnectionState, PeripheralCommand, PeripheralEvent, StatusEvent};
use crate::model::sample::{HeartRateSample, SensorAccuracy};
use btleplug::api::BDAddr;
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PeripheralHandle {
    events: mpsc::UnboundedSender<PeripheralEvent>,
    samples: Arc<watch::Sender<Option<HeartRateSample>>>,
    status: broadcast::Sender<StatusEvent>,
    backoff: Duration,
    backoff_max: Duration,
}

impl PeripheralHandle {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<PeripheralEvent>,
        samples: watch::Sender<Option<HeartRateSample>>,
        status: broadcast::Sender<StatusEvent>,
        config: &PeripheralConfig,
    ) -> Self {
        Self {
            events,
            samples: Arc::new(samples),
            status,
            backoff: config.advertise_backoff().max(MIN_ADVERTISE_BACKOFF),
            backoff_max: config.advertise_backoff_max(),
        }
    }

    /// Queues an event coming from a host callback without blocking.
    fn enqueue(&self, event: PeripheralEvent) {
        if let Err(mpsc::error::SendError(event)) = self.events.send(event) {
            trace!("peripheral stopped, ignoring {:?}", event);
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PeripheralCommand,
    ) -> Result<T, BleError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(PeripheralEvent::Command(command(reply)))
            .map_err(|_| BleError::ShuttingDown)?;
        rx.await.map_err(|_| BleError::ShuttingDown)
    }

    /// Asks the peripheral to start advertising once.
    ///
    /// Succeeds immediately when the peripheral already advertises.
    pub async fn start_advertising(&self) -> Result<(), BleError> {
        self.request(PeripheralCommand::StartAdvertising).await?
    }

    /// Starts advertising, retrying recoverable failures with exponential backoff.
    ///
    /// # Arguments
    /// - `max_attempts`: Upper bound of attempts, at least one is made.
    ///
    /// # Returns
    /// The error of the last attempt if none succeeded.
    pub async fn start_advertising_with_retry(&self, max_attempts: u32) -> Result<(), BleError> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.start_advertising().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "advertising attempt {}/{} failed: {}. retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.backoff_max);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn stop_advertising(&self) -> Result<(), BleError> {
        self.request(PeripheralCommand::StopAdvertising).await?
    }

    /// Copies the current peripheral state.
    pub async fn snapshot(&self) -> Result<PeripheralSnapshot, BleError> {
        self.request(PeripheralCommand::Snapshot).await
    }

    /// Stops advertising, cancels notifications and clears the connection table.
    pub async fn shutdown(&self) -> Result<(), BleError> {
        self.request(PeripheralCommand::Shutdown).await
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }
}

impl SensorCallbacks for PeripheralHandle {
    fn on_sample(&self, bpm: i32, accuracy: SensorAccuracy, timestamp: Instant) {
        match u16::try_from(bpm) {
            Ok(bpm) => {
                self.samples
                    .send_replace(Some(HeartRateSample::new(bpm, accuracy, timestamp)));
            }
            Err(_) => debug!("discarding sensor reading of {} bpm", bpm),
        }
    }

    fn on_sensor_error(&self, error: SensorError) {
        self.enqueue(PeripheralEvent::SensorFault(error));
    }
}

impl GattServerCallbacks for PeripheralHandle {
    fn on_connection_state_change(&self, peer: BDAddr, state: ConnectionState) {
        self.enqueue(PeripheralEvent::ConnectionStateChanged { peer, state });
    }

    fn on_descriptor_write(&self, peer: BDAddr, descriptor: Uuid, value: Vec<u8>) {
        self.enqueue(PeripheralEvent::DescriptorWritten {
            peer,
            descriptor,
            value,
        });
    }

    fn on_notify_sent(&self, peer: BDAddr, result: Result<(), NotifyFailure>) {
        self.enqueue(PeripheralEvent::NotifySent { peer, result });
    }

    fn on_characteristic_read_request(&self, peer: BDAddr, request_id: u32, offset: u16) {
        self.enqueue(PeripheralEvent::ReadRequested {
            peer,
            request_id,
            offset,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Receivers = (
        mpsc::UnboundedReceiver<PeripheralEvent>,
        watch::Receiver<Option<HeartRateSample>>,
    );

    fn handle() -> (PeripheralHandle, Receivers) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (samples_tx, samples_rx) = watch::channel(None);
        let (status, _) = broadcast::channel(4);
        (
            PeripheralHandle::new(tx, samples_tx, status, &PeripheralConfig::default()),
            (rx, samples_rx),
        )
    }

    #[tokio::test]
    async fn test_sample_is_published_to_slot() {
        let (handle, (_rx, mut samples)) = handle();
        handle.on_sample(72, SensorAccuracy::High, Instant::now());
        assert!(samples.has_changed().unwrap());
        let sample = samples.borrow_and_update().expect("sample");
        assert_eq!(sample.bpm, 72);
        assert_eq!(sample.accuracy, SensorAccuracy::High);
    }

    #[tokio::test]
    async fn test_negative_reading_is_discarded() {
        let (handle, (mut rx, samples)) = handle();
        handle.on_sample(-5, SensorAccuracy::High, Instant::now());
        handle.on_sensor_error(SensorError::Unavailable);
        assert!(!samples.has_changed().unwrap());
        assert!(samples.borrow().is_none());
        assert!(matches!(
            rx.recv().await,
            Some(PeripheralEvent::SensorFault(SensorError::Unavailable))
        ));
    }

    #[tokio::test]
    async fn test_host_events_keep_order() {
        let (handle, (mut rx, _samples)) = handle();
        let peer = BDAddr::from([1, 2, 3, 4, 5, 6]);
        handle.on_connection_state_change(peer, ConnectionState::Connected);
        handle.on_descriptor_write(peer, Uuid::nil(), vec![1, 0]);
        handle.on_connection_state_change(peer, ConnectionState::Disconnected);

        assert!(matches!(
            rx.recv().await,
            Some(PeripheralEvent::ConnectionStateChanged {
                state: ConnectionState::Connected,
                ..
            })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(PeripheralEvent::DescriptorWritten { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(PeripheralEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_latest_sample_wins() {
        let (handle, (mut rx, mut samples)) = handle();
        handle.on_sample(70, SensorAccuracy::High, Instant::now());
        handle.on_sample(71, SensorAccuracy::High, Instant::now());
        assert_eq!(samples.borrow_and_update().map(|s| s.bpm), Some(71));
        assert!(!samples.has_changed().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_host_events_are_not_dropped_under_sample_load() {
        let (handle, (mut rx, _samples)) = handle();
        let peer = BDAddr::from([1, 2, 3, 4, 5, 6]);
        for bpm in 0..500 {
            handle.on_sample(60 + bpm % 100, SensorAccuracy::High, Instant::now());
            handle.on_notify_sent(peer, Ok(()));
        }
        handle.on_connection_state_change(peer, ConnectionState::Disconnected);

        let mut notified = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                PeripheralEvent::NotifySent { .. } => notified += 1,
                PeripheralEvent::ConnectionStateChanged {
                    state: ConnectionState::Disconnected,
                    ..
                } => {
                    assert_eq!(notified, 500);
                    return;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        panic!("disconnect was lost");
    }

    #[tokio::test]
    async fn test_request_after_shutdown() {
        let (handle, receivers) = handle();
        drop(receivers);
        assert_eq!(handle.start_advertising().await, Err(BleError::ShuttingDown));
    }
}
