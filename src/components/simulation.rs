//! Simulated Host
//!
//! An in-memory radio and sensor for running the peripheral without hardware.
//! The radio keeps advertising state, records every notification and read
//! response, and can play the central side of a connection through the
//! callbacks registered with `open_server`. Notifications can be held back to
//! model a congested link, and failures injected per peer.

use crate::api::host::{BleHost, GattServerCallbacks, SensorCallbacks, ServerHandle};
use crate::core::config::AdvertiseSettings;
use crate::core::constants::{CCCD_DISABLE, CCCD_NOTIFY_ENABLE, MAX_BPM};
use crate::core::error::{BleError, NotifyFailure};
use crate::core::events::ConnectionState;
use crate::model::measurement::HeartRateMeasurement;
use crate::model::sample::SensorAccuracy;
use crate::model::service::ServiceDescriptor;
use async_trait::async_trait;
use btleplug::api::BDAddr;
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Default)]
struct RadioState {
    disabled: bool,
    stall_advertising: bool,
    stall_stop: bool,
    advertising: bool,
    advertise_calls: usize,
    next_server: u64,
    server: Option<(ServerHandle, ServiceDescriptor)>,
    callbacks: Option<Arc<dyn GattServerCallbacks>>,
    failures: HashMap<BDAddr, NotifyFailure>,
    notifications: Vec<(BDAddr, Vec<u8>)>,
    read_responses: Vec<(BDAddr, u32, Vec<u8>)>,
}

/// In-memory stand-in for the host Bluetooth stack.
pub struct SimulatedRadio {
    state: Mutex<RadioState>,
    /// `true` while notifications may leave the radio.
    gate: watch::Sender<bool>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(RadioState::default()),
            gate,
        }
    }

    fn state(&self) -> MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> Option<Arc<dyn GattServerCallbacks>> {
        self.state().callbacks.clone()
    }

    /// Turns the adapter off (`false`) or on.
    pub fn set_enabled(&self, enabled: bool) {
        self.state().disabled = !enabled;
    }

    /// Makes `advertise` hang until the caller gives up.
    pub fn stall_advertising(&self, stall: bool) {
        self.state().stall_advertising = stall;
    }

    /// Makes `stop_advertising` hang until the caller gives up.
    pub fn stall_stop_advertising(&self, stall: bool) {
        self.state().stall_stop = stall;
    }

    /// Frees the advertiser as if another app stopped using it.
    pub fn release_advertiser(&self) {
        self.state().advertising = false;
    }

    pub fn is_advertising(&self) -> bool {
        self.state().advertising
    }

    pub fn advertise_calls(&self) -> usize {
        self.state().advertise_calls
    }

    pub fn is_serving(&self) -> bool {
        self.state().server.is_some()
    }

    /// Holds every notification on air until released.
    pub fn hold_notifications(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_notifications(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail_notifications_to(&self, peer: BDAddr, reason: NotifyFailure) {
        self.state().failures.insert(peer, reason);
    }

    /// Raw values notified so far, in order.
    pub fn raw_notifications(&self) -> Vec<(BDAddr, Vec<u8>)> {
        self.state().notifications.clone()
    }

    /// Decoded heart rates notified to one peer, in order.
    pub fn notifications_to(&self, peer: BDAddr) -> Vec<u16> {
        self.state()
            .notifications
            .iter()
            .filter(|(to, _)| *to == peer)
            .filter_map(|(_, value)| HeartRateMeasurement::decode(value).ok())
            .map(|msg| msg.bpm)
            .collect()
    }

    pub fn read_responses(&self) -> Vec<(BDAddr, u32, Vec<u8>)> {
        self.state().read_responses.clone()
    }

    /// A central connects.
    pub fn connect(&self, peer: BDAddr) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.on_connection_state_change(peer, ConnectionState::Connected);
        }
    }

    /// A central enables notifications on the measurement characteristic.
    pub fn subscribe(&self, peer: BDAddr) {
        self.write_cccd(peer, &CCCD_NOTIFY_ENABLE);
    }

    pub fn unsubscribe(&self, peer: BDAddr) {
        self.write_cccd(peer, &CCCD_DISABLE);
    }

    /// A central writes an arbitrary value to the configuration descriptor.
    pub fn write_cccd(&self, peer: BDAddr, value: &[u8]) {
        let cccd = self.state().server.as_ref().map(|(_, desc)| desc.cccd_uuid());
        if let (Some(callbacks), Some(cccd)) = (self.callbacks(), cccd) {
            callbacks.on_descriptor_write(peer, cccd, value.to_vec());
        }
    }

    pub fn read(&self, peer: BDAddr, request_id: u32) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.on_characteristic_read_request(peer, request_id, 0);
        }
    }

    pub fn disconnect(&self, peer: BDAddr) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.on_connection_state_change(peer, ConnectionState::Disconnected);
        }
    }
}

#[async_trait]
impl BleHost for SimulatedRadio {
    async fn open_server(
        &self,
        descriptor: &ServiceDescriptor,
        callbacks: Box<dyn GattServerCallbacks>,
    ) -> Result<ServerHandle, BleError> {
        let mut state = self.state();
        if state.disabled {
            return Err(BleError::RadioUnavailable);
        }
        state.next_server += 1;
        let handle = ServerHandle(state.next_server);
        state.server = Some((handle, descriptor.clone()));
        state.callbacks = Some(Arc::from(callbacks));
        info!(
            "simulated GATT server {:?} serving {}",
            handle,
            descriptor.service_uuid()
        );
        Ok(handle)
    }

    async fn close_server(&self, server: ServerHandle) {
        let mut state = self.state();
        if state.server.as_ref().is_some_and(|(open, _)| *open == server) {
            state.server = None;
            state.callbacks = None;
            debug!("simulated GATT server {:?} closed", server);
        }
    }

    async fn advertise(
        &self,
        descriptor: &ServiceDescriptor,
        local_name: &str,
        settings: &AdvertiseSettings,
    ) -> Result<(), BleError> {
        let stall = {
            let mut state = self.state();
            state.advertise_calls += 1;
            if state.disabled || state.advertising {
                return Err(BleError::RadioUnavailable);
            }
            if !state.stall_advertising {
                state.advertising = true;
            }
            state.stall_advertising
        };
        if stall {
            std::future::pending::<()>().await;
        }
        info!(
            "simulated radio advertising {} as {:?} ({:?}, {:?}, connectable: {})",
            descriptor.service_uuid(),
            if settings.include_device_name { local_name } else { "" },
            settings.mode,
            settings.tx_power,
            settings.connectable
        );
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        let stall = self.state().stall_stop;
        if stall {
            std::future::pending::<()>().await;
        }
        self.state().advertising = false;
        Ok(())
    }

    async fn notify(
        &self,
        peer: BDAddr,
        characteristic: uuid::Uuid,
        value: &[u8],
    ) -> Result<(), NotifyFailure> {
        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(NotifyFailure::RadioBusy);
        }
        let callbacks = {
            let mut state = self.state();
            let serves = state
                .server
                .as_ref()
                .is_some_and(|(_, desc)| desc.characteristic_uuid() == characteristic);
            if !serves {
                return Err(NotifyFailure::StaleHandle);
            }
            if let Some(reason) = state.failures.get(&peer) {
                return Err(*reason);
            }
            state.notifications.push((peer, value.to_vec()));
            state.callbacks.clone()
        };
        trace!("simulated radio notified {}: {:02x?}", peer, value);
        if let Some(callbacks) = callbacks {
            callbacks.on_notify_sent(peer, Ok(()));
        }
        Ok(())
    }

    async fn send_read_response(
        &self,
        peer: BDAddr,
        request_id: u32,
        value: &[u8],
    ) -> Result<(), BleError> {
        self.state()
            .read_responses
            .push((peer, request_id, value.to_vec()));
        Ok(())
    }
}

/// Random-walk heart-rate sensor.
///
/// Mostly reports `High` accuracy, with the odd unreliable reading and the
/// odd zero glitch a wrist sensor produces when it slips.
pub struct SimulatedSensor {
    bpm: i32,
    rng: StdRng,
}

impl SimulatedSensor {
    pub fn new(resting_bpm: u16) -> Self {
        Self {
            bpm: i32::from(resting_bpm),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sensor for reproducible runs.
    pub fn seeded(resting_bpm: u16, seed: u64) -> Self {
        Self {
            bpm: i32::from(resting_bpm),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Produces the next reading.
    pub fn next_reading(&mut self) -> (i32, SensorAccuracy) {
        self.bpm = (self.bpm + self.rng.gen_range(-3..=3)).clamp(45, i32::from(MAX_BPM) - 120);
        match self.rng.gen_range(0..50) {
            0 => (0, SensorAccuracy::Unreliable),
            1..=3 => (self.bpm + self.rng.gen_range(20..60), SensorAccuracy::Unreliable),
            4..=8 => (self.bpm, SensorAccuracy::Low),
            _ => (self.bpm, SensorAccuracy::High),
        }
    }

    /// Feeds a reading to `callbacks` every `interval` until aborted.
    pub fn spawn<C: SensorCallbacks + 'static>(
        mut self,
        callbacks: C,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let (bpm, accuracy) = self.next_reading();
                if bpm == 0 {
                    warn!("simulated sensor lost contact");
                }
                callbacks.on_sample(bpm, accuracy, Instant::now());
            }
        })
    }
}
