//! Core Events
//!
//! Everything the peripheral reacts to, apart from sensor readings, travels as
//! a `PeripheralEvent` through one unbounded queue consumed by the owner task.
//! GATT server callbacks, completed background work and commands from the
//! application all share it, so the connection table has a single writer and
//! host events are never lost. Sensor readings go through a latest-value slot
//! instead, where a fresher reading replaces an unprocessed one.

use crate::api::model::PeripheralSnapshot;
use crate::components::dispatcher::DispatchReport;
use crate::core::error::{BleError, NotifyFailure, SensorError};
use crate::model::peer::LinkState;
use btleplug::api::BDAddr;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Connection state reported by the host for a central.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Requests from the application to the owner task.
#[derive(Debug)]
pub enum PeripheralCommand {
    StartAdvertising(oneshot::Sender<Result<(), BleError>>),
    StopAdvertising(oneshot::Sender<Result<(), BleError>>),
    Snapshot(oneshot::Sender<PeripheralSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Input of the peripheral's owner task.
#[derive(Debug)]
pub enum PeripheralEvent {
    SensorFault(SensorError),
    ConnectionStateChanged {
        peer: BDAddr,
        state: ConnectionState,
    },
    DescriptorWritten {
        peer: BDAddr,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    /// Host confirmation that a notification left the radio.
    NotifySent {
        peer: BDAddr,
        result: Result<(), NotifyFailure>,
    },
    ReadRequested {
        peer: BDAddr,
        request_id: u32,
        offset: u16,
    },
    /// Outcome of a dispatch started by the owner task.
    DispatchCompleted {
        report: DispatchReport,
        /// Connection sessions of the peers the dispatch targeted.
        sessions: Vec<(BDAddr, u64)>,
    },
    /// Outcome of advertising attempt `attempt`.
    AdvertiseFinished {
        attempt: u64,
        result: Result<(), BleError>,
    },
    /// Outcome of a stop request run off the owner task.
    StopFinished {
        result: Result<(), BleError>,
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    Command(PeripheralCommand),
}

/// Notices published to observers such as the host UI.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    SensorFault(SensorError),
    Dispatched(DispatchReport),
    AdvertisingChanged(bool),
    AdvertiseFailed(BleError),
    PeerChanged { peer: BDAddr, state: LinkState },
}
