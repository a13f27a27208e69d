//! This module defines the read only API for inspecting the peripheral:
//! its service, advertising state, cached value and connection table.
use btleplug::api::BDAddr;

use crate::model::{
    peer::{LinkState, PeerConnection},
    sample::HeartRateSample,
    service::ServiceDescriptor,
};

/// Copy of one connection table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub identity: BDAddr,
    pub state: LinkState,
    pub last_notified_bpm: Option<u16>,
}

impl From<&PeerConnection> for PeerSummary {
    fn from(peer: &PeerConnection) -> Self {
        Self {
            identity: peer.identity(),
            state: peer.state(),
            last_notified_bpm: peer.last_notified_bpm(),
        }
    }
}

/// `PeripheralModelApi` trait.
///
/// Read access to the peripheral state, shared by the live peripheral and the
/// snapshots handed out to other tasks.
pub trait PeripheralModelApi {
    /// Retrieves the advertised service.
    fn get_descriptor(&self) -> &ServiceDescriptor;

    /// Gets the advertising status.
    ///
    /// # Returns
    /// `true` if the host confirmed advertising, `false` otherwise.
    fn is_advertising(&self) -> bool;

    /// Retrieves the last accepted sample, served to read requests.
    fn get_last_sample(&self) -> Option<&HeartRateSample>;

    /// Gets the connected peers, ordered by address.
    fn get_peers(&self) -> Vec<PeerSummary>;

    fn subscriber_count(&self) -> usize {
        self.get_peers()
            .iter()
            .filter(|peer| peer.state == LinkState::Subscribed)
            .count()
    }
}

/// Point-in-time copy of the peripheral state.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralSnapshot {
    descriptor: ServiceDescriptor,
    advertising: bool,
    last_sample: Option<HeartRateSample>,
    peers: Vec<PeerSummary>,
}

impl PeripheralSnapshot {
    pub fn capture<M: PeripheralModelApi + ?Sized>(model: &M) -> Self {
        Self {
            descriptor: model.get_descriptor().clone(),
            advertising: model.is_advertising(),
            last_sample: model.get_last_sample().copied(),
            peers: model.get_peers(),
        }
    }
}

impl PeripheralModelApi for PeripheralSnapshot {
    fn get_descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn is_advertising(&self) -> bool {
        self.advertising
    }

    fn get_last_sample(&self) -> Option<&HeartRateSample> {
        self.last_sample.as_ref()
    }

    fn get_peers(&self) -> Vec<PeerSummary> {
        self.peers.clone()
    }
}
