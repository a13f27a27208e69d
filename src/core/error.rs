//! Error Taxonomy
//!
//! Typed errors for the sensor and radio collaborators. None of them is fatal:
//! sensor errors are surfaced to the host, advertise errors are retried by the
//! caller, and notify errors are recorded per peer.

use btleplug::api::BDAddr;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the host sensor framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("heart-rate sensor is unavailable")]
    Unavailable,
    #[error("permission to read body sensors was denied")]
    PermissionDenied,
}

/// Reason a single notification did not reach its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotifyFailure {
    /// The radio had no free buffers or the peer's queue was full.
    #[error("radio busy")]
    RadioBusy,
    /// The host no longer recognises the connection handle.
    #[error("stale connection handle")]
    StaleHandle,
    /// The peer disconnected while the notification was outstanding.
    #[error("peer gone")]
    PeerGone,
    #[error("notify timed out")]
    Timeout,
}

/// Failures of the BLE host collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// Already advertising, adapter off, or no advertiser capability.
    #[error("radio unavailable for advertising")]
    RadioUnavailable,
    #[error("advertising failed with host code {0}")]
    AdvertiseFailed(i32),
    #[error("notification to {peer} failed: {reason}")]
    NotifyFailed { peer: BDAddr, reason: NotifyFailure },
    #[error("host call did not complete within {0:?}")]
    Timeout(Duration),
    #[error("peripheral is shutting down")]
    ShuttingDown,
    /// A stop request overtook a pending advertising attempt.
    #[error("advertising request was cancelled")]
    Cancelled,
}

impl BleError {
    /// Whether retrying the same advertising request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BleError::RadioUnavailable | BleError::AdvertiseFailed(_) | BleError::Timeout(_)
        )
    }
}

/// Failures decoding a heart-rate measurement value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("measurement truncated: expected 3 bytes, got {0}")]
    Truncated(usize),
    #[error("unknown flag bits 0b{0:08b}")]
    UnknownFlags(u8),
}
