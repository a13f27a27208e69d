//! Peer Connections
//!
//! One entry per connected central. The link state follows
//! `Disconnected -> Connected -> Subscribed -> Disconnected`, with `Subscribed`
//! falling back to `Connected` when the central disables notifications.

use btleplug::api::BDAddr;
use rust_fsm::*;
use std::fmt;

state_machine! {
    /// Per-peer link state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub peer_link(Disconnected)

    Disconnected(Connect) => Connected,
    Connected => {
        Subscribe => Subscribed,
        Unsubscribe => Connected,
        Disconnect => Disconnected
    },
    Subscribed => {
        Subscribe => Subscribed,
        Unsubscribe => Connected,
        Disconnect => Disconnected
    }
}

pub use peer_link::State as LinkState;

/// A connected central as tracked by the peripheral's connection table.
pub struct PeerConnection {
    identity: BDAddr,
    /// Distinguishes successive connections of the same address.
    session: u64,
    link: peer_link::StateMachine,
    last_notified_bpm: Option<u16>,
}

impl PeerConnection {
    /// Creates the entry for a freshly connected peer.
    pub fn connected(identity: BDAddr, session: u64) -> Self {
        let mut link = peer_link::StateMachine::new();
        // Disconnected(Connect) is always defined.
        let _ = link.consume(&peer_link::Input::Connect);
        Self {
            identity,
            session,
            link,
            last_notified_bpm: None,
        }
    }

    pub fn identity(&self) -> BDAddr {
        self.identity
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn state(&self) -> LinkState {
        *self.link.state()
    }

    pub fn is_subscribed(&self) -> bool {
        self.state() == LinkState::Subscribed
    }

    pub fn last_notified_bpm(&self) -> Option<u16> {
        self.last_notified_bpm
    }

    /// Applies a link input, returning the resulting state or `None` if the
    /// transition is not defined from the current state.
    pub(crate) fn apply(&mut self, input: peer_link::Input) -> Option<LinkState> {
        self.link.consume(&input).ok().map(|_| self.state())
    }

    pub(crate) fn record_notified(&mut self, bpm: u16) {
        self.last_notified_bpm = Some(bpm);
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("identity", &self.identity)
            .field("session", &self.session)
            .field("state", self.link.state())
            .field("last_notified_bpm", &self.last_notified_bpm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> BDAddr {
        BDAddr::from([0, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_new_peer_is_connected_not_subscribed() {
        let peer = PeerConnection::connected(addr(1), 1);
        assert_eq!(peer.state(), LinkState::Connected);
        assert!(!peer.is_subscribed());
        assert!(peer.last_notified_bpm().is_none());
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let mut peer = PeerConnection::connected(addr(1), 1);
        assert_eq!(
            peer.apply(peer_link::Input::Subscribe),
            Some(LinkState::Subscribed)
        );
        assert!(peer.is_subscribed());
        assert_eq!(
            peer.apply(peer_link::Input::Unsubscribe),
            Some(LinkState::Connected)
        );
        assert!(!peer.is_subscribed());
    }

    #[test]
    fn test_disconnected_accepts_nothing_but_connect() {
        let mut peer = PeerConnection::connected(addr(1), 1);
        assert_eq!(
            peer.apply(peer_link::Input::Disconnect),
            Some(LinkState::Disconnected)
        );
        assert_eq!(peer.apply(peer_link::Input::Subscribe), None);
        assert_eq!(peer.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_record_notified() {
        let mut peer = PeerConnection::connected(addr(2), 1);
        peer.record_notified(64);
        assert_eq!(peer.last_notified_bpm(), Some(64));
    }
}
