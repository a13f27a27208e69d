//! Notification Dispatcher
//!
//! Fans an accepted sample out to subscribed peers. Each peer owns a worker
//! task fed by a single-slot mailbox. A newer value replaces one that has not
//! been sent yet and cancels one that is still on air, so a slow peer only ever
//! receives the latest reading. A global semaphore bounds the notifications
//! outstanding across all peers; each host call is bounded by the configured
//! timeout.

use crate::api::host::BleHost;
use crate::core::error::{BleError, NotifyFailure};
use crate::model::peer::PeerConnection;
use crate::model::sample::HeartRateSample;
use crate::model::service::WireFormat;
use btleplug::api::BDAddr;
use futures::future::join_all;
use log::{debug, trace};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What happened to one value handed to a peer's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Replaced by a newer value before it reached the peer.
    Superseded,
    Failed(NotifyFailure),
}

/// Per-peer result of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub bpm: u16,
    pub delivered: Vec<BDAddr>,
    /// Connected peers without a notification subscription.
    pub skipped: Vec<BDAddr>,
    pub superseded: Vec<BDAddr>,
    pub failed: Vec<(BDAddr, NotifyFailure)>,
}

impl DispatchReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// The failures as radio errors, for logging and status reporting.
    pub fn errors(&self) -> impl Iterator<Item = BleError> + '_ {
        self.failed
            .iter()
            .map(|(peer, reason)| BleError::NotifyFailed {
                peer: *peer,
                reason: *reason,
            })
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bpm: {} delivered, {} skipped, {} superseded, {} failed",
            self.bpm,
            self.delivered.len(),
            self.skipped.len(),
            self.superseded.len(),
            self.failed.len()
        )
    }
}

/// Pending outcome of a dispatch; resolves once every targeted peer settled.
#[derive(Debug)]
pub struct DispatchTicket {
    bpm: u16,
    skipped: Vec<BDAddr>,
    pending: Vec<(BDAddr, oneshot::Receiver<DeliveryOutcome>)>,
}

impl DispatchTicket {
    /// Number of peers a notification was queued for.
    pub fn targets(&self) -> usize {
        self.pending.len()
    }

    /// Waits for all targeted peers and builds the report.
    ///
    /// A peer whose worker vanished (disconnect or shutdown) counts as `PeerGone`.
    pub async fn report(self) -> DispatchReport {
        let outcomes = join_all(self.pending.into_iter().map(|(peer, rx)| async move {
            let outcome = rx
                .await
                .unwrap_or(DeliveryOutcome::Failed(NotifyFailure::PeerGone));
            (peer, outcome)
        }))
        .await;

        let mut report = DispatchReport {
            bpm: self.bpm,
            skipped: self.skipped,
            ..Default::default()
        };
        for (peer, outcome) in outcomes {
            match outcome {
                DeliveryOutcome::Delivered => report.delivered.push(peer),
                DeliveryOutcome::Superseded => report.superseded.push(peer),
                DeliveryOutcome::Failed(reason) => report.failed.push((peer, reason)),
            }
        }
        report
    }
}

struct Outgoing {
    value: Arc<[u8]>,
    reply: oneshot::Sender<DeliveryOutcome>,
}

impl Outgoing {
    fn resolve(self, outcome: DeliveryOutcome) {
        // The ticket may have been dropped; nobody is waiting then.
        let _ = self.reply.send(outcome);
    }
}

/// Single-slot mailbox between the dispatcher and a peer worker.
#[derive(Default)]
struct Mailbox {
    slot: Mutex<Option<Outgoing>>,
    ready: Notify,
}

impl Mailbox {
    fn put(&self, outgoing: Outgoing) {
        let previous = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(outgoing);
        if let Some(previous) = previous {
            previous.resolve(DeliveryOutcome::Superseded);
        }
        self.ready.notify_one();
    }

    fn try_take(&self) -> Option<Outgoing> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn has_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn take(&self) -> Outgoing {
        loop {
            if let Some(outgoing) = self.try_take() {
                return outgoing;
            }
            self.ready.notified().await;
        }
    }
}

struct PeerSlot {
    mailbox: Arc<Mailbox>,
    worker: JoinHandle<()>,
}

impl Drop for PeerSlot {
    /// Cancels the worker, including any notification still on air.
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Everything a peer worker needs to talk to the host.
struct WorkerContext<H: BleHost> {
    peer: BDAddr,
    host: Arc<H>,
    characteristic: Uuid,
    limiter: Arc<Semaphore>,
    timeout: Duration,
}

impl<H: BleHost> WorkerContext<H> {
    async fn deliver(&self, value: &[u8]) -> Result<(), NotifyFailure> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| NotifyFailure::PeerGone)?;
        match tokio::time::timeout(
            self.timeout,
            self.host.notify(self.peer, self.characteristic, value),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(NotifyFailure::Timeout),
        }
    }

    async fn run(self, mailbox: Arc<Mailbox>) {
        loop {
            let mut current = mailbox.take().await;
            loop {
                let result = {
                    let attempt = self.deliver(&current.value);
                    tokio::pin!(attempt);
                    loop {
                        // A newer value wins even if the current one could complete now.
                        tokio::select! {
                            biased;
                            _ = mailbox.ready.notified() => {
                                if mailbox.has_pending() {
                                    break None;
                                }
                            }
                            result = &mut attempt => break Some(result),
                        }
                    }
                };
                match result {
                    Some(result) => {
                        trace!("notification to {} settled: {:?}", self.peer, result);
                        current.resolve(match result {
                            Ok(()) => DeliveryOutcome::Delivered,
                            Err(reason) => DeliveryOutcome::Failed(reason),
                        });
                        break;
                    }
                    None => {
                        trace!("superseding in-flight notification to {}", self.peer);
                        current.resolve(DeliveryOutcome::Superseded);
                        match mailbox.try_take() {
                            Some(next) => current = next,
                            None => break,
                        }
                    }
                }
            }
        }
    }
}

/// Encodes samples and hands them to per-peer workers.
pub struct NotificationDispatcher<H: BleHost> {
    host: Arc<H>,
    characteristic: Uuid,
    wire_format: WireFormat,
    contact_supported: bool,
    timeout: Duration,
    limiter: Arc<Semaphore>,
    slots: HashMap<BDAddr, PeerSlot>,
}

impl<H: BleHost> NotificationDispatcher<H> {
    /// Creates a new `NotificationDispatcher`.
    ///
    /// # Arguments
    /// - `host`: Radio used for notifications.
    /// - `characteristic`: Characteristic the values are notified on.
    /// - `wire_format`: Fixed encoding of the values.
    /// - `contact_supported`: Whether the contact flags are meaningful.
    /// - `max_concurrent`: Notifications allowed on air at once.
    /// - `timeout`: Bound for a single notify call.
    pub fn new(
        host: Arc<H>,
        characteristic: Uuid,
        wire_format: WireFormat,
        contact_supported: bool,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            host,
            characteristic,
            wire_format,
            contact_supported,
            timeout,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            slots: HashMap::new(),
        }
    }

    /// Queues the sample for every subscribed peer.
    ///
    /// The value is encoded once. Peers that are connected but not subscribed
    /// are only listed as skipped.
    pub fn dispatch<'a>(
        &mut self,
        sample: &HeartRateSample,
        peers: impl IntoIterator<Item = &'a PeerConnection>,
    ) -> DispatchTicket {
        let value: Arc<[u8]> = self
            .wire_format
            .encode(sample, self.contact_supported)
            .into();
        let mut skipped = Vec::new();
        let mut pending = Vec::new();
        for peer in peers {
            let identity = peer.identity();
            if !peer.is_subscribed() {
                skipped.push(identity);
                continue;
            }
            let (reply, rx) = oneshot::channel();
            self.slot_for(identity).mailbox.put(Outgoing {
                value: value.clone(),
                reply,
            });
            pending.push((identity, rx));
        }
        skipped.sort();
        pending.sort_by_key(|(identity, _)| *identity);
        DispatchTicket {
            bpm: sample.bpm,
            skipped,
            pending,
        }
    }

    /// Drops the worker of a departed peer, cancelling its in-flight notification.
    pub fn forget(&mut self, peer: &BDAddr) {
        if self.slots.remove(peer).is_some() {
            debug!("notification worker for {} stopped", peer);
        }
    }

    /// Cancels every outstanding notification and refuses new ones.
    pub fn shutdown(&mut self) {
        self.limiter.close();
        self.slots.clear();
    }

    fn slot_for(&mut self, peer: BDAddr) -> &PeerSlot {
        let Self {
            host,
            characteristic,
            timeout,
            limiter,
            slots,
            ..
        } = self;
        slots.entry(peer).or_insert_with(|| {
            let mailbox = Arc::new(Mailbox::default());
            let context = WorkerContext {
                peer,
                host: host.clone(),
                characteristic: *characteristic,
                limiter: limiter.clone(),
                timeout: *timeout,
            };
            debug!("notification worker for {} started", peer);
            PeerSlot {
                mailbox: mailbox.clone(),
                worker: tokio::spawn(context.run(mailbox)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::host::GattServerCallbacks;
    use crate::components::simulation::SimulatedRadio;
    use crate::core::constants::HEARTRATE_MEASUREMENT_UUID;
    use crate::core::events::ConnectionState;
    use crate::model::measurement::HeartRateMeasurement;
    use crate::model::peer::peer_link;
    use crate::model::sample::SensorAccuracy;
    use crate::model::service::ServiceDescriptor;

    struct NoCallbacks;

    impl GattServerCallbacks for NoCallbacks {
        fn on_connection_state_change(&self, _: BDAddr, _: ConnectionState) {}
        fn on_descriptor_write(&self, _: BDAddr, _: Uuid, _: Vec<u8>) {}
        fn on_notify_sent(&self, _: BDAddr, _: Result<(), NotifyFailure>) {}
        fn on_characteristic_read_request(&self, _: BDAddr, _: u32, _: u16) {}
    }

    async fn serving_radio() -> Arc<SimulatedRadio> {
        let radio = Arc::new(SimulatedRadio::new());
        radio
            .open_server(&ServiceDescriptor::heart_rate(), Box::new(NoCallbacks))
            .await
            .unwrap();
        radio
    }

    fn addr(last: u8) -> BDAddr {
        BDAddr::from([0xC0, 0, 0, 0, 0, last])
    }

    fn subscribed(last: u8) -> PeerConnection {
        let mut peer = PeerConnection::connected(addr(last), 1);
        peer.apply(peer_link::Input::Subscribe);
        peer
    }

    fn dispatcher(radio: &Arc<SimulatedRadio>) -> NotificationDispatcher<SimulatedRadio> {
        NotificationDispatcher::new(
            radio.clone(),
            HEARTRATE_MEASUREMENT_UUID,
            WireFormat::HeartRateMeasurement,
            true,
            4,
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_skips_unsubscribed_peers() {
        let radio = serving_radio().await;
        let mut dispatcher = dispatcher(&radio);
        let a = subscribed(1);
        let b = PeerConnection::connected(addr(2), 1);

        let ticket = dispatcher.dispatch(&HeartRateSample::now(82, SensorAccuracy::High), [&a, &b]);
        assert_eq!(ticket.targets(), 1);
        let report = ticket.report().await;

        assert_eq!(report.delivered, vec![addr(1)]);
        assert_eq!(report.skipped, vec![addr(2)]);
        assert_eq!(report.failed_count(), 0);
        assert_eq!(radio.notifications_to(addr(1)), vec![82]);
        assert!(radio.notifications_to(addr(2)).is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_peer() {
        let radio = serving_radio().await;
        radio.fail_notifications_to(addr(2), NotifyFailure::RadioBusy);
        let mut dispatcher = dispatcher(&radio);
        let peers = [subscribed(1), subscribed(2), subscribed(3)];

        let report = dispatcher
            .dispatch(&HeartRateSample::now(90, SensorAccuracy::High), &peers)
            .report()
            .await;

        assert_eq!(report.delivered, vec![addr(1), addr(3)]);
        assert_eq!(report.failed, vec![(addr(2), NotifyFailure::RadioBusy)]);
        assert_eq!(
            report.errors().collect::<Vec<_>>(),
            vec![BleError::NotifyFailed {
                peer: addr(2),
                reason: NotifyFailure::RadioBusy
            }]
        );
    }

    #[tokio::test]
    async fn test_coalesces_in_flight_notification() {
        let radio = serving_radio().await;
        radio.hold_notifications();
        let mut dispatcher = dispatcher(&radio);
        let a = [subscribed(1)];

        let first = dispatcher.dispatch(&HeartRateSample::now(70, SensorAccuracy::High), &a);
        tokio::task::yield_now().await;
        let second = dispatcher.dispatch(&HeartRateSample::now(71, SensorAccuracy::High), &a);
        radio.release_notifications();

        let first = first.report().await;
        let second = second.report().await;
        assert_eq!(first.superseded, vec![addr(1)]);
        assert!(first.delivered.is_empty());
        assert_eq!(second.delivered, vec![addr(1)]);

        let sent = radio.notifications_to(addr(1));
        assert_eq!(sent, vec![71]);
    }

    #[tokio::test]
    async fn test_burst_delivers_latest_only() {
        let radio = serving_radio().await;
        radio.hold_notifications();
        let mut dispatcher = dispatcher(&radio);
        let a = [subscribed(1)];

        let tickets: Vec<_> = (60..70)
            .map(|bpm| dispatcher.dispatch(&HeartRateSample::now(bpm, SensorAccuracy::High), &a))
            .collect();
        radio.release_notifications();

        let mut delivered = Vec::new();
        for ticket in tickets {
            let report = ticket.report().await;
            if !report.delivered.is_empty() {
                delivered.push(report.bpm);
            }
        }
        assert_eq!(delivered, vec![69]);
        assert_eq!(radio.notifications_to(addr(1)), vec![69]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_timeout() {
        let radio = serving_radio().await;
        radio.hold_notifications();
        let mut dispatcher = dispatcher(&radio);

        let report = dispatcher
            .dispatch(&HeartRateSample::now(77, SensorAccuracy::High), &[subscribed(1)])
            .report()
            .await;
        assert_eq!(report.failed, vec![(addr(1), NotifyFailure::Timeout)]);
    }

    #[tokio::test]
    async fn test_forget_fails_pending_as_peer_gone() {
        let radio = serving_radio().await;
        radio.hold_notifications();
        let mut dispatcher = dispatcher(&radio);

        let ticket =
            dispatcher.dispatch(&HeartRateSample::now(77, SensorAccuracy::High), &[subscribed(1)]);
        tokio::task::yield_now().await;
        dispatcher.forget(&addr(1));
        radio.release_notifications();

        let report = ticket.report().await;
        assert_eq!(report.failed, vec![(addr(1), NotifyFailure::PeerGone)]);
        assert!(radio.notifications_to(addr(1)).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let radio = serving_radio().await;
        radio.hold_notifications();
        let mut dispatcher = dispatcher(&radio);
        let peers = [subscribed(1), subscribed(2)];

        let ticket = dispatcher.dispatch(&HeartRateSample::now(77, SensorAccuracy::High), &peers);
        dispatcher.shutdown();
        radio.release_notifications();

        let report = ticket.report().await;
        assert_eq!(report.failed_count(), 2);
        assert!(report
            .failed
            .iter()
            .all(|(_, reason)| *reason == NotifyFailure::PeerGone));
    }

    #[tokio::test]
    async fn test_encodes_wire_format() {
        let radio = serving_radio().await;
        let mut dispatcher = dispatcher(&radio);
        dispatcher
            .dispatch(&HeartRateSample::now(75, SensorAccuracy::Medium), &[subscribed(1)])
            .report()
            .await;

        let raw = radio.raw_notifications();
        assert_eq!(raw.len(), 1);
        let msg = HeartRateMeasurement::decode(&raw[0].1).unwrap();
        assert_eq!(msg.bpm, 75);
        assert!(msg.contact.detected);
    }
}
