//! GATT Peripheral
//!
//! Owner of the connection table. A single task consumes the event queue and
//! the latest sensor reading, and is the only writer of peer state, the cached
//! value and the advertising state. Work that waits on the radio (advertising,
//! stopping, notifications, read responses) runs in spawned tasks and reports
//! back through the queue.
//!
//! Radio operations are serialized: every advertise or stop task waits for the
//! previous one before touching the host. Each advertising attempt carries an
//! id so the outcome of an attempt that a stop request overtook is discarded.

use crate::api::host::{BleHost, ServerHandle};
use crate::api::model::{PeerSummary, PeripheralModelApi, PeripheralSnapshot};
use crate::components::dispatcher::{DispatchReport, DispatchTicket, NotificationDispatcher};
use crate::components::filter::SampleFilter;
use crate::components::handle::PeripheralHandle;
use crate::core::config::PeripheralConfig;
use crate::core::error::BleError;
use crate::core::events::{ConnectionState, PeripheralCommand, PeripheralEvent, StatusEvent};
use crate::is_bit_set;
use crate::model::peer::{peer_link, LinkState, PeerConnection};
use crate::model::sample::HeartRateSample;
use crate::model::service::ServiceDescriptor;
use anyhow::{anyhow, Context, Result};
use btleplug::api::BDAddr;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const STATUS_CAPACITY: usize = 32;

/// Bit of the first CCCD byte that enables notifications.
const CCCD_NOTIFY_BIT: u8 = 0;

type Reply = oneshot::Sender<Result<(), BleError>>;

async fn bounded<T>(
    limit: Duration,
    call: impl std::future::Future<Output = Result<T, BleError>>,
) -> Result<T, BleError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| BleError::Timeout(limit))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdvertiseState {
    Idle,
    /// Waiting for the outcome of the attempt with this id.
    Starting(u64),
    Active,
    Stopping,
}

/// One advertising attempt, ready to run outside the owner task.
struct AdvertiseAttempt {
    id: u64,
    call: BoxFuture<'static, Result<(), BleError>>,
}

pub struct GattPeripheral<H: BleHost> {
    host: Arc<H>,
    descriptor: ServiceDescriptor,
    config: PeripheralConfig,
    /// `None` once the peripheral has shut down.
    server: Option<ServerHandle>,
    peers: HashMap<BDAddr, PeerConnection>,
    next_session: u64,
    last_sample: Option<HeartRateSample>,
    advertise: AdvertiseState,
    next_attempt: u64,
    /// Last spawned advertise or stop task.
    radio_op: Option<JoinHandle<()>>,
    advertise_reply: Option<Reply>,
    filter: SampleFilter,
    dispatcher: NotificationDispatcher<H>,
    events_tx: mpsc::WeakUnboundedSender<PeripheralEvent>,
    events_rx: mpsc::UnboundedReceiver<PeripheralEvent>,
    samples_rx: watch::Receiver<Option<HeartRateSample>>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl<H: BleHost> GattPeripheral<H> {
    /// Opens the GATT server and builds the peripheral.
    ///
    /// # Arguments
    /// - `host`: The radio.
    /// - `descriptor`: The service to expose.
    /// - `config`: Validated before anything touches the radio.
    ///
    /// # Returns
    /// The peripheral, to be driven with [`GattPeripheral::run`], and the
    /// handle through which sensor callbacks and the application reach it.
    pub async fn open(
        host: Arc<H>,
        descriptor: ServiceDescriptor,
        config: PeripheralConfig,
    ) -> Result<(Self, PeripheralHandle)> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (samples_tx, samples_rx) = watch::channel(None);
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let handle =
            PeripheralHandle::new(events_tx.clone(), samples_tx, status_tx.clone(), &config);

        let server = bounded(
            config.host_timeout(),
            host.open_server(&descriptor, Box::new(handle.clone())),
        )
        .await
        .context("could not open GATT server")?;
        info!(
            "GATT server {:?} open for service {}",
            server,
            descriptor.service_uuid()
        );

        let dispatcher = NotificationDispatcher::new(
            host.clone(),
            descriptor.characteristic_uuid(),
            descriptor.wire_format(),
            config.contact_supported,
            config.max_concurrent_notifications,
            config.host_timeout(),
        );
        let peripheral = Self {
            host,
            descriptor,
            server: Some(server),
            peers: HashMap::new(),
            next_session: 0,
            last_sample: None,
            advertise: AdvertiseState::Idle,
            next_attempt: 0,
            radio_op: None,
            advertise_reply: None,
            filter: SampleFilter::new(config.grace_period()),
            dispatcher,
            events_tx: events_tx.downgrade(),
            events_rx,
            samples_rx,
            status_tx,
            config,
        };
        Ok((peripheral, handle))
    }

    fn status(&self, event: StatusEvent) {
        // No observers is fine.
        let _ = self.status_tx.send(event);
    }

    /// Checks preconditions and prepares one advertising attempt.
    ///
    /// The attempt only touches the host once the previous radio operation
    /// has finished. Its outcome must be passed to `finish_advertising`.
    /// Returns `None` when already advertising.
    fn begin_advertising(&mut self) -> Result<Option<AdvertiseAttempt>, BleError> {
        if self.server.is_none() {
            return Err(BleError::ShuttingDown);
        }
        match self.advertise {
            AdvertiseState::Active => return Ok(None),
            AdvertiseState::Starting(_) => return Err(BleError::RadioUnavailable),
            AdvertiseState::Idle | AdvertiseState::Stopping => {}
        }
        self.next_attempt += 1;
        let id = self.next_attempt;
        self.advertise = AdvertiseState::Starting(id);
        let previous = self.radio_op.take();
        let host = self.host.clone();
        let descriptor = self.descriptor.clone();
        let local_name = self.config.local_name.clone();
        let settings = self.config.advertising.clone();
        let limit = self.config.host_timeout();
        let call = async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            bounded(limit, host.advertise(&descriptor, &local_name, &settings)).await
        }
        .boxed();
        Ok(Some(AdvertiseAttempt { id, call }))
    }

    fn finish_advertising(
        &mut self,
        attempt: u64,
        result: Result<(), BleError>,
    ) -> Result<(), BleError> {
        if self.advertise != AdvertiseState::Starting(attempt) {
            debug!("discarding outcome of superseded advertising attempt {}", attempt);
            return Err(BleError::Cancelled);
        }
        self.radio_op = None;
        match &result {
            Ok(()) => {
                self.advertise = AdvertiseState::Active;
                info!(
                    "advertising {} as {:?}",
                    self.descriptor.service_uuid(),
                    self.config.local_name
                );
                self.status(StatusEvent::AdvertisingChanged(true));
            }
            Err(e) => {
                self.advertise = AdvertiseState::Idle;
                warn!("advertising failed: {}", e);
                self.status(StatusEvent::AdvertiseFailed(e.clone()));
            }
        }
        if let Some(reply) = self.advertise_reply.take() {
            let _ = reply.send(result.clone());
        }
        result
    }

    /// Starts advertising and waits for the host to confirm.
    ///
    /// # Returns
    /// `Ok` right away when already advertising, `RadioUnavailable` while
    /// another attempt is in progress, `ShuttingDown` after shutdown, or the
    /// host's error.
    pub async fn start_advertising(&mut self) -> Result<(), BleError> {
        let Some(attempt) = self.begin_advertising()? else {
            return Ok(());
        };
        let result = attempt.call.await;
        self.finish_advertising(attempt.id, result)
    }

    /// Abandons an advertising attempt that has not reported back yet.
    fn cancel_pending_start(&mut self) {
        if let AdvertiseState::Starting(attempt) = self.advertise {
            debug!("cancelling advertising attempt {}", attempt);
            if let Some(reply) = self.advertise_reply.take() {
                let _ = reply.send(Err(BleError::Cancelled));
            }
            if let Some(task) = self.radio_op.take() {
                task.abort();
            }
        }
    }

    fn finish_stop(&mut self, result: &Result<(), BleError>) {
        if self.advertise != AdvertiseState::Stopping {
            debug!("advertising changed to {:?} while stopping", self.advertise);
            return;
        }
        self.radio_op = None;
        match result {
            Ok(()) => {
                self.advertise = AdvertiseState::Idle;
                info!("advertising stopped");
                self.status(StatusEvent::AdvertisingChanged(false));
            }
            Err(e) => {
                self.advertise = AdvertiseState::Active;
                warn!("could not stop advertising: {}", e);
            }
        }
    }

    /// Stops advertising and waits for the host. Does nothing if not
    /// advertising; a pending attempt is cancelled.
    pub async fn stop_advertising(&mut self) -> Result<(), BleError> {
        self.cancel_pending_start();
        if let Some(task) = self.radio_op.take() {
            task.abort();
        }
        if self.advertise == AdvertiseState::Idle {
            return Ok(());
        }
        self.advertise = AdvertiseState::Stopping;
        let result = bounded(self.config.host_timeout(), self.host.stop_advertising()).await;
        self.finish_stop(&result);
        result
    }

    /// Caches an accepted sample and notifies every subscribed peer.
    pub fn publish(&mut self, sample: HeartRateSample) -> DispatchTicket {
        self.last_sample = Some(sample);
        self.dispatcher.dispatch(&sample, self.peers.values())
    }

    /// Adds a freshly connected central to the table.
    pub fn on_connection_event(&mut self, peer: BDAddr) {
        if self.peers.contains_key(&peer) {
            debug!("{} reported connected twice", peer);
            return;
        }
        self.next_session += 1;
        self.peers
            .insert(peer, PeerConnection::connected(peer, self.next_session));
        info!("{} connected, {} peers", peer, self.peers.len());
        self.status(StatusEvent::PeerChanged {
            peer,
            state: LinkState::Connected,
        });
    }
    /// Applies a write to the configuration descriptor.
    ///
    /// Only the notification bit counts; a write enabling indications alone
    /// leaves the peer unsubscribed.
    pub fn on_subscription_event(&mut self, peer: BDAddr, value: &[u8]) {
        let subscribe = match value {
            [flags, _] => is_bit_set!(*flags, CCCD_NOTIFY_BIT),
            _ => {
                warn!("ignoring malformed CCCD write from {}: {:02x?}", peer, value);
                return;
            }
        };
        let Some(connection) = self.peers.get_mut(&peer) else {
            debug!("ignoring CCCD write from unknown peer {}", peer);
            return;
        };
        let input = if subscribe {
            peer_link::Input::Subscribe
        } else {
            peer_link::Input::Unsubscribe
        };
        let Some(state) = connection.apply(input) else {
            warn!(
                "{} cannot change subscription from {:?}",
                peer,
                connection.state()
            );
            return;
        };
        if state != LinkState::Subscribed {
            self.dispatcher.forget(&peer);
        }
        info!("{} is now {:?}", peer, state);
        self.status(StatusEvent::PeerChanged { peer, state });
    }

    /// Drops a departed central and cancels its outstanding notification.
    pub fn on_disconnection_event(&mut self, peer: BDAddr) {
        let Some(mut connection) = self.peers.remove(&peer) else {
            debug!("ignoring disconnect of unknown peer {}", peer);
            return;
        };
        connection.apply(peer_link::Input::Disconnect);
        self.dispatcher.forget(&peer);
        info!("{} disconnected, {} peers", peer, self.peers.len());
        self.status(StatusEvent::PeerChanged {
            peer,
            state: connection.state(),
        });
    }

    /// Answers a read of the measurement characteristic with the cached value.
    pub fn on_read_request(&self, peer: BDAddr, request_id: u32, offset: u16) -> JoinHandle<()> {
        let value = self
            .last_sample
            .map(|sample| {
                self.descriptor
                    .wire_format()
                    .encode(&sample, self.config.contact_supported)
            })
            .unwrap_or_default();
        let value = value
            .get(usize::from(offset)..)
            .unwrap_or_default()
            .to_vec();
        let host = self.host.clone();
        let limit = self.config.host_timeout();
        tokio::spawn(async move {
            if let Err(e) = bounded(limit, host.send_read_response(peer, request_id, &value)).await
            {
                warn!("could not answer read request {} of {}: {}", request_id, peer, e);
            }
        })
    }

    /// Connection sessions of the subscribed peers.
    fn subscriber_sessions(&self) -> Vec<(BDAddr, u64)> {
        self.peers
            .values()
            .filter(|peer| peer.is_subscribed())
            .map(|peer| (peer.identity(), peer.session()))
            .collect()
    }

    /// Records the outcome of a dispatch in the connection table.
    ///
    /// Deliveries only count for the connection they were sent on and while
    /// that connection is still subscribed.
    fn apply_report(&mut self, report: DispatchReport, sessions: &[(BDAddr, u64)]) {
        for peer in &report.delivered {
            let Some(connection) = self.peers.get_mut(peer) else {
                continue;
            };
            let same_session = sessions
                .iter()
                .any(|(identity, session)| identity == peer && *session == connection.session());
            if same_session && connection.is_subscribed() {
                connection.record_notified(report.bpm);
            } else {
                trace!("{} reconnected or unsubscribed since dispatch", peer);
            }
        }
        for e in report.errors() {
            warn!("{}", e);
        }
        debug!("dispatched {}", report);
        self.status(StatusEvent::Dispatched(report));
    }

    fn forward_report(&self, ticket: DispatchTicket, sessions: Vec<(BDAddr, u64)>) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let report = ticket.report().await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(PeripheralEvent::DispatchCompleted { report, sessions });
            }
        });
    }

    /// Filters a sensor reading and publishes it if accepted.
    fn ingest(&mut self, raw: HeartRateSample) {
        let Some(sample) = self.filter.accept(raw) else {
            return;
        };
        let sessions = self.subscriber_sessions();
        let ticket = self.publish(sample);
        trace!("{} bpm queued for {} peers", sample.bpm, ticket.targets());
        self.forward_report(ticket, sessions);
    }

    fn start_advertising_task(&mut self, reply: Reply) {
        match self.begin_advertising() {
            Ok(Some(AdvertiseAttempt { id, call })) => {
                self.advertise_reply = Some(reply);
                let events = self.events_tx.clone();
                self.radio_op = Some(tokio::spawn(async move {
                    let result = call.await;
                    if let Some(events) = events.upgrade() {
                        let _ = events.send(PeripheralEvent::AdvertiseFinished {
                            attempt: id,
                            result,
                        });
                    }
                }));
            }
            Ok(None) => {
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Stops advertising without blocking the owner task. The host call waits
    /// for the previous radio operation and reports back as `StopFinished`.
    fn stop_advertising_task(&mut self, reply: Reply) {
        self.cancel_pending_start();
        if self.advertise == AdvertiseState::Idle {
            let _ = reply.send(Ok(()));
            return;
        }
        self.advertise = AdvertiseState::Stopping;
        let previous = self.radio_op.take();
        let host = self.host.clone();
        let limit = self.config.host_timeout();
        let events = self.events_tx.clone();
        self.radio_op = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = bounded(limit, host.stop_advertising()).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(PeripheralEvent::StopFinished { result, reply });
            }
        }));
    }

    async fn handle_command(&mut self, command: PeripheralCommand) -> Result<()> {
        match command {
            PeripheralCommand::StartAdvertising(reply) => self.start_advertising_task(reply),
            PeripheralCommand::StopAdvertising(reply) => self.stop_advertising_task(reply),
            PeripheralCommand::Snapshot(reply) => {
                reply
                    .send(PeripheralSnapshot::capture(&*self))
                    .map_err(|_| anyhow!("snapshot requester went away"))?;
            }
            PeripheralCommand::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
        Ok(())
    }

    /// Processes one event from the queue.
    pub async fn handle_event(&mut self, event: PeripheralEvent) -> Result<()> {
        trace!("handling {:?}", event);
        match event {
            PeripheralEvent::SensorFault(e) => {
                warn!("sensor fault: {}", e);
                self.status(StatusEvent::SensorFault(e));
            }
            PeripheralEvent::ConnectionStateChanged { peer, state } => match state {
                ConnectionState::Connected => self.on_connection_event(peer),
                ConnectionState::Disconnected => self.on_disconnection_event(peer),
            },
            PeripheralEvent::DescriptorWritten {
                peer,
                descriptor,
                value,
            } => {
                if descriptor == self.descriptor.cccd_uuid() {
                    self.on_subscription_event(peer, &value);
                } else {
                    debug!("ignoring write to descriptor {} from {}", descriptor, peer);
                }
            }
            PeripheralEvent::NotifySent { peer, result } => match result {
                Ok(()) => trace!("host confirmed notification to {}", peer),
                Err(e) => debug!("host reported notification to {} failed: {}", peer, e),
            },
            PeripheralEvent::ReadRequested {
                peer,
                request_id,
                offset,
            } => {
                self.on_read_request(peer, request_id, offset);
            }
            PeripheralEvent::DispatchCompleted { report, sessions } => {
                self.apply_report(report, &sessions)
            }
            PeripheralEvent::AdvertiseFinished { attempt, result } => {
                // The requester, if any, already got its reply.
                let _ = self.finish_advertising(attempt, result);
            }
            PeripheralEvent::StopFinished { result, reply } => {
                self.finish_stop(&result);
                reply
                    .send(result)
                    .map_err(|_| anyhow!("stop advertising requester went away"))?;
            }
            PeripheralEvent::Command(command) => self.handle_command(command).await?,
        }
        Ok(())
    }

    /// Stops advertising, cancels every outstanding notification, clears the
    /// connection table and closes the GATT server, in that order.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stop_advertising().await {
            warn!("could not stop advertising: {}", e);
        }
        self.dispatcher.shutdown();
        self.peers.clear();
        if let Some(server) = self.server.take() {
            let limit = self.config.host_timeout();
            if tokio::time::timeout(limit, self.host.close_server(server))
                .await
                .is_err()
            {
                warn!("closing GATT server {:?} timed out", server);
            }
            info!("peripheral shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.server.is_none()
    }

    /// Consumes events and sensor readings until shutdown is requested or
    /// every handle is gone. Queued events go first.
    pub async fn run(mut self) {
        info!("peripheral event loop started");
        loop {
            tokio::select! {
                biased;
                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!("error during event handling: {}", e);
                        }
                    }
                    None => break,
                },
                Ok(()) = self.samples_rx.changed() => {
                    let raw = *self.samples_rx.borrow_and_update();
                    if let Some(raw) = raw {
                        self.ingest(raw);
                    }
                }
            }
            if self.is_shut_down() {
                break;
            }
        }
        self.shutdown().await;
        info!("peripheral event loop stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

impl<H: BleHost> PeripheralModelApi for GattPeripheral<H> {
    fn get_descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn is_advertising(&self) -> bool {
        self.advertise == AdvertiseState::Active
    }

    fn get_last_sample(&self) -> Option<&HeartRateSample> {
        self.last_sample.as_ref()
    }

    fn get_peers(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self.peers.values().map(PeerSummary::from).collect();
        peers.sort_by_key(|peer| peer.identity);
        peers
    }
}
