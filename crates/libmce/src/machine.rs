use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mce_protocol::{
    folders, Bearer, EventKind, EventReport, Handle, MessageEnvelope, MessageStatus, PeerId,
    RemoteEndpoint, ServiceRecord,
};

use crate::client::{ClientConfig, ClientEvent};
use crate::notify::NotificationRegistry;
use crate::request::{ListingParams, Request, RequestOutcome};
use crate::session::{DiscoveryDriver, SessionFactory};
use crate::worker::{MasWorker, WorkerEvent};

/// Connection lifecycle of the managed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A message the host asked us to send, together with its completion
/// handles. Payloads transfer ownership into the machine.
#[derive(Debug)]
pub struct OutboundMessage {
    pub recipients: Vec<String>,
    pub body: String,
    pub on_sent: Option<oneshot::Sender<()>>,
    pub on_delivered: Option<oneshot::Sender<()>>,
}

/// Everything that can land on the machine's input queue: host requests,
/// collaborator reports, worker notifications and epoch-tagged timeouts.
#[derive(Debug)]
pub enum Input {
    Connect(PeerId),
    Disconnect(PeerId),
    Send(OutboundMessage),
    FetchMessage(Handle),
    FetchUnread,
    DiscoveryResult(ServiceRecord),
    DiscoveryFailed(i32),
    PeerLinkLost(PeerId),
    Notification(EventReport),
    Worker { worker: Uuid, event: WorkerEvent },
    Timeout(u64),
}

enum Receipt {
    Sent,
    Delivered,
}

pub(crate) struct ConnectionStateMachine<F: SessionFactory, D: DiscoveryDriver> {
    factory: F,
    discovery: D,
    registry: Arc<NotificationRegistry>,
    config: ClientConfig,

    rx: mpsc::Receiver<Input>,
    /// Weak self-reference handed to timeouts, workers and the registry.
    /// Only the host's client handle holds the channel open, so dropping
    /// the client drains and stops this task.
    self_tx: mpsc::WeakSender<Input>,
    events: mpsc::Sender<ClientEvent>,
    state_tx: watch::Sender<ConnectionState>,
    current_peer: Arc<Mutex<Option<PeerId>>>,

    state: ConnectionState,
    endpoint: Option<RemoteEndpoint>,
    worker: Option<MasWorker>,
    default_bearer: Option<Bearer>,

    /// State epoch guarding delayed self-messages; a timeout whose tag does
    /// not match is stale and ignored.
    epoch: u64,
    timeout_task: Option<JoinHandle<()>>,

    /// Connect/disconnect requests that arrived mid-transition, redelivered
    /// in order once the state settles.
    deferred: VecDeque<Input>,
    /// Redelivered inputs, consumed before the channel.
    pending: VecDeque<Input>,

    sent_log: VecDeque<(Handle, Uuid)>,
    sent_waiters: HashMap<Uuid, oneshot::Sender<()>>,
    delivered_waiters: HashMap<Uuid, oneshot::Sender<()>>,
}

impl<F: SessionFactory, D: DiscoveryDriver> ConnectionStateMachine<F, D> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        factory: F,
        discovery: D,
        registry: Arc<NotificationRegistry>,
        config: ClientConfig,
        rx: mpsc::Receiver<Input>,
        self_tx: mpsc::WeakSender<Input>,
        events: mpsc::Sender<ClientEvent>,
        state_tx: watch::Sender<ConnectionState>,
        current_peer: Arc<Mutex<Option<PeerId>>>,
    ) -> Self {
        Self {
            factory,
            discovery,
            registry,
            config,
            rx,
            self_tx,
            events,
            state_tx,
            current_peer,
            state: ConnectionState::Disconnected,
            endpoint: None,
            worker: None,
            default_bearer: None,
            epoch: 0,
            timeout_task: None,
            deferred: VecDeque::new(),
            pending: VecDeque::new(),
            sent_log: VecDeque::new(),
            sent_waiters: HashMap::new(),
            delivered_waiters: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let input = match self.pending.pop_front() {
                Some(input) => input,
                None => match self.rx.recv().await {
                    Some(input) => input,
                    None => break,
                },
            };
            self.handle(input).await;
        }
        self.cancel_timeout();
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        self.registry.unregister(self.config.instance_id).await;
        self.set_current_peer(None);
        debug!("connection state machine exited");
    }

    async fn handle(&mut self, input: Input) {
        match self.state {
            ConnectionState::Disconnected => self.on_disconnected(input).await,
            ConnectionState::Connecting => self.on_connecting(input).await,
            ConnectionState::Connected => self.on_connected(input).await,
            ConnectionState::Disconnecting => self.on_disconnecting(input).await,
        }
    }

    async fn on_disconnected(&mut self, input: Input) {
        match input {
            Input::Connect(peer) => {
                info!(%peer, "connect requested");
                self.set_current_peer(Some(peer));
                self.transition(ConnectionState::Connecting).await;
            }
            other => self.discard(other),
        }
    }

    async fn on_connecting(&mut self, input: Input) {
        match input {
            Input::DiscoveryResult(record) => {
                if self.worker.is_some() {
                    debug!("duplicate discovery result, session worker already running");
                    return;
                }
                let Some(peer) = self.current_peer() else {
                    warn!("discovery result without a peer");
                    return;
                };
                let bearer = record.default_bearer();
                self.default_bearer = Some(bearer);
                let endpoint = RemoteEndpoint { peer, record };
                info!(
                    peer = %endpoint.peer,
                    channel = endpoint.record.channel,
                    ?bearer,
                    "service discovered, opening session"
                );
                let backend = self.factory.create(&endpoint);
                let worker = MasWorker::spawn(
                    backend,
                    endpoint.clone(),
                    self.self_tx.clone(),
                    self.config.queue_depth,
                );
                self.endpoint = Some(endpoint);
                self.worker = Some(worker);
            }
            Input::DiscoveryFailed(status) => {
                warn!(status, "service discovery failed");
                self.transition(ConnectionState::Disconnecting).await;
            }
            Input::Worker { worker, event } if self.from_current_worker(worker) => match event {
                WorkerEvent::SessionConnected => {
                    if let Some(endpoint) = &self.endpoint {
                        info!(
                            peer = %endpoint.peer,
                            version = endpoint.record.version,
                            "session established"
                        );
                    }
                    self.transition(ConnectionState::Connected).await;
                }
                WorkerEvent::SessionDisconnected => {
                    warn!("session open failed");
                    self.transition(ConnectionState::Disconnecting).await;
                }
                WorkerEvent::RequestCompleted { request, .. } => {
                    debug!(?request, "ignoring request completion while connecting");
                }
            },
            Input::Timeout(epoch) if epoch == self.epoch => {
                warn!("connect timed out");
                self.transition(ConnectionState::Disconnecting).await;
            }
            Input::PeerLinkLost(peer) if self.is_current(&peer) => {
                warn!(%peer, "link lost while connecting");
                self.transition(ConnectionState::Disconnecting).await;
            }
            input @ (Input::Connect(_) | Input::Disconnect(_)) => self.defer(input),
            other => self.discard(other),
        }
    }

    async fn on_connected(&mut self, input: Input) {
        match input {
            Input::Disconnect(peer) => {
                if self.is_current(&peer) {
                    info!(%peer, "disconnect requested");
                    self.transition(ConnectionState::Disconnecting).await;
                } else {
                    debug!(%peer, "ignoring disconnect for unknown peer");
                }
            }
            Input::Connect(peer) => {
                if self.is_current(&peer) {
                    debug!(%peer, "already connected");
                } else {
                    // Release the current peer first; the deferred connect
                    // replays once we are back in Disconnected.
                    self.defer(Input::Connect(peer));
                    self.transition(ConnectionState::Disconnecting).await;
                }
            }
            Input::Send(outbound) => self.push_message(outbound),
            Input::FetchMessage(handle) => {
                self.submit(Request::get_message(handle));
            }
            Input::FetchUnread => {
                self.submit(Request::GetMessagesListing {
                    folder: folders::INBOX.to_string(),
                    params: ListingParams::default(),
                });
            }
            Input::Notification(report) => self.on_event_report(report),
            Input::Worker { worker, event } if self.from_current_worker(worker) => match event {
                WorkerEvent::RequestCompleted { request, outcome } => {
                    self.on_request_completed(request, outcome).await;
                }
                WorkerEvent::SessionDisconnected => {
                    warn!("session lost");
                    self.transition(ConnectionState::Disconnecting).await;
                }
                WorkerEvent::SessionConnected => debug!("duplicate session connect"),
            },
            Input::PeerLinkLost(peer) if self.is_current(&peer) => {
                warn!(%peer, "link lost");
                self.transition(ConnectionState::Disconnecting).await;
            }
            other => self.discard(other),
        }
    }

    async fn on_disconnecting(&mut self, input: Input) {
        match input {
            Input::Worker { worker, event } if self.from_current_worker(worker) => match event {
                WorkerEvent::SessionDisconnected => {
                    self.worker = None;
                    self.transition(ConnectionState::Disconnected).await;
                }
                WorkerEvent::RequestCompleted { request, .. } => {
                    debug!(?request, "ignoring late request completion");
                }
                WorkerEvent::SessionConnected => debug!("ignoring late session connect"),
            },
            Input::Timeout(epoch) if epoch == self.epoch => {
                warn!("disconnect timed out, releasing peer");
                self.worker = None;
                self.transition(ConnectionState::Disconnected).await;
            }
            input @ (Input::Connect(_) | Input::Disconnect(_)) => self.defer(input),
            other => self.discard(other),
        }
    }

    // --- transitions ------------------------------------------------------

    async fn transition(&mut self, next: ConnectionState) {
        let mut next = Some(next);
        while let Some(target) = next.take() {
            let previous = self.state;
            if previous == target {
                break;
            }
            self.exit_state(previous);
            self.state = target;
            let _ = self.state_tx.send(target);
            info!(from = ?previous, to = ?target, "connection state changed");
            self.emit(ClientEvent::ConnectionStateChanged {
                peer: self.current_peer(),
                old: previous,
                new: target,
            })
            .await;
            next = self.enter_state(target).await;
            if next.is_none() {
                self.settle();
            }
        }
    }

    fn exit_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting | ConnectionState::Disconnecting => self.cancel_timeout(),
            ConnectionState::Connected | ConnectionState::Disconnected => {}
        }
    }

    /// Entry hook; may chain straight into another state.
    async fn enter_state(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        match state {
            ConnectionState::Connecting => {
                self.enter_connecting().await;
                None
            }
            ConnectionState::Connected => self.enter_connected(),
            ConnectionState::Disconnecting => self.enter_disconnecting().await,
            ConnectionState::Disconnected => {
                self.enter_disconnected();
                None
            }
        }
    }

    async fn enter_connecting(&mut self) {
        let Some(peer) = self.current_peer() else {
            warn!("entered connecting without a peer");
            return;
        };
        self.registry
            .register(self.config.instance_id, self.self_tx.clone())
            .await;
        self.discovery.cancel(&peer);
        self.discovery.start(&peer);
        self.arm_timeout(self.config.connect_timeout);
    }

    fn enter_connected(&mut self) -> Option<ConnectionState> {
        let bootstrap = [
            Request::SetFolder { path: folders::TELECOM.to_string() },
            Request::SetFolder { path: folders::MSG.to_string() },
            Request::SetFolder { path: folders::INBOX.to_string() },
            Request::GetFolderListing { offset: 0, count: 0 },
            Request::SetFolder { path: folders::ROOT.to_string() },
            Request::SetNotificationRegistration { enable: true },
        ];
        for request in bootstrap {
            if !self.submit(request) {
                warn!("bootstrap request rejected, tearing down");
                return Some(ConnectionState::Disconnecting);
            }
        }
        None
    }

    async fn enter_disconnecting(&mut self) -> Option<ConnectionState> {
        self.registry.unregister(self.config.instance_id).await;
        if let Some(peer) = self.current_peer() {
            self.discovery.cancel(&peer);
        }
        match self.worker.as_mut() {
            Some(worker) => {
                if !worker.submit(Request::SetNotificationRegistration { enable: false }) {
                    debug!("could not queue notification de-registration");
                }
                worker.shutdown();
                self.arm_timeout(self.config.disconnect_timeout);
                None
            }
            None => Some(ConnectionState::Disconnected),
        }
    }

    fn enter_disconnected(&mut self) {
        self.worker = None;
        self.endpoint = None;
        self.default_bearer = None;
        self.set_current_peer(None);
        self.sent_log.clear();
        // Dropping the senders cancels the host's completion handles.
        self.sent_waiters.clear();
        self.delivered_waiters.clear();
    }

    /// Redeliver deferred inputs ahead of anything still in the channel,
    /// preserving their original order.
    fn settle(&mut self) {
        while let Some(input) = self.deferred.pop_back() {
            self.pending.push_front(input);
        }
    }

    // --- connected-state work ---------------------------------------------

    fn push_message(&mut self, outbound: OutboundMessage) {
        let OutboundMessage { recipients, body, on_sent, on_delivered } = outbound;
        let envelope_id = Uuid::new_v4();
        let envelope = MessageEnvelope {
            bearer: self.default_bearer.unwrap_or(Bearer::SmsGsm),
            status: MessageStatus::Read,
            originator: None,
            recipients,
            body,
            folder: folders::OUTBOX.to_string(),
        };
        if let Some(tx) = on_sent {
            self.sent_waiters.insert(envelope_id, tx);
        }
        if let Some(tx) = on_delivered {
            self.delivered_waiters.insert(envelope_id, tx);
        }
        self.submit(Request::push_message(
            folders::OUTBOX.to_string(),
            envelope,
            envelope_id,
        ));
    }

    fn on_event_report(&mut self, report: EventReport) {
        match report.kind {
            EventKind::NewMessage => {
                info!(handle = %report.handle, "new message reported");
                self.submit(Request::get_message(report.handle));
            }
            EventKind::SendingSuccess => self.fire_waiter(&report.handle, Receipt::Sent),
            EventKind::DeliverySuccess => self.fire_waiter(&report.handle, Receipt::Delivered),
            other => {
                debug!(kind = ?other, handle = %report.handle, "unhandled event report");
            }
        }
    }

    fn fire_waiter(&mut self, handle: &Handle, receipt: Receipt) {
        let Some(envelope_id) = self
            .sent_log
            .iter()
            .find(|(logged, _)| logged == handle)
            .map(|(_, id)| *id)
        else {
            debug!(%handle, "receipt for a message we did not log");
            return;
        };
        let table = match receipt {
            Receipt::Sent => &mut self.sent_waiters,
            Receipt::Delivered => &mut self.delivered_waiters,
        };
        if let Some(tx) = table.remove(&envelope_id) {
            // The host may have dropped its end; either way the waiter is gone.
            let _ = tx.send(());
        }
    }

    async fn on_request_completed(&mut self, request: Request, outcome: RequestOutcome) {
        match (request, outcome) {
            (
                Request::PushMessage { envelope_id, .. },
                RequestOutcome::Pushed { handle },
            ) => {
                debug!(%handle, "message pushed");
                self.sent_log.push_back((handle, envelope_id));
                while self.sent_log.len() > self.config.sent_log_capacity {
                    self.sent_log.pop_front();
                }
            }
            (
                Request::GetMessage { handle, .. },
                RequestOutcome::Message { envelope },
            ) => {
                if envelope.folder == folders::INBOX {
                    if let Some(peer) = self.current_peer() {
                        self.emit(ClientEvent::MessageReceived {
                            peer,
                            sender: envelope.originator,
                            body: envelope.body,
                            handle,
                        })
                        .await;
                    }
                } else {
                    debug!(%handle, folder = %envelope.folder, "dropping non-inbox message");
                }
            }
            (
                Request::GetMessagesListing { .. },
                RequestOutcome::Listing { handles },
            ) => {
                info!(count = handles.len(), "messages listing received");
                for handle in handles {
                    self.submit(Request::get_message(handle));
                }
            }
            (
                Request::SetFolder { .. }
                | Request::GetFolderListing { .. }
                | Request::SetNotificationRegistration { .. },
                _,
            ) => {}
            (request, outcome) => {
                debug!(?request, ?outcome, "mismatched request completion");
            }
        }
    }

    // --- plumbing -----------------------------------------------------------

    fn submit(&mut self, request: Request) -> bool {
        let Some(worker) = self.worker.as_ref() else {
            warn!(?request, "no session worker, dropping request");
            return false;
        };
        if !worker.submit(request) {
            warn!("session worker queue rejected request");
            return false;
        }
        true
    }

    fn defer(&mut self, input: Input) {
        debug!(?input, state = ?self.state, "deferring until transition settles");
        self.deferred.push_back(input);
    }

    fn discard(&self, input: Input) {
        debug!(?input, state = ?self.state, "discarding event with no transition");
    }

    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            debug!("host event receiver dropped");
        }
    }

    fn arm_timeout(&mut self, after: Duration) {
        self.cancel_timeout();
        let epoch = self.epoch;
        let tx = self.self_tx.clone();
        self.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Input::Timeout(epoch)).await;
            }
        }));
    }

    fn cancel_timeout(&mut self) {
        // Bumping the epoch also invalidates any timeout already queued.
        self.epoch += 1;
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }

    fn from_current_worker(&self, worker: Uuid) -> bool {
        self.worker.as_ref().is_some_and(|w| w.id() == worker)
    }

    fn is_current(&self, peer: &PeerId) -> bool {
        self.current_peer().as_ref() == Some(peer)
    }

    fn current_peer(&self) -> Option<PeerId> {
        match self.current_peer.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_current_peer(&self, peer: Option<PeerId>) {
        match self.current_peer.lock() {
            Ok(mut guard) => *guard = peer,
            Err(mut poisoned) => **poisoned.get_mut() = peer,
        }
    }
}
