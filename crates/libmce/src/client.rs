use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use mce_protocol::{Handle, Originator, PeerId, ServiceRecord};

use crate::machine::{ConnectionState, ConnectionStateMachine, Input, OutboundMessage};
use crate::notify::NotificationRegistry;
use crate::session::{DiscoveryDriver, SessionFactory};

/// Tunables for one managed connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    /// Ring of pushed-message handles kept for receipt correlation.
    pub sent_log_capacity: usize,
    /// Instance identifier the peer names in event deliveries.
    pub instance_id: u8,
    /// Depth of every bounded queue in this core.
    pub queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(10),
            sent_log_capacity: 10,
            instance_id: 0,
            queue_depth: 64,
        }
    }
}

/// Events raised to the host service.
#[derive(Debug)]
pub enum ClientEvent {
    ConnectionStateChanged {
        peer: Option<PeerId>,
        old: ConnectionState,
        new: ConnectionState,
    },
    MessageReceived {
        peer: PeerId,
        sender: Option<Originator>,
        body: String,
        handle: Handle,
    },
}

/// Handle the host service drives the connection through. Every operation
/// only enqueues; outcomes arrive as [`ClientEvent`]s.
pub struct MceClient {
    tx: mpsc::Sender<Input>,
    state_rx: watch::Receiver<ConnectionState>,
    current_peer: Arc<Mutex<Option<PeerId>>>,
}

impl MceClient {
    /// Start the connection manager. The returned receiver carries
    /// state-changed and message-received events until the client is
    /// dropped.
    pub fn spawn<F, D>(
        factory: F,
        discovery: D,
        registry: Arc<NotificationRegistry>,
        config: ClientConfig,
    ) -> (MceClient, mpsc::Receiver<ClientEvent>)
    where
        F: SessionFactory,
        D: DiscoveryDriver + Sync,
    {
        let depth = config.queue_depth.max(1);
        let (tx, rx) = mpsc::channel(depth);
        let (event_tx, event_rx) = mpsc::channel(depth);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let current_peer = Arc::new(Mutex::new(None));

        let machine = ConnectionStateMachine::new(
            factory,
            discovery,
            registry,
            config,
            rx,
            tx.downgrade(),
            event_tx,
            state_tx,
            current_peer.clone(),
        );
        tokio::spawn(machine.run());

        (MceClient { tx, state_rx, current_peer }, event_rx)
    }

    /// Ask to connect to a peer. Always accepted; watch the event stream
    /// for the outcome.
    pub fn connect(&self, peer: PeerId) -> bool {
        self.tx.try_send(Input::Connect(peer)).is_ok()
    }

    /// Ask to release a peer.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        self.tx.try_send(Input::Disconnect(peer)).is_ok()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// The peer currently being managed, if any. Safe to call from any
    /// thread concurrently with connection processing.
    pub fn connected_peer(&self) -> Option<PeerId> {
        match self.current_peer.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Queue an outbound message. Fails fast, enqueueing nothing, when the
    /// recipient list is empty or the peer is not connected. The optional
    /// completion handles fire at most once each.
    pub fn send_message(
        &self,
        peer: &PeerId,
        recipients: Vec<String>,
        body: impl Into<String>,
        on_sent: Option<oneshot::Sender<()>>,
        on_delivered: Option<oneshot::Sender<()>>,
    ) -> bool {
        if recipients.is_empty() {
            debug!("rejecting send with no recipients");
            return false;
        }
        if !self.ready_for(peer) {
            return false;
        }
        self.tx
            .try_send(Input::Send(OutboundMessage {
                recipients,
                body: body.into(),
                on_sent,
                on_delivered,
            }))
            .is_ok()
    }

    /// Pull the unread listing from the peer's inbox; each resolved inbox
    /// message surfaces as a `MessageReceived` event.
    pub fn fetch_unread_messages(&self, peer: &PeerId) -> bool {
        self.ready_for(peer) && self.tx.try_send(Input::FetchUnread).is_ok()
    }

    /// Fetch one message by handle.
    pub fn fetch_message(&self, peer: &PeerId, handle: Handle) -> bool {
        self.ready_for(peer) && self.tx.try_send(Input::FetchMessage(handle)).is_ok()
    }

    // --- collaborator inputs -------------------------------------------------

    /// Discovery collaborator: the peer's service record was found.
    pub fn discovery_result(&self, record: ServiceRecord) -> bool {
        self.tx.try_send(Input::DiscoveryResult(record)).is_ok()
    }

    /// Discovery collaborator: the search ended without a usable record.
    pub fn discovery_failed(&self, status: i32) -> bool {
        self.tx.try_send(Input::DiscoveryFailed(status)).is_ok()
    }

    /// Link-layer collaborator: the physical link to a peer dropped.
    pub fn peer_link_lost(&self, peer: PeerId) -> bool {
        self.tx.try_send(Input::PeerLinkLost(peer)).is_ok()
    }

    fn ready_for(&self, peer: &PeerId) -> bool {
        if self.connection_state() != ConnectionState::Connected {
            debug!("rejecting request while not connected");
            return false;
        }
        if self.connected_peer().as_ref() != Some(peer) {
            debug!(%peer, "rejecting request for a peer we do not manage");
            return false;
        }
        true
    }
}
