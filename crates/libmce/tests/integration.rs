//! End-to-end scenarios: a host service driving the client against a fake
//! transport backend, with the peer pushing event reports over a real
//! notification link.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use libmce::{
    ClientConfig, ClientEvent, ConnectionState, DiscoveryDriver, MceClient, MnsServer,
    NotificationRegistry, Request, RequestOutcome, SessionBackend, SessionFactory, TransportFault,
};
use mce_protocol::{
    folders, Bearer, MessageEnvelope, MessageStatus, Originator, PeerId, RemoteEndpoint,
    ServiceRecord, EVENT_REPORT_TYPE, MNS_TARGET, MSG_TYPE_SMS_CDMA, MSG_TYPE_SMS_GSM,
};

const PEER: &str = "AA:BB:CC:DD:EE:FF";

#[derive(Clone)]
struct FakeFactory {
    log: Arc<Mutex<Vec<Request>>>,
    pushes: Arc<AtomicUsize>,
}

impl FakeFactory {
    fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            pushes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn logged(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    async fn wait_for(&self, n: usize) -> Vec<Request> {
        for _ in 0..400 {
            let logged = self.logged();
            if logged.len() >= n {
                return logged;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("backend never saw {n} requests, got {:?}", self.logged());
    }
}

struct FakeBackend {
    log: Arc<Mutex<Vec<Request>>>,
    pushes: Arc<AtomicUsize>,
}

impl SessionFactory for FakeFactory {
    type Backend = FakeBackend;

    fn create(&self, _endpoint: &RemoteEndpoint) -> FakeBackend {
        FakeBackend {
            log: self.log.clone(),
            pushes: self.pushes.clone(),
        }
    }
}

impl SessionBackend for FakeBackend {
    async fn open(&mut self, _endpoint: &RemoteEndpoint) -> Result<(), TransportFault> {
        Ok(())
    }

    async fn execute(&mut self, request: &Request) -> Result<RequestOutcome, TransportFault> {
        self.log.lock().unwrap().push(request.clone());
        Ok(match request {
            Request::PushMessage { .. } => {
                let n = self.pushes.fetch_add(1, Ordering::SeqCst);
                RequestOutcome::Pushed { handle: format!("out-{n}") }
            }
            Request::GetMessage { handle, .. } => RequestOutcome::Message {
                envelope: MessageEnvelope {
                    bearer: Bearer::SmsCdma,
                    status: MessageStatus::Unread,
                    originator: Some(Originator {
                        name: None,
                        number: "+15552221111".to_string(),
                    }),
                    recipients: vec![],
                    body: format!("body of {handle}"),
                    folder: if handle.starts_with("in-") {
                        folders::INBOX.to_string()
                    } else {
                        "sent".to_string()
                    },
                },
            },
            Request::GetMessagesListing { .. } => RequestOutcome::Listing {
                handles: vec!["in-1".to_string(), "in-2".to_string(), "out-0".to_string()],
            },
            Request::GetFolderListing { .. } => RequestOutcome::FolderListing { count: 0 },
            _ => RequestOutcome::Done,
        })
    }

    async fn close(&mut self) {}
}

struct NoopDiscovery;

impl DiscoveryDriver for NoopDiscovery {
    fn start(&mut self, _peer: &PeerId) {}
    fn cancel(&mut self, _peer: &PeerId) {}
}

fn record() -> ServiceRecord {
    ServiceRecord {
        channel: 4,
        version: 0x0102,
        supported_features: 0x1f,
        supported_message_types: MSG_TYPE_SMS_CDMA | MSG_TYPE_SMS_GSM,
    }
}

async fn next_state(events: &mut mpsc::Receiver<ClientEvent>) -> ConnectionState {
    loop {
        match events.recv().await.expect("client event") {
            ClientEvent::ConnectionStateChanged { new, .. } => return new,
            ClientEvent::MessageReceived { .. } => continue,
        }
    }
}

/// The peer's side of the notification link.
struct NotifyPeer {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl NotifyPeer {
    async fn connect(server: &MnsServer) -> NotifyPeer {
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (r, w) = stream.into_split();
        let mut peer = NotifyPeer { reader: BufReader::new(r), writer: w };
        let line = format!(r#"{{"op":"connect","target":"{MNS_TARGET}"}}"#);
        assert_eq!(peer.roundtrip(&line).await, r#"{"code":"ok"}"#);
        peer
    }

    async fn roundtrip(&mut self, line: &str) -> String {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
        let mut reply = String::new();
        self.reader.read_line(&mut reply).await.unwrap();
        reply.trim().to_string()
    }

    async fn send_event(&mut self, kind: &str, handle: &str) {
        let line = format!(
            r#"{{"op":"send_event","content_type":"{EVENT_REPORT_TYPE}","instance_id":0,"report":{{"kind":"{kind}","handle":"{handle}"}}}}"#
        );
        assert_eq!(self.roundtrip(&line).await, r#"{"code":"ok"}"#);
    }
}

#[tokio::test]
async fn full_session_lifecycle() {
    let registry = Arc::new(NotificationRegistry::new());
    let server = MnsServer::bind("127.0.0.1:0".parse().unwrap(), registry.clone())
        .await
        .unwrap();

    let factory = FakeFactory::new();
    let (client, mut events) = MceClient::spawn(
        factory.clone(),
        NoopDiscovery,
        registry,
        ClientConfig::default(),
    );

    // Connect: host request, then the discovery collaborator reports back.
    assert!(client.connect(PEER.to_string()));
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert!(client.discovery_result(record()));
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

    // The fixed bootstrap sequence.
    let logged = factory.wait_for(6).await;
    assert_eq!(
        logged,
        vec![
            Request::SetFolder { path: "telecom".to_string() },
            Request::SetFolder { path: "msg".to_string() },
            Request::SetFolder { path: "inbox".to_string() },
            Request::GetFolderListing { offset: 0, count: 0 },
            Request::SetFolder { path: String::new() },
            Request::SetNotificationRegistration { enable: true },
        ]
    );

    // Send a message and track both receipts.
    let (sent_tx, sent_rx) = oneshot::channel();
    let (delivered_tx, delivered_rx) = oneshot::channel();
    assert!(client.send_message(
        &PEER.to_string(),
        vec!["+15550001111".to_string()],
        "on my way",
        Some(sent_tx),
        Some(delivered_tx),
    ));
    factory.wait_for(7).await;
    // Give the machine a beat to log the assigned handle.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The peer pushes receipts over the notification link.
    let mut peer = NotifyPeer::connect(&server).await;
    peer.send_event("sending_success", "out-0").await;
    sent_rx.await.expect("sent receipt fires");
    peer.send_event("delivery_success", "out-0").await;
    delivered_rx.await.expect("delivered receipt fires");

    // A new inbound message is fetched and surfaced to the host.
    peer.send_event("new_message", "in-7").await;
    match events.recv().await.expect("client event") {
        ClientEvent::MessageReceived { peer, handle, body, sender } => {
            assert_eq!(peer, PEER);
            assert_eq!(handle, "in-7");
            assert_eq!(body, "body of in-7");
            assert_eq!(sender.unwrap().number, "+15552221111");
        }
        other => panic!("expected message-received, got {other:?}"),
    }

    // Disconnect: notifications switched off, worker shut down, peer released.
    assert!(client.disconnect(PEER.to_string()));
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
    assert_eq!(
        factory.logged().last(),
        Some(&Request::SetNotificationRegistration { enable: false })
    );
    assert_eq!(client.connected_peer(), None);

    server.stop();
}

#[tokio::test]
async fn unread_fetch_surfaces_only_inbox_messages() {
    let registry = Arc::new(NotificationRegistry::new());
    let factory = FakeFactory::new();
    let (client, mut events) = MceClient::spawn(
        factory.clone(),
        NoopDiscovery,
        registry,
        ClientConfig::default(),
    );

    assert!(client.connect(PEER.to_string()));
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert!(client.discovery_result(record()));
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
    factory.wait_for(6).await;

    assert!(client.fetch_unread_messages(&PEER.to_string()));
    // Listing of three handles fans out into three fetches.
    let logged = factory.wait_for(10).await;
    let fetched: Vec<_> = logged
        .iter()
        .filter_map(|r| match r {
            Request::GetMessage { handle, .. } => Some(handle.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(fetched, ["in-1", "in-2", "out-0"]);

    // Only the two inbox envelopes reach the host.
    let mut received = Vec::new();
    for _ in 0..2 {
        match events.recv().await.expect("client event") {
            ClientEvent::MessageReceived { handle, .. } => received.push(handle),
            other => panic!("expected message-received, got {other:?}"),
        }
    }
    received.sort();
    assert_eq!(received, ["in-1", "in-2"]);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn notification_link_rejects_unknown_target() {
    let registry = Arc::new(NotificationRegistry::new());
    let server = MnsServer::bind("127.0.0.1:0".parse().unwrap(), registry)
        .await
        .unwrap();

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (r, w) = stream.into_split();
    let mut peer = NotifyPeer { reader: BufReader::new(r), writer: w };

    assert_eq!(
        peer.roundtrip(r#"{"op":"connect","target":"0000"}"#).await,
        r#"{"code":"not_acceptable"}"#
    );
    assert_eq!(
        peer.roundtrip(r#"{"op":"get"}"#).await,
        r#"{"code":"not_implemented"}"#
    );
}
