use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use mce_protocol::{
    EventReport, NotifyRequest, NotifyResponse, ResponseCode, EVENT_REPORT_TYPE, MAX_LINE_BYTES,
    MNS_TARGET,
};

use crate::machine::Input;

/// Registration table between the process-wide notification listener and
/// whichever connection is currently active. Registrations are weak senders,
/// so the table keeps no machine alive; a dead registration just drops
/// reports.
#[derive(Default)]
pub struct NotificationRegistry {
    clients: Mutex<HashMap<u8, mpsc::WeakSender<Input>>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn register(&self, instance_id: u8, tx: mpsc::WeakSender<Input>) {
        self.clients.lock().await.insert(instance_id, tx);
    }

    pub(crate) async fn unregister(&self, instance_id: u8) {
        self.clients.lock().await.remove(&instance_id);
    }

    /// Forward a parsed report to the registered connection, if any.
    pub(crate) async fn deliver(&self, instance_id: u8, report: EventReport) -> bool {
        let Some(tx) = self
            .clients
            .lock()
            .await
            .get(&instance_id)
            .and_then(|tx| tx.upgrade())
        else {
            return false;
        };
        tx.try_send(Input::Notification(report)).is_ok()
    }
}

/// Listener the peer connects back to for pushing event reports. One per
/// host-service instance, independent of which peer is connected.
pub struct MnsServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MnsServer {
    /// Bind the listening resource and start serving. Connections are
    /// handled one at a time.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<NotificationRegistry>,
    ) -> std::io::Result<MnsServer> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "notification listener ready");
        let task = tokio::spawn(accept_loop(listener, registry));
        Ok(MnsServer { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Release the listening resource.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MnsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, registry: Arc<NotificationRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tracing::debug!(%remote, "notification connection accepted");
                if let Err(e) = handle_stream(stream, &registry).await {
                    tracing::debug!(err = %e, "notification connection ended");
                }
            }
            Err(e) => {
                tracing::warn!(err = %e, "notification accept failed");
                break;
            }
        }
    }
}

/// Serve one inbound connection. Every operation gets an answer; faults
/// become negative response codes, never errors across the link.
pub(crate) async fn handle_stream<S>(stream: S, registry: &NotificationRegistry) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(stream);
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut connected = false;

    while let Some(line) = reader.next().await {
        let line = line?;
        let code = match serde_json::from_str::<NotifyRequest>(&line) {
            Ok(request) => dispatch(request, &mut connected, registry).await,
            Err(e) => {
                tracing::debug!(err = %e, "unparseable notification operation");
                ResponseCode::BadRequest
            }
        };
        let reply = serde_json::to_string(&NotifyResponse { code })?;
        writer.send(reply).await?;
    }
    Ok(())
}

async fn dispatch(
    request: NotifyRequest,
    connected: &mut bool,
    registry: &NotificationRegistry,
) -> ResponseCode {
    match request {
        NotifyRequest::Connect { target } => {
            if target == MNS_TARGET {
                *connected = true;
                ResponseCode::Ok
            } else {
                tracing::warn!(%target, "rejecting notification connect, unknown target");
                ResponseCode::NotAcceptable
            }
        }
        NotifyRequest::SendEvent { content_type, instance_id, report } => {
            if !*connected || content_type != EVENT_REPORT_TYPE {
                return ResponseCode::BadRequest;
            }
            let Some(instance_id) = instance_id else {
                return ResponseCode::BadRequest;
            };
            match serde_json::from_value::<EventReport>(report) {
                Ok(report) => {
                    if registry.deliver(instance_id, report).await {
                        ResponseCode::Ok
                    } else {
                        tracing::debug!(instance_id, "no active connection for report");
                        ResponseCode::ServiceUnavailable
                    }
                }
                Err(e) => {
                    tracing::debug!(err = %e, "malformed event report");
                    ResponseCode::BadRequest
                }
            }
        }
        NotifyRequest::Get | NotifyRequest::SetFolder | NotifyRequest::Abort => {
            ResponseCode::NotImplemented
        }
    }
}
