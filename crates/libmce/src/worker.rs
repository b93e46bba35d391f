use mce_protocol::RemoteEndpoint;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::machine::Input;
use crate::request::{Request, RequestOutcome};
use crate::session::SessionBackend;

/// Commands serialized onto the worker's queue.
#[derive(Debug)]
enum WorkerCommand {
    Connect,
    Execute(Request),
    Disconnect,
}

/// Notifications the worker sends back to its owner, tagged with the
/// worker's generation id so a stale worker cannot confuse a later
/// connection attempt.
#[derive(Debug)]
pub enum WorkerEvent {
    SessionConnected,
    SessionDisconnected,
    RequestCompleted {
        request: Request,
        outcome: RequestOutcome,
    },
}

/// Handle to the single-task session worker. Exactly one session to the
/// peer lives inside the task; all transport I/O happens there.
pub struct MasWorker {
    tx: mpsc::Sender<WorkerCommand>,
    id: Uuid,
    closed: bool,
}

impl MasWorker {
    /// Start the worker and immediately queue the connect. Returns before
    /// the connection completes.
    pub fn spawn<B: SessionBackend>(
        backend: B,
        endpoint: RemoteEndpoint,
        owner: mpsc::WeakSender<Input>,
        queue_depth: usize,
    ) -> MasWorker {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        // Fresh channel with capacity >= 1, cannot fail.
        let _ = tx.try_send(WorkerCommand::Connect);
        tokio::spawn(run(backend, endpoint, id, rx, owner));
        MasWorker { tx, id, closed: false }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a request for execution. Returns false once the queue has been
    /// torn down or is full; the caller must treat that as an immediate
    /// failure, not retry here.
    pub fn submit(&self, request: Request) -> bool {
        if self.closed {
            return false;
        }
        self.tx.try_send(WorkerCommand::Execute(request)).is_ok()
    }

    /// Queue a graceful disconnect and refuse further work. The worker
    /// drains its queue, closes the session, reports `SessionDisconnected`
    /// and exits.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.tx.try_send(WorkerCommand::Disconnect).is_err() {
            // Queue full or task gone; the owner's disconnect timeout covers this.
            warn!(worker = %self.id, "could not queue disconnect");
        }
    }
}

async fn run<B: SessionBackend>(
    mut backend: B,
    endpoint: RemoteEndpoint,
    id: Uuid,
    mut rx: mpsc::Receiver<WorkerCommand>,
    owner: mpsc::WeakSender<Input>,
) {
    let mut open = false;
    while let Some(command) = rx.recv().await {
        match command {
            WorkerCommand::Connect => match backend.open(&endpoint).await {
                Ok(()) => {
                    open = true;
                    info!(worker = %id, peer = %endpoint.peer, "session opened");
                    notify(&owner, id, WorkerEvent::SessionConnected).await;
                }
                Err(e) => {
                    warn!(worker = %id, peer = %endpoint.peer, err = %e, "session open failed");
                    backend.close().await;
                    notify(&owner, id, WorkerEvent::SessionDisconnected).await;
                }
            },
            WorkerCommand::Execute(request) => {
                if !open {
                    debug!(worker = %id, ?request, "dropping request, session not open");
                    continue;
                }
                match backend.execute(&request).await {
                    Ok(outcome) => {
                        notify(&owner, id, WorkerEvent::RequestCompleted { request, outcome })
                            .await;
                    }
                    Err(e) => {
                        // One failed request invalidates the whole session.
                        warn!(worker = %id, err = %e, "request failed, tearing session down");
                        open = false;
                        backend.close().await;
                        notify(&owner, id, WorkerEvent::SessionDisconnected).await;
                    }
                }
            }
            WorkerCommand::Disconnect => {
                if open {
                    backend.close().await;
                    open = false;
                }
                notify(&owner, id, WorkerEvent::SessionDisconnected).await;
                break;
            }
        }
    }
    debug!(worker = %id, "session worker exited");
}

async fn notify(owner: &mpsc::WeakSender<Input>, worker: Uuid, event: WorkerEvent) {
    // Weak so a worker never keeps its owner's input channel open.
    let Some(owner) = owner.upgrade() else {
        debug!(worker = %worker, "owner gone, dropping worker event");
        return;
    };
    if owner.send(Input::Worker { worker, event }).await.is_err() {
        debug!(worker = %worker, "owner gone, dropping worker event");
    }
}
