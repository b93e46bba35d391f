use std::future::Future;

use mce_protocol::RemoteEndpoint;

use crate::error::TransportFault;
use crate::request::{Request, RequestOutcome};

/// Transport collaborator owning one request/response session to the peer.
///
/// The wire encoding is not this crate's business: a backend opens the
/// underlying link, executes requests against it, and reports faults. All
/// calls happen on the session worker's task, never concurrently.
pub trait SessionBackend: Send + 'static {
    /// Open the transport to the endpoint's discovered channel and
    /// negotiate the session.
    fn open(
        &mut self,
        endpoint: &RemoteEndpoint,
    ) -> impl Future<Output = Result<(), TransportFault>> + Send;

    /// Execute one request. On fault the session is considered unusable.
    fn execute(
        &mut self,
        request: &Request,
    ) -> impl Future<Output = Result<RequestOutcome, TransportFault>> + Send;

    /// Best-effort graceful close. Must be safe to call in any state.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Produces one fresh backend per connection attempt.
pub trait SessionFactory: Send + Sync + 'static {
    type Backend: SessionBackend;

    fn create(&self, endpoint: &RemoteEndpoint) -> Self::Backend;
}

/// Collaborator driving service discovery for a peer. Results come back
/// asynchronously through the client's `discovery_result` /
/// `discovery_failed` inputs.
pub trait DiscoveryDriver: Send + 'static {
    fn start(&mut self, peer: &mce_protocol::PeerId);
    fn cancel(&mut self, peer: &mce_protocol::PeerId);
}
