use thiserror::Error;

/// Faults raised by the transport collaborator while opening a session or
/// executing a request. Any of these tears the session down; retry policy
/// belongs to the host service.
#[derive(Error, Debug)]
pub enum TransportFault {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer rejected request: {0}")]
    Rejected(String),

    #[error("session closed")]
    Closed,
}
