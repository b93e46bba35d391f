//! Client-side connection manager for a message-access peer.
//!
//! The host service drives one [`MceClient`] per remote peer. Internally two
//! single-task actors cooperate: the connection state machine owning the
//! lifecycle, and the session worker owning the one live session. A
//! process-wide [`MnsServer`] accepts the peer's inbound notification link
//! and forwards parsed event reports through the [`NotificationRegistry`].
//!
//! Transport wire encoding is not handled here; it lives behind the
//! [`SessionBackend`] collaborator trait.

pub mod client;
pub mod error;
pub mod machine;
pub mod notify;
pub mod request;
pub mod session;
pub mod worker;

pub use client::{ClientConfig, ClientEvent, MceClient};
pub use error::TransportFault;
pub use machine::{ConnectionState, Input, OutboundMessage};
pub use notify::{MnsServer, NotificationRegistry};
pub use request::{Charset, ListingParams, Request, RequestOutcome};
pub use session::{DiscoveryDriver, SessionBackend, SessionFactory};
pub use worker::{MasWorker, WorkerEvent};
