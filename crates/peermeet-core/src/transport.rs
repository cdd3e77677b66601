//! Contract of the peer-to-peer transport library the core drives.
//!
//! The core never frames bytes itself. Every object hands back an unbounded
//! receiver carrying its events in delivery order; the core drains each
//! receiver from a single task.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::media::MediaStream;

pub type PeerId = String;

pub type PeerEvents = UnboundedReceiver<PeerEvent>;
pub type DataEvents = UnboundedReceiver<DataEvent>;
pub type CallEvents = UnboundedReceiver<CallEvent>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("unavailable-id: {0} is already taken")]
    UnavailableId(PeerId),
    #[error("peer-unavailable: could not connect to {0}")]
    PeerUnavailable(PeerId),
    #[error("network: {0}")]
    Network(String),
    #[error("peer destroyed")]
    Destroyed,
}

pub enum PeerEvent {
    /// Registration with the signaling side completed under this id.
    Open(PeerId),
    Connection(Arc<dyn DataConnection>, DataEvents),
    Call(Arc<dyn MediaCall>, CallEvents),
    Error(TransportError),
    Closed,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Open(id) => f.debug_tuple("Open").field(id).finish(),
            PeerEvent::Connection(conn, _) => f.debug_tuple("Connection").field(&conn.peer()).finish(),
            PeerEvent::Call(call, _) => f.debug_tuple("Call").field(&call.peer()).finish(),
            PeerEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
            PeerEvent::Closed => f.write_str("Closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DataEvent {
    Open,
    Data(serde_json::Value),
    Error(TransportError),
    Closed,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    Stream(MediaStream),
    Error(TransportError),
    Closed,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a peer. `None` lets the transport assign an id.
    async fn create_peer(&self, id: Option<&str>) -> Result<(Arc<dyn Peer>, PeerEvents), TransportError>;
}

#[async_trait]
pub trait Peer: Send + Sync {
    /// Requested or assigned id. Known before `Open` is observed.
    fn id(&self) -> PeerId;

    async fn connect(&self, target: &str) -> Result<(Arc<dyn DataConnection>, DataEvents), TransportError>;

    async fn call(
        &self,
        target: &str,
        stream: MediaStream,
    ) -> Result<(Arc<dyn MediaCall>, CallEvents), TransportError>;

    /// Drop the signaling link, keeping existing connections.
    fn disconnect(&self);

    /// Close every connection and release the id.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;
}

pub trait DataConnection: Send + Sync {
    /// Id of the remote end.
    fn peer(&self) -> PeerId;
    fn send(&self, payload: serde_json::Value) -> Result<(), TransportError>;
    fn close(&self);
    fn is_open(&self) -> bool;
}

pub trait MediaCall: Send + Sync {
    /// Id of the remote end.
    fn peer(&self) -> PeerId;
    fn answer(&self, stream: MediaStream);
    fn close(&self);
}
