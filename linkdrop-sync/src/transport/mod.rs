//! Byte transports between replicas.
//!
//! The sync layer needs two things from the outside world:
//! - a [`Signaling`] service that hands out a local peer id, dials remote
//!   peers and reports incoming offers
//! - a [`DataChannel`] per connection that moves opaque frames both ways
//!
//! Two implementations ship here: [`memory`] for in-process networks and
//! [`ws`] for WebSocket links between processes.

pub mod memory;
pub mod ws;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryNetwork, MemorySignaling};
pub use ws::{WsConfig, WsSignaling};

/// Identity of a replica on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Process-unique id of one data channel. A reconnect to the same peer gets
/// a new id, which lets consumers discard events from replaced channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Vec<u8>),
    Closed,
    Error(String),
}

/// Sending half of a data channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    remote: mpsc::UnboundedSender<ChannelEvent>,
    local: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

impl ChannelSender {
    /// Queue one frame for the remote end.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.remote
            .send(ChannelEvent::Data(frame))
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close both ends. Each side sees [`ChannelEvent::Closed`] once.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.remote.send(ChannelEvent::Closed);
            let _ = self.local.send(ChannelEvent::Closed);
        }
    }

    /// Report a transport failure to the local end and close the channel.
    pub fn fail(&self, reason: impl Into<String>) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.local.send(ChannelEvent::Error(reason.into()));
            let _ = self.remote.send(ChannelEvent::Closed);
        }
    }
}

/// One end of a bidirectional frame channel.
#[derive(Debug)]
pub struct DataChannel {
    pub sender: ChannelSender,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl DataChannel {
    /// Two connected ends sharing one open flag.
    pub fn pair() -> (DataChannel, DataChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let a = DataChannel {
            sender: ChannelSender {
                remote: b_tx.clone(),
                local: a_tx.clone(),
                open: open.clone(),
            },
            events: a_rx,
        };
        let b = DataChannel {
            sender: ChannelSender {
                remote: a_tx,
                local: b_tx,
                open,
            },
            events: b_rx,
        };
        (a, b)
    }
}

/// Notifications from a signaling service.
#[derive(Debug)]
pub enum SignalingEvent {
    /// A remote peer opened a channel to us.
    Offer { peer: PeerId, channel: DataChannel },
    /// The link to the signaling service dropped. Open channels stay up.
    Disconnected,
    /// The signaling service failed in a way reconnecting cannot fix.
    Error(String),
}

/// Peer discovery and channel setup.
pub trait Signaling: Send + Sync + 'static {
    /// Register with the service and return the local peer id.
    fn acquire_id(&self) -> impl Future<Output = Result<PeerId, TransportError>> + Send;

    /// Open an outbound channel to `peer`.
    fn connect(&self, peer: PeerId) -> impl Future<Output = Result<DataChannel, TransportError>> + Send;

    /// Re-register after [`SignalingEvent::Disconnected`].
    fn reconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Event stream. Only the first call returns it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>>;

    /// Give up the local id.
    fn release(&self);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    ChannelClosed,

    #[error("peer {0} is not reachable")]
    PeerUnavailable(PeerId),

    #[error("peer id {0} is already taken")]
    IdTaken(PeerId),

    #[error("signaling is offline")]
    Offline,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}
