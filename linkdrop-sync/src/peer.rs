//! Peer connection manager.
//!
//! Owns the data channels to remote replicas and turns their traffic into a
//! single ordered stream of [`PeerEvent`]s for the sync service.
//!
//! ```text
//!               Initializing ──init()──► Ready ──destroy()──► Destroyed
//!                                          │
//!                                  signaling error
//!                                          ▼
//!                                        Error
//! ```
//!
//! At most one channel is live per remote peer. When two replicas dial each
//! other at the same time, both keep the channel started by the smaller
//! peer id. A newer channel from the same initiator replaces the older one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::roster::{PeerConnection, Roster};
use crate::transport::{
    ChannelEvent, ChannelSender, ConnectionId, DataChannel, PeerId, Signaling, SignalingEvent,
    TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    Initializing,
    Ready,
    Error,
    Destroyed,
}

#[derive(Debug)]
pub enum PeerEvent {
    /// The local id was acquired.
    Ready(PeerId),
    /// A channel to `peer` is open. `initiator` is true when we dialed.
    Opened {
        peer: PeerId,
        connection: ConnectionId,
        initiator: bool,
        sender: ChannelSender,
    },
    Data {
        peer: PeerId,
        connection: ConnectionId,
        bytes: Vec<u8>,
    },
    Closed {
        peer: PeerId,
        connection: ConnectionId,
    },
    Failed {
        peer: PeerId,
        connection: ConnectionId,
        reason: String,
    },
    SignalingLost,
    SignalingRestored,
    /// Signaling failed for good.
    Error(String),
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer manager is not ready ({0:?})")]
    NotReady(ManagerStatus),

    #[error("peer manager was already initialized")]
    AlreadyInitialized,

    #[error("cannot connect to self")]
    SelfConnect,

    #[error("channel to {0} was dropped in favour of another")]
    Superseded(PeerId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct Link {
    connection: ConnectionId,
    initiator: PeerId,
    sender: ChannelSender,
    reader: JoinHandle<()>,
}

struct State {
    status: ManagerStatus,
    local_id: Option<PeerId>,
    links: HashMap<PeerId, Link>,
    roster: Roster,
    signaling_task: Option<JoinHandle<()>>,
}

struct Shared<S> {
    signaling: S,
    config: PeerConfig,
    state: Mutex<State>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

/// Cloneable handle; all clones share one set of connections.
pub struct PeerManager<S: Signaling> {
    shared: Arc<Shared<S>>,
}

impl<S: Signaling> Clone for PeerManager<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: Signaling> PeerManager<S> {
    pub fn new(signaling: S, config: PeerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                signaling,
                config,
                state: Mutex::new(State {
                    status: ManagerStatus::Initializing,
                    local_id: None,
                    links: HashMap::new(),
                    roster: Roster::new(),
                    signaling_task: None,
                }),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Acquire the local id and start listening for offers.
    pub async fn init(&self) -> Result<PeerId, PeerError> {
        let status = self.status();
        if status != ManagerStatus::Initializing {
            return Err(PeerError::AlreadyInitialized);
        }

        let id = match self.shared.signaling.acquire_id().await {
            Ok(id) => id,
            Err(e) => {
                self.lock().status = ManagerStatus::Error;
                return Err(e.into());
            }
        };
        let events = self
            .shared
            .signaling
            .take_events()
            .ok_or(PeerError::AlreadyInitialized)?;

        let mut state = self.lock();
        state.local_id = Some(id.clone());
        state.status = ManagerStatus::Ready;
        self.emit(PeerEvent::Ready(id.clone()));
        state.signaling_task = Some(tokio::spawn(run_signaling(
            Arc::downgrade(&self.shared),
            events,
        )));
        log::info!("Peer manager ready as {id}");
        Ok(id)
    }

    /// Open a channel to `peer`, or return the one already open.
    pub async fn connect(&self, peer: PeerId) -> Result<ConnectionId, PeerError> {
        {
            let mut state = self.lock();
            match state.status {
                ManagerStatus::Ready => {}
                status => return Err(PeerError::NotReady(status)),
            }
            if state.local_id.as_ref() == Some(&peer) {
                return Err(PeerError::SelfConnect);
            }
            if let Some(link) = state.links.get(&peer) {
                if link.sender.is_open() {
                    return Ok(link.connection);
                }
            }
            state.roster.connecting(&peer);
        }

        match self.shared.signaling.connect(peer.clone()).await {
            Ok(channel) => match self.register(peer.clone(), channel, true) {
                Some(connection) => Ok(connection),
                // Lost a connect race; the surviving channel serves both ways.
                None => self.connection(&peer).ok_or(PeerError::Superseded(peer)),
            },
            Err(e) => {
                log::warn!("Failed to connect to {peer}: {e}");
                self.lock().roster.failed(&peer);
                Err(e.into())
            }
        }
    }

    /// Close the channel to `peer`. Returns false when none was open.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let mut state = self.lock();
        let Some(link) = state.links.remove(peer) else {
            return false;
        };
        state.roster.disconnected(peer);
        self.close_link(peer, link);
        true
    }

    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let links: Vec<_> = state.links.drain().collect();
        for (peer, link) in links {
            state.roster.disconnected(&peer);
            self.close_link(&peer, link);
        }
    }

    /// Close every channel and give up the local id. The manager cannot be
    /// reused afterwards.
    pub fn destroy(&self) {
        self.disconnect_all();
        let task = {
            let mut state = self.lock();
            state.status = ManagerStatus::Destroyed;
            state.signaling_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.shared.signaling.release();
        log::info!("Peer manager destroyed");
    }

    /// Live connection to `peer`, if any.
    pub fn connection(&self, peer: &PeerId) -> Option<ConnectionId> {
        self.lock()
            .links
            .get(peer)
            .filter(|link| link.sender.is_open())
            .map(|link| link.connection)
    }

    pub fn connections(&self) -> Vec<PeerConnection> {
        self.lock().roster.snapshot()
    }

    /// Peer event stream. Only the first call returns it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.shared.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn status(&self) -> ManagerStatus {
        self.lock().status
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.lock().local_id.clone()
    }

    pub fn signaling(&self) -> &S {
        &self.shared.signaling
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent across a panic in an unrelated holder.
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.shared.events_tx.send(event);
    }

    /// Must be called with the state lock held so `Closed` is ordered
    /// against a following `Opened` for the same peer.
    fn close_link(&self, peer: &PeerId, link: Link) {
        link.reader.abort();
        link.sender.close();
        log::info!("Closed connection {} to {peer}", link.connection);
        self.emit(PeerEvent::Closed {
            peer: peer.clone(),
            connection: link.connection,
        });
    }

    /// Adopt a freshly opened channel. Returns `None` when the channel lost
    /// to an existing one and was closed.
    fn register(&self, peer: PeerId, channel: DataChannel, outbound: bool) -> Option<ConnectionId> {
        let DataChannel { sender, events } = channel;
        let mut state = self.lock();

        let local = match (&state.status, &state.local_id) {
            (ManagerStatus::Ready, Some(local)) => local.clone(),
            _ => {
                sender.close();
                return None;
            }
        };
        let initiator = if outbound { local } else { peer.clone() };

        if let Some(existing) = state.links.get(&peer) {
            if existing.sender.is_open() && existing.initiator < initiator {
                log::debug!("Dropping duplicate channel from {initiator} to keep {}", existing.connection);
                sender.close();
                return None;
            }
        }
        if let Some(replaced) = state.links.remove(&peer) {
            self.close_link(&peer, replaced);
        }

        let connection = ConnectionId::next();
        state.roster.connected(&peer);
        self.emit(PeerEvent::Opened {
            peer: peer.clone(),
            connection,
            initiator: outbound,
            sender: sender.clone(),
        });
        // Spawned after `Opened` so data never overtakes it.
        let reader = tokio::spawn(run_channel(
            Arc::downgrade(&self.shared),
            peer.clone(),
            connection,
            events,
        ));
        log::info!(
            "Opened connection {connection} to {peer} ({})",
            if outbound { "outbound" } else { "inbound" }
        );
        state.links.insert(
            peer,
            Link {
                connection,
                initiator,
                sender,
                reader,
            },
        );
        Some(connection)
    }

    /// Forget a channel that closed or failed on its own.
    fn drop_link(&self, peer: &PeerId, connection: ConnectionId, reason: Option<String>) {
        let mut state = self.lock();
        if state
            .links
            .get(peer)
            .is_none_or(|link| link.connection != connection)
        {
            return;
        }
        if let Some(link) = state.links.remove(peer) {
            link.sender.close();
        }
        match reason {
            Some(reason) => {
                log::warn!("Connection {connection} to {peer} failed: {reason}");
                state.roster.failed(peer);
                self.emit(PeerEvent::Failed {
                    peer: peer.clone(),
                    connection,
                    reason,
                });
            }
            None => {
                log::info!("Connection {connection} to {peer} closed by remote");
                state.roster.disconnected(peer);
                self.emit(PeerEvent::Closed {
                    peer: peer.clone(),
                    connection,
                });
            }
        }
    }

    async fn reconnect_signaling(&self) {
        self.emit(PeerEvent::SignalingLost);
        let max = self.shared.config.reconnect_max_delay;
        let mut delay = self.shared.config.reconnect_base_delay.min(max);
        loop {
            tokio::time::sleep(delay).await;
            if self.status() == ManagerStatus::Destroyed {
                return;
            }
            match self.shared.signaling.reconnect().await {
                Ok(()) => {
                    log::info!("Signaling restored");
                    self.emit(PeerEvent::SignalingRestored);
                    return;
                }
                Err(e) => {
                    delay = (delay * 2).min(max);
                    log::debug!("Signaling reconnect failed, retrying in {delay:?}: {e}");
                }
            }
        }
    }
}

async fn run_signaling<S: Signaling>(
    shared: Weak<Shared<S>>,
    mut events: mpsc::UnboundedReceiver<SignalingEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let manager = PeerManager { shared };
        match event {
            SignalingEvent::Offer { peer, channel } => {
                manager.register(peer, channel, false);
            }
            SignalingEvent::Disconnected => {
                log::info!("Signaling disconnected, open channels stay up");
                manager.reconnect_signaling().await;
            }
            SignalingEvent::Error(reason) => {
                log::warn!("Signaling error: {reason}");
                manager.lock().status = ManagerStatus::Error;
                manager.emit(PeerEvent::Error(reason));
            }
        }
    }
}

async fn run_channel<S: Signaling>(
    shared: Weak<Shared<S>>,
    peer: PeerId,
    connection: ConnectionId,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    let mut reason = None;
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(bytes) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                log::trace!("{} bytes from {peer} on {connection}", bytes.len());
                PeerManager { shared }.emit(PeerEvent::Data {
                    peer: peer.clone(),
                    connection,
                    bytes,
                });
            }
            ChannelEvent::Closed => break,
            ChannelEvent::Error(e) => {
                reason = Some(e);
                break;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        PeerManager { shared }.drop_link(&peer, connection, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::PeerStatus;
    use crate::transport::MemoryNetwork;

    fn config() -> PeerConfig {
        PeerConfig {
            reconnect_base_delay: Duration::from_millis(5),
            reconnect_max_delay: Duration::from_millis(20),
        }
    }

    async fn ready(net: &MemoryNetwork, id: &str) -> (PeerManager<crate::transport::MemorySignaling>, mpsc::UnboundedReceiver<PeerEvent>) {
        let manager = PeerManager::new(net.signaling(id), config());
        let mut events = manager.take_events().unwrap();
        manager.init().await.unwrap();
        assert!(matches!(events.recv().await, Some(PeerEvent::Ready(_))));
        (manager, events)
    }

    #[tokio::test]
    async fn test_connect_opens_both_sides() {
        let net = MemoryNetwork::new();
        let (a, mut a_events) = ready(&net, "a").await;
        let (b, mut b_events) = ready(&net, "b").await;

        let connection = a.connect(PeerId::from("b")).await.unwrap();
        assert!(matches!(
            a_events.recv().await,
            Some(PeerEvent::Opened { initiator: true, connection: c, .. }) if c == connection
        ));
        let Some(PeerEvent::Opened { peer, initiator, sender, .. }) = b_events.recv().await else {
            panic!("expected inbound channel");
        };
        assert_eq!(peer, PeerId::from("a"));
        assert!(!initiator);

        sender.send(b"hello".to_vec()).unwrap();
        assert!(matches!(
            a_events.recv().await,
            Some(PeerEvent::Data { bytes, .. }) if bytes == b"hello"
        ));

        // Second connect reuses the open channel.
        assert_eq!(a.connect(PeerId::from("b")).await.unwrap(), connection);
        assert_eq!(a.connections()[0].status, PeerStatus::Connected);
        assert_eq!(b.status(), ManagerStatus::Ready);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remote() {
        let net = MemoryNetwork::new();
        let (a, mut a_events) = ready(&net, "a").await;
        let (b, mut b_events) = ready(&net, "b").await;

        a.connect(PeerId::from("b")).await.unwrap();
        let _ = a_events.recv().await;
        let _ = b_events.recv().await;

        assert!(a.disconnect(&PeerId::from("b")));
        assert!(!a.disconnect(&PeerId::from("b")));
        assert!(matches!(a_events.recv().await, Some(PeerEvent::Closed { .. })));
        assert!(matches!(b_events.recv().await, Some(PeerEvent::Closed { .. })));
        assert_eq!(b.connection(&PeerId::from("a")), None);
        assert_eq!(b.connections()[0].status, PeerStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_channel_error_marks_peer_failed() {
        let net = MemoryNetwork::new();
        let (a, mut a_events) = ready(&net, "a").await;
        let (_b, mut b_events) = ready(&net, "b").await;

        a.connect(PeerId::from("b")).await.unwrap();
        let _ = a_events.recv().await;
        let Some(PeerEvent::Opened { sender, .. }) = b_events.recv().await else {
            panic!("expected inbound channel");
        };
        // Error on b's end; a sees a plain close.
        sender.fail("ice failed");
        assert!(matches!(b_events.recv().await, Some(PeerEvent::Failed { reason, .. }) if reason == "ice failed"));
        assert!(matches!(a_events.recv().await, Some(PeerEvent::Closed { .. })));
        assert_eq!(a.connections()[0].status, PeerStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_before_init_is_rejected() {
        let net = MemoryNetwork::new();
        let manager = PeerManager::new(net.signaling("a"), config());
        assert!(matches!(
            manager.connect(PeerId::from("b")).await,
            Err(PeerError::NotReady(ManagerStatus::Initializing))
        ));

        manager.init().await.unwrap();
        assert!(matches!(manager.init().await, Err(PeerError::AlreadyInitialized)));
        assert!(matches!(manager.connect(PeerId::from("a")).await, Err(PeerError::SelfConnect)));
        assert!(matches!(
            manager.connect(PeerId::from("ghost")).await,
            Err(PeerError::Transport(TransportError::PeerUnavailable(_)))
        ));
        assert_eq!(manager.connections()[0].status, PeerStatus::Error);
    }

    #[tokio::test]
    async fn test_signaling_loss_keeps_channels() {
        let net = MemoryNetwork::new();
        let (a, mut a_events) = ready(&net, "a").await;
        let (_b, mut b_events) = ready(&net, "b").await;
        a.connect(PeerId::from("b")).await.unwrap();
        let _ = a_events.recv().await;
        let _ = b_events.recv().await;

        net.interrupt(&PeerId::from("a"));
        assert!(matches!(a_events.recv().await, Some(PeerEvent::SignalingLost)));
        assert!(matches!(a_events.recv().await, Some(PeerEvent::SignalingRestored)));
        assert!(net.is_online(&PeerId::from("a")));
        assert!(a.connection(&PeerId::from("b")).is_some());
        assert_eq!(a.status(), ManagerStatus::Ready);
    }

    #[tokio::test]
    async fn test_signaling_error_moves_to_error() {
        let net = MemoryNetwork::new();
        let (a, mut events) = ready(&net, "a").await;
        net.fail(&PeerId::from("a"), "broker gone");
        assert!(matches!(events.recv().await, Some(PeerEvent::Error(reason)) if reason == "broker gone"));
        assert_eq!(a.status(), ManagerStatus::Error);
    }

    #[tokio::test]
    async fn test_destroy_releases_id() {
        let net = MemoryNetwork::new();
        let (a, _events) = ready(&net, "a").await;
        a.destroy();
        assert_eq!(a.status(), ManagerStatus::Destroyed);
        assert!(!net.is_online(&PeerId::from("a")));

        // The id is free for a new replica.
        let (_again, _) = ready(&net, "a").await;
    }
}
