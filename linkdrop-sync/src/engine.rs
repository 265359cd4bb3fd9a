//! Sync protocol state machine.
//!
//! ```text
//! initiator                               responder
//!     ── SyncStep1(sv_a) ────────────────►
//!     ◄──────────────── SyncStep2(diff_a) ──   (and, if a is Unsynced)
//!     ◄──────────────── SyncStep1(sv_b) ──     mark a Synced
//!  apply, mark b Synced
//!     ── SyncStep2(diff_b) ──────────────►
//!                                           apply
//!     ◄──── Update(delta) ──── Update(delta) ────►
//! ```
//!
//! The engine is plain data plus the shared store. It is owned by the sync
//! service task, so it needs no locking of its own.

use linkdrop_core::{DocUpdate, LinkStore, UpdateOrigin};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::protocol::SyncMessage;
use crate::transport::{ChannelSender, ConnectionId, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSyncState {
    Unsynced,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No open connections.
    Idle,
    /// At least one peer has not finished the handshake.
    Syncing,
    Synced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub peers: BTreeMap<PeerId, PeerSyncState>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            peers: BTreeMap::new(),
        }
    }
}

struct PeerLink {
    connection: ConnectionId,
    sender: ChannelSender,
    state: PeerSyncState,
}

pub struct SyncEngine {
    store: Arc<LinkStore>,
    peers: BTreeMap<PeerId, PeerLink>,
}

impl SyncEngine {
    pub fn new(store: Arc<LinkStore>) -> Self {
        Self {
            store,
            peers: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<LinkStore> {
        &self.store
    }

    /// Track a new channel. The dialing side opens the handshake.
    pub fn peer_opened(
        &mut self,
        peer: PeerId,
        connection: ConnectionId,
        initiator: bool,
        sender: ChannelSender,
    ) {
        let link = PeerLink {
            connection,
            sender,
            state: PeerSyncState::Unsynced,
        };
        if initiator {
            send(&peer, &link, &SyncMessage::SyncStep1(self.store.state_vector()));
        }
        self.peers.insert(peer, link);
    }

    /// Forget `peer` if `connection` is still its current channel.
    pub fn peer_closed(&mut self, peer: &PeerId, connection: ConnectionId) -> bool {
        if self
            .peers
            .get(peer)
            .is_some_and(|link| link.connection == connection)
        {
            self.peers.remove(peer);
            return true;
        }
        false
    }

    /// Process one frame received from `peer`.
    pub fn handle_frame(&mut self, peer: &PeerId, connection: ConnectionId, frame: &[u8]) {
        let Some(link) = self.peers.get_mut(peer) else {
            log::debug!("Dropping frame from untracked peer {peer}");
            return;
        };
        if link.connection != connection {
            log::debug!("Dropping frame from stale connection {connection} to {peer}");
            return;
        }
        let message = match SyncMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Dropping frame from {peer}: {e}");
                return;
            }
        };
        log::trace!("{} from {peer} ({} bytes)", message.kind(), message.payload().len());

        match message {
            SyncMessage::SyncStep1(remote_sv) => {
                let diff = match self.store.encode_diff(&remote_sv) {
                    Ok(diff) => diff,
                    Err(e) => {
                        log::debug!("Bad state vector from {peer}: {e}");
                        return;
                    }
                };
                send(peer, link, &SyncMessage::SyncStep2(diff));
                if link.state == PeerSyncState::Unsynced {
                    send(peer, link, &SyncMessage::SyncStep1(self.store.state_vector()));
                    link.state = PeerSyncState::Synced;
                }
            }
            SyncMessage::SyncStep2(diff) => match self.store.apply_update(&diff, UpdateOrigin::Sync) {
                Ok(()) => link.state = PeerSyncState::Synced,
                Err(e) => log::debug!("Discarding sync-step-2 from {peer}: {e}"),
            },
            SyncMessage::Update(delta) => {
                if let Err(e) = self.store.apply_update(&delta, UpdateOrigin::Sync) {
                    log::debug!("Discarding update from {peer}: {e}");
                }
            }
        }
    }

    /// Forward a committed local change to every open connection. Remote
    /// and replayed changes are not relayed.
    pub fn broadcast_local(&mut self, update: &DocUpdate) {
        if !update.origin.is_broadcast() {
            return;
        }
        let message = SyncMessage::Update(update.update.clone());
        for (peer, link) in &self.peers {
            send(peer, link, &message);
        }
    }

    /// Restart the handshake with every peer.
    pub fn force_sync(&mut self) {
        let state_vector = self.store.state_vector();
        for (peer, link) in self.peers.iter_mut() {
            link.state = PeerSyncState::Unsynced;
            send(peer, link, &SyncMessage::SyncStep1(state_vector.clone()));
        }
        log::debug!("Forced sync with {} peers", self.peers.len());
    }

    pub fn status(&self) -> SyncStatus {
        let peers: BTreeMap<_, _> = self
            .peers
            .iter()
            .map(|(peer, link)| (peer.clone(), link.state))
            .collect();
        let state = if peers.is_empty() {
            SyncState::Idle
        } else if peers.values().all(|s| *s == PeerSyncState::Synced) {
            SyncState::Synced
        } else {
            SyncState::Syncing
        };
        SyncStatus { state, peers }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

/// Sends to a closed channel are dropped; the close event cleans up.
fn send(peer: &PeerId, link: &PeerLink, message: &SyncMessage) {
    let frame = match message.encode() {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Failed to encode {}: {e}", message.kind());
            return;
        }
    };
    if let Err(e) = link.sender.send(frame) {
        log::debug!("Dropped {} to {peer}: {e}", message.kind());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelEvent, DataChannel};
    use linkdrop_core::LinkPatch;
    use tokio::sync::mpsc;

    struct Wire {
        peer: PeerId,
        connection: ConnectionId,
        _events: mpsc::UnboundedReceiver<ChannelEvent>,
    }

    /// Attach `engine` to a fake remote and return the remote's end.
    fn attach(engine: &mut SyncEngine, peer: &str, initiator: bool) -> (Wire, DataChannel) {
        let (local, remote) = DataChannel::pair();
        let connection = ConnectionId::next();
        engine.peer_opened(PeerId::from(peer), connection, initiator, local.sender);
        (
            Wire {
                peer: PeerId::from(peer),
                connection,
                _events: local.events,
            },
            remote,
        )
    }

    fn next_message(channel: &mut DataChannel) -> SyncMessage {
        match channel.events.try_recv() {
            Ok(ChannelEvent::Data(frame)) => SyncMessage::decode(&frame).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    fn new_engine() -> SyncEngine {
        SyncEngine::new(Arc::new(LinkStore::new().unwrap()))
    }

    #[test]
    fn test_initiator_sends_step1() {
        let mut engine = new_engine();
        let (_wire, mut remote) = attach(&mut engine, "b", true);
        assert!(matches!(next_message(&mut remote), SyncMessage::SyncStep1(_)));
        assert_eq!(engine.status().state, SyncState::Syncing);

        let mut engine = new_engine();
        let (_wire, mut remote) = attach(&mut engine, "b", false);
        assert!(remote.events.try_recv().is_err());
    }

    #[test]
    fn test_step1_answers_with_diff_and_own_step1() {
        let mut engine = new_engine();
        engine
            .store()
            .add_link("https://a.io", LinkPatch::default())
            .unwrap();
        let (wire, mut remote) = attach(&mut engine, "b", false);

        let empty = LinkStore::new().unwrap();
        let frame = SyncMessage::SyncStep1(empty.state_vector()).encode().unwrap();
        engine.handle_frame(&wire.peer, wire.connection, &frame);

        let SyncMessage::SyncStep2(diff) = next_message(&mut remote) else {
            panic!("expected sync-step-2");
        };
        empty.apply_update(&diff, UpdateOrigin::Sync).unwrap();
        assert_eq!(empty.link_count(), 1);
        assert!(matches!(next_message(&mut remote), SyncMessage::SyncStep1(_)));
        assert_eq!(engine.status().peers[&wire.peer], PeerSyncState::Synced);

        // A second step1 only gets a diff back.
        engine.handle_frame(&wire.peer, wire.connection, &frame);
        assert!(matches!(next_message(&mut remote), SyncMessage::SyncStep2(_)));
        assert!(remote.events.try_recv().is_err());
    }

    #[test]
    fn test_step2_marks_synced_only_when_applied() {
        let mut engine = new_engine();
        let (wire, _remote) = attach(&mut engine, "b", true);

        let bad = SyncMessage::SyncStep2(vec![0xff, 0x01]).encode().unwrap();
        engine.handle_frame(&wire.peer, wire.connection, &bad);
        assert_eq!(engine.status().peers[&wire.peer], PeerSyncState::Unsynced);

        let source = LinkStore::new().unwrap();
        source.add_link("https://b.io", LinkPatch::default()).unwrap();
        let good = SyncMessage::SyncStep2(source.encode_state()).encode().unwrap();
        engine.handle_frame(&wire.peer, wire.connection, &good);
        assert_eq!(engine.status().state, SyncState::Synced);
        assert_eq!(engine.store().link_count(), 1);
    }

    #[test]
    fn test_update_and_garbage_frames() {
        let mut engine = new_engine();
        let (wire, _remote) = attach(&mut engine, "b", false);

        engine.handle_frame(&wire.peer, wire.connection, b"not json");
        engine.handle_frame(&wire.peer, wire.connection, br#"{"type":"awareness","data":[]}"#);

        let source = LinkStore::new().unwrap();
        source.add_link("https://c.io", LinkPatch::default()).unwrap();
        let update = SyncMessage::Update(source.encode_state()).encode().unwrap();
        engine.handle_frame(&wire.peer, wire.connection, &update);
        assert_eq!(engine.store().link_count(), 1);
        // Updates do not complete the handshake.
        assert_eq!(engine.status().peers[&wire.peer], PeerSyncState::Unsynced);
    }

    #[test]
    fn test_stale_connection_is_ignored() {
        let mut engine = new_engine();
        let (old, _old_remote) = attach(&mut engine, "b", false);
        let (new, _new_remote) = attach(&mut engine, "b", false);

        let source = LinkStore::new().unwrap();
        source.add_link("https://d.io", LinkPatch::default()).unwrap();
        let update = SyncMessage::Update(source.encode_state()).encode().unwrap();
        engine.handle_frame(&old.peer, old.connection, &update);
        assert_eq!(engine.store().link_count(), 0);

        assert!(!engine.peer_closed(&old.peer, old.connection));
        assert_eq!(engine.peer_count(), 1);
        assert!(engine.peer_closed(&new.peer, new.connection));
        assert_eq!(engine.status(), SyncStatus::default());
    }

    #[test]
    fn test_broadcast_skips_remote_origins() {
        let mut engine = new_engine();
        let (_b, mut b_remote) = attach(&mut engine, "b", false);
        let (_c, mut c_remote) = attach(&mut engine, "c", false);

        for origin in [UpdateOrigin::Sync, UpdateOrigin::Persistence] {
            engine.broadcast_local(&DocUpdate {
                update: vec![1],
                origin,
            });
        }
        assert!(b_remote.events.try_recv().is_err());

        engine.broadcast_local(&DocUpdate {
            update: vec![7, 7],
            origin: UpdateOrigin::Local,
        });
        assert_eq!(next_message(&mut b_remote), SyncMessage::Update(vec![7, 7]));
        assert_eq!(next_message(&mut c_remote), SyncMessage::Update(vec![7, 7]));
    }

    #[test]
    fn test_closed_channel_does_not_stop_broadcast() {
        let mut engine = new_engine();
        let (_b, b_remote) = attach(&mut engine, "b", false);
        let (_c, mut c_remote) = attach(&mut engine, "c", false);
        b_remote.sender.close();

        engine.broadcast_local(&DocUpdate {
            update: vec![3],
            origin: UpdateOrigin::Import,
        });
        assert_eq!(next_message(&mut c_remote), SyncMessage::Update(vec![3]));
    }

    #[test]
    fn test_force_sync_resets_peers() {
        let mut engine = new_engine();
        let (wire, mut remote) = attach(&mut engine, "b", false);
        let empty = LinkStore::new().unwrap();
        let step1 = SyncMessage::SyncStep1(empty.state_vector()).encode().unwrap();
        engine.handle_frame(&wire.peer, wire.connection, &step1);
        let _ = next_message(&mut remote);
        let _ = next_message(&mut remote);
        assert_eq!(engine.status().state, SyncState::Synced);

        engine.force_sync();
        assert_eq!(engine.status().state, SyncState::Syncing);
        assert!(matches!(next_message(&mut remote), SyncMessage::SyncStep1(_)));
    }
}
