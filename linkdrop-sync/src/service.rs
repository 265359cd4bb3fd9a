//! Single-owner task that drives the [`SyncEngine`].
//!
//! All three inputs are funnelled through one `select!` loop, so the engine
//! never sees two events at once:
//! - peer events from the [`PeerManager`](crate::peer::PeerManager)
//! - committed document updates
//! - [`SyncCommand`]s from any [`SyncHandle`]

use linkdrop_core::{DocUpdate, LinkStore};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::engine::{SyncEngine, SyncStatus};
use crate::peer::PeerEvent;

#[derive(Debug)]
pub enum SyncCommand {
    ForceSync,
    Status(oneshot::Sender<SyncStatus>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("sync service has stopped")]
    Stopped,
}

/// Cloneable front of a running [`SyncService`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    status: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    /// Restart the handshake with every connected peer.
    pub async fn force_sync(&self) -> Result<(), ServiceError> {
        self.commands
            .send(SyncCommand::ForceSync)
            .await
            .map_err(|_| ServiceError::Stopped)
    }

    pub async fn status(&self) -> Result<SyncStatus, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SyncCommand::Status(tx))
            .await
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    /// Receiver that sees every status change.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop the service and wait for it to acknowledge.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SyncCommand::Shutdown(tx))
            .await
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }
}

pub struct SyncService {
    engine: SyncEngine,
    updates: broadcast::Receiver<DocUpdate>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    commands: mpsc::Receiver<SyncCommand>,
    status: watch::Sender<SyncStatus>,
}

impl SyncService {
    /// Start the service. The update subscription is taken before this
    /// returns, so changes made right after are never missed.
    pub fn spawn(
        store: Arc<LinkStore>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        command_capacity: usize,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(command_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());
        let service = SyncService {
            updates: store.subscribe_updates(),
            engine: SyncEngine::new(store),
            peer_events,
            commands,
            status: status_tx,
        };
        let task = tokio::spawn(service.run());
        (
            SyncHandle {
                commands: commands_tx,
                status: status_rx,
            },
            task,
        )
    }

    async fn run(mut self) {
        log::debug!("Sync service started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SyncCommand::ForceSync) => self.engine.force_sync(),
                    Some(SyncCommand::Status(reply)) => {
                        let _ = reply.send(self.engine.status());
                    }
                    Some(SyncCommand::Shutdown(ack)) => {
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                },

                Some(event) = self.peer_events.recv() => self.on_peer_event(event),

                update = self.updates.recv() => match update {
                    Ok(update) => self.engine.broadcast_local(&update),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Sync missed {n} local updates, resyncing all peers");
                        self.engine.force_sync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
            self.publish_status();
        }
        log::debug!("Sync service stopped");
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Ready(id) => log::info!("Syncing as {id}"),
            PeerEvent::Opened {
                peer,
                connection,
                initiator,
                sender,
            } => self.engine.peer_opened(peer, connection, initiator, sender),
            PeerEvent::Data {
                peer,
                connection,
                bytes,
            } => self.engine.handle_frame(&peer, connection, &bytes),
            PeerEvent::Closed { peer, connection } => {
                self.engine.peer_closed(&peer, connection);
            }
            PeerEvent::Failed {
                peer,
                connection,
                reason,
            } => {
                log::debug!("Dropping sync state for {peer}: {reason}");
                self.engine.peer_closed(&peer, connection);
            }
            PeerEvent::SignalingLost => log::info!("Signaling lost, open channels keep syncing"),
            PeerEvent::SignalingRestored => log::info!("Signaling restored"),
            PeerEvent::Error(reason) => log::warn!("Peer manager error: {reason}"),
        }
    }

    fn publish_status(&self) {
        let current = self.engine.status();
        self.status.send_if_modified(|status| {
            if *status == current {
                return false;
            }
            *status = current;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PeerSyncState, SyncState};
    use crate::protocol::SyncMessage;
    use crate::transport::{ChannelEvent, ConnectionId, DataChannel, PeerId};
    use linkdrop_core::LinkPatch;
    use std::time::Duration;

    async fn next_message(channel: &mut DataChannel) -> SyncMessage {
        let event = tokio::time::timeout(Duration::from_secs(2), channel.events.recv())
            .await
            .expect("timed out waiting for a frame");
        match event {
            Some(ChannelEvent::Data(frame)) => SyncMessage::decode(&frame).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_change_reaches_peer() {
        let store = Arc::new(LinkStore::new().unwrap());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, task) = SyncService::spawn(store.clone(), events_rx, 8);

        let (local, mut remote) = DataChannel::pair();
        let peer = PeerId::from("b");
        let connection = ConnectionId::next();
        events_tx
            .send(PeerEvent::Opened {
                peer: peer.clone(),
                connection,
                initiator: true,
                sender: local.sender,
            })
            .unwrap();
        assert!(matches!(next_message(&mut remote).await, SyncMessage::SyncStep1(_)));

        store.add_link("https://a.io", LinkPatch::default()).unwrap();
        assert!(matches!(next_message(&mut remote).await, SyncMessage::Update(_)));

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, SyncState::Syncing);
        assert_eq!(status.peers[&peer], PeerSyncState::Unsynced);

        handle.force_sync().await.unwrap();
        assert!(matches!(next_message(&mut remote).await, SyncMessage::SyncStep1(_)));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.status().await, Err(ServiceError::Stopped)));
    }

    #[tokio::test]
    async fn test_watch_follows_handshake() {
        let store = Arc::new(LinkStore::new().unwrap());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, _task) = SyncService::spawn(store, events_rx, 8);
        let mut watch = handle.watch_status();
        assert_eq!(watch.borrow().state, SyncState::Idle);

        let (local, _remote) = DataChannel::pair();
        let peer = PeerId::from("b");
        let connection = ConnectionId::next();
        events_tx
            .send(PeerEvent::Opened {
                peer: peer.clone(),
                connection,
                initiator: false,
                sender: local.sender,
            })
            .unwrap();
        watch.changed().await.unwrap();
        assert_eq!(watch.borrow_and_update().state, SyncState::Syncing);

        let empty = LinkStore::new().unwrap();
        events_tx
            .send(PeerEvent::Data {
                peer: peer.clone(),
                connection,
                bytes: SyncMessage::SyncStep2(empty.encode_state()).encode().unwrap(),
            })
            .unwrap();
        watch.changed().await.unwrap();
        assert_eq!(watch.borrow_and_update().state, SyncState::Synced);

        events_tx.send(PeerEvent::Closed { peer, connection }).unwrap();
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow(), SyncStatus::default());
    }

    #[tokio::test]
    async fn test_missed_local_updates_restart_handshake() {
        let store = Arc::new(LinkStore::with_capacity(2).unwrap());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, _task) = SyncService::spawn(store.clone(), events_rx, 8);

        let (local, mut remote) = DataChannel::pair();
        let peer = PeerId::from("b");
        events_tx
            .send(PeerEvent::Opened {
                peer: peer.clone(),
                connection: ConnectionId::next(),
                initiator: false,
                sender: local.sender,
            })
            .unwrap();
        let mut watch = handle.watch_status();
        watch.wait_for(|s| s.peers.contains_key(&peer)).await.unwrap();

        // Nothing yields in between, so the service falls behind the channel.
        for i in 0..5 {
            store
                .add_link(&format!("https://site{i}.io"), LinkPatch::default())
                .unwrap();
        }

        let mut restarted = false;
        for _ in 0..3 {
            if matches!(next_message(&mut remote).await, SyncMessage::SyncStep1(_)) {
                restarted = true;
                break;
            }
        }
        assert!(restarted, "no sync-step-1 after the update channel lagged");
    }
}
