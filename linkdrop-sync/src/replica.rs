//! One running replica: document, persistence, peers and sync, wired up.
//!
//! ```text
//!                  ┌────────────┐
//!   caller ──────► │ LinkStore  │ ◄──── Persistence ◄──► ReplicaStore (RocksDB)
//!                  └─────┬──────┘
//!                        │ DocUpdate / apply(Sync)
//!                  ┌─────┴──────┐   PeerEvent   ┌─────────────┐
//!                  │SyncService │ ◄──────────── │ PeerManager │ ◄──► Signaling
//!                  └────────────┘               └─────────────┘
//! ```

use linkdrop_core::{LinkStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ReplicaConfig;
use crate::engine::SyncStatus;
use crate::peer::{PeerError, PeerManager};
use crate::roster::PeerConnection;
use crate::service::{ServiceError, SyncHandle, SyncService};
use crate::storage::{Persistence, ReplicaStore, StorageError};
use crate::transport::{ConnectionId, PeerId, Signaling};

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("document error: {0}")]
    Store(#[from] StoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("sync service has stopped")]
    ServiceStopped,
}

impl From<ServiceError> for ReplicaError {
    fn from(_: ServiceError) -> Self {
        ReplicaError::ServiceStopped
    }
}

pub struct Replica<S: Signaling> {
    store: Arc<LinkStore>,
    persistence: Option<Persistence>,
    peers: PeerManager<S>,
    sync: SyncHandle,
    sync_task: JoinHandle<()>,
    id: PeerId,
}

impl<S: Signaling> Replica<S> {
    /// Build the replica, replay durable state and join the network.
    ///
    /// Returns once stored state has been loaded and the local peer id is
    /// known.
    pub async fn open(config: ReplicaConfig, signaling: S) -> Result<Self, ReplicaError> {
        let store = Arc::new(LinkStore::with_capacity(config.channel_capacity)?);

        let persistence = match &config.storage {
            Some(storage) => {
                let rocks = Arc::new(ReplicaStore::open(storage.clone())?);
                Some(
                    Persistence::init(
                        store.clone(),
                        rocks,
                        &config.device,
                        config.compaction_threshold,
                    )
                    .await,
                )
            }
            None => None,
        };

        let peers = PeerManager::new(signaling, config.peer_config());
        let events = peers.take_events().ok_or(PeerError::AlreadyInitialized)?;
        let (sync, sync_task) = SyncService::spawn(store.clone(), events, config.command_capacity);

        let id = match peers.init().await {
            Ok(id) => id,
            Err(e) => {
                let _ = sync.shutdown().await;
                if let Some(persistence) = &persistence {
                    persistence.close().await;
                }
                return Err(e.into());
            }
        };
        log::info!("Replica {} open as peer {id}", config.device);

        Ok(Self {
            store,
            persistence,
            peers,
            sync,
            sync_task,
            id,
        })
    }

    pub fn store(&self) -> &Arc<LinkStore> {
        &self.store
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn signaling(&self) -> &S {
        self.peers.signaling()
    }

    pub async fn connect(&self, peer: impl Into<PeerId>) -> Result<ConnectionId, ReplicaError> {
        Ok(self.peers.connect(peer.into()).await?)
    }

    pub fn disconnect(&self, peer: &PeerId) -> bool {
        self.peers.disconnect(peer)
    }

    pub fn connections(&self) -> Vec<PeerConnection> {
        self.peers.connections()
    }

    pub async fn force_sync(&self) -> Result<(), ReplicaError> {
        Ok(self.sync.force_sync().await?)
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, ReplicaError> {
        Ok(self.sync.status().await?)
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.sync.watch_status()
    }

    /// Snapshot durable state now. No-op without storage.
    pub async fn flush(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.flush().await;
        }
    }

    /// Leave the network, stop syncing and write a final snapshot.
    pub async fn shutdown(self) {
        self.peers.destroy();
        let _ = self.sync.shutdown().await;
        let _ = self.sync_task.await;
        if let Some(persistence) = &self.persistence {
            persistence.close().await;
        }
        log::info!("Replica {} shut down", self.id);
    }
}
