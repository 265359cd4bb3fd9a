//! In-process signaling: a shared directory of peers and channel pairs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{DataChannel, PeerId, Signaling, SignalingEvent, TransportError};

/// Directory that every [`MemorySignaling`] on the same network registers in.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<SignalingEvent>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signaling endpoint that will register as `id`.
    pub fn signaling(&self, id: impl Into<PeerId>) -> MemorySignaling {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        MemorySignaling {
            network: self.clone(),
            id: id.into(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Drop `peer`'s signaling link as if the broker went away. Its data
    /// channels are left alone.
    pub fn interrupt(&self, peer: &PeerId) {
        let removed = self.lock().remove(peer);
        if let Some(events) = removed {
            let _ = events.send(SignalingEvent::Disconnected);
        }
    }

    /// Report an unrecoverable signaling failure to `peer`.
    pub fn fail(&self, peer: &PeerId, reason: &str) {
        if let Some(events) = self.lock().get(peer) {
            let _ = events.send(SignalingEvent::Error(reason.to_string()));
        }
    }

    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.lock().contains_key(peer)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, mpsc::UnboundedSender<SignalingEvent>>> {
        // A poisoned directory still holds consistent entries.
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: &PeerId, events: &mpsc::UnboundedSender<SignalingEvent>) -> Result<(), TransportError> {
        let mut peers = self.lock();
        match peers.get(id) {
            Some(existing) if !existing.same_channel(events) => Err(TransportError::IdTaken(id.clone())),
            _ => {
                peers.insert(id.clone(), events.clone());
                Ok(())
            }
        }
    }
}

pub struct MemorySignaling {
    network: MemoryNetwork,
    id: PeerId,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

impl MemorySignaling {
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

impl Signaling for MemorySignaling {
    async fn acquire_id(&self) -> Result<PeerId, TransportError> {
        self.network.register(&self.id, &self.events_tx)?;
        Ok(self.id.clone())
    }

    async fn connect(&self, peer: PeerId) -> Result<DataChannel, TransportError> {
        if !self.network.is_online(&self.id) {
            return Err(TransportError::Offline);
        }
        let remote = self
            .network
            .lock()
            .get(&peer)
            .cloned()
            .ok_or_else(|| TransportError::PeerUnavailable(peer.clone()))?;

        let (local, far) = DataChannel::pair();
        remote
            .send(SignalingEvent::Offer {
                peer: self.id.clone(),
                channel: far,
            })
            .map_err(|_| TransportError::PeerUnavailable(peer))?;
        Ok(local)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.network.register(&self.id, &self.events_tx)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    fn release(&self) {
        let mut peers = self.network.lock();
        if peers
            .get(&self.id)
            .is_some_and(|events| events.same_channel(&self.events_tx))
        {
            peers.remove(&self.id);
        }
    }
}
