//! Connection status of every peer this replica has talked to.
//!
//! The roster is bookkeeping for callers. It is separate from the sync
//! engine's per-peer state: a peer can be `Connected` here and still
//! `Unsynced` there.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::transport::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnection {
    pub peer_id: PeerId,
    pub status: PeerStatus,
    /// When the current or last channel opened.
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct Roster {
    peers: BTreeMap<PeerId, PeerConnection>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connecting(&mut self, peer: &PeerId) {
        self.entry(peer).status = PeerStatus::Connecting;
    }

    pub fn connected(&mut self, peer: &PeerId) {
        let entry = self.entry(peer);
        entry.status = PeerStatus::Connected;
        entry.connected_at = Some(Utc::now());
    }

    pub fn disconnected(&mut self, peer: &PeerId) {
        self.entry(peer).status = PeerStatus::Disconnected;
    }

    pub fn failed(&mut self, peer: &PeerId) {
        self.entry(peer).status = PeerStatus::Error;
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerConnection> {
        self.peers.get(peer)
    }

    /// All known peers ordered by id.
    pub fn snapshot(&self) -> Vec<PeerConnection> {
        self.peers.values().cloned().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.status == PeerStatus::Connected)
            .count()
    }

    fn entry(&mut self, peer: &PeerId) -> &mut PeerConnection {
        self.peers
            .entry(peer.clone())
            .or_insert_with(|| PeerConnection {
                peer_id: peer.clone(),
                status: PeerStatus::Connecting,
                connected_at: None,
            })
    }
}
