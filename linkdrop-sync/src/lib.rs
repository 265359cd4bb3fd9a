//! # linkdrop-sync: peer-to-peer replication for the link store
//!
//! Keeps every replica's [`LinkStore`](linkdrop_core::LinkStore) converging
//! with its peers and durable on disk.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   DataChannel (JSON frames)   ┌──────────────┐
//! │  Replica a   │ ◄────────────────────────────► │  Replica b   │
//! │ SyncService  │                                │ SyncService  │
//! └──────┬───────┘                                └──────┬───────┘
//!        │                                               │
//!        ▼                                               ▼
//! ┌──────────────┐                                ┌──────────────┐
//! │  LinkStore   │                                │  LinkStore   │
//! │  (yrs Doc)   │                                │  (yrs Doc)   │
//! └──────┬───────┘                                └──────────────┘
//!        │
//! ┌──────┴───────┐
//! │ Persistence  │ ──► RocksDB
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: sync wire messages
//! - [`engine`]: per-peer handshake state machine
//! - [`service`]: actor that owns the engine
//! - [`peer`]: data channel lifecycle and connect races
//! - [`roster`]: peer connection status for callers
//! - [`transport`]: signaling and channels (in-memory and WebSocket)
//! - [`storage`]: RocksDB snapshots and update log
//! - [`replica`]: everything above wired together

pub mod config;
pub mod engine;
pub mod peer;
pub mod protocol;
pub mod replica;
pub mod roster;
pub mod service;
pub mod storage;
pub mod transport;

pub use config::ReplicaConfig;
pub use engine::{PeerSyncState, SyncEngine, SyncState, SyncStatus};
pub use peer::{ManagerStatus, PeerConfig, PeerError, PeerEvent, PeerManager};
pub use protocol::{ProtocolError, SyncMessage};
pub use replica::{Replica, ReplicaError};
pub use roster::{PeerConnection, PeerStatus, Roster};
pub use service::{ServiceError, SyncCommand, SyncHandle, SyncService};
pub use storage::{Persistence, ReplicaMetadata, ReplicaStore, StorageError, StoreConfig};
pub use transport::{
    ChannelEvent, ChannelSender, ConnectionId, DataChannel, MemoryNetwork, MemorySignaling,
    PeerId, Signaling, SignalingEvent, TransportError, WsConfig, WsSignaling,
};
