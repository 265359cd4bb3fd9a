//! Durable storage for local replicas.
//!
//! ```text
//! ┌─────────────┐  DocUpdate   ┌─────────────┐  append / snapshot  ┌──────────────┐
//! │ LinkStore   │ ───────────► │ Persistence │ ──────────────────► │ ReplicaStore │
//! │ (in memory) │ ◄─────────── │ (flusher)   │ ◄────────────────── │ (RocksDB)    │
//! └─────────────┘  replay      └─────────────┘  load on startup    └──────────────┘
//! ```

pub mod persistence;
pub mod rocks;

pub use persistence::Persistence;
pub use rocks::{ReplicaMetadata, ReplicaStore, StorageError, StoreConfig};
