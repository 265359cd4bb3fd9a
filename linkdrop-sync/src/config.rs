//! Replica configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::peer::PeerConfig;
use crate::storage::StoreConfig;

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Device name; keys this replica's durable state.
    pub device: String,
    /// RocksDB settings (None = in-memory only)
    pub storage: Option<StoreConfig>,
    /// Updates between full snapshots (default: 100)
    pub compaction_threshold: usize,
    /// Capacity of the document update channel (default: 1024)
    pub channel_capacity: usize,
    /// Capacity of the sync command queue (default: 64)
    pub command_capacity: usize,
    /// First signaling reconnect delay (default: 500ms)
    pub reconnect_base_delay: Duration,
    /// Reconnect delay cap (default: 30s)
    pub reconnect_max_delay: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            storage: None,
            compaction_threshold: 100,
            channel_capacity: 1024,
            command_capacity: 64,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

impl ReplicaConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Self::default()
        }
    }

    /// In-memory replica with fast reconnects.
    pub fn for_testing(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(100),
            ..Self::default()
        }
    }

    pub fn with_storage(mut self, storage: StoreConfig) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Shorthand for default storage settings at `path`.
    pub fn with_data_dir(self, path: impl Into<PathBuf>) -> Self {
        let storage = StoreConfig::default().with_path(path);
        self.with_storage(storage)
    }

    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            reconnect_base_delay: self.reconnect_base_delay,
            reconnect_max_delay: self.reconnect_max_delay,
        }
    }
}
