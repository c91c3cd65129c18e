//! Configuration types for shmcache
//!
//! The client takes an explicit configuration struct instead of ambient
//! globals: storage root, coordinator address, holder identity override,
//! and the replay index for failover runs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Root directory of the fast local store (all published and
    /// temporary blobs live under it)
    pub storage_root: PathBuf,
    /// Coordinator address, `host:port`
    pub coordinator_addr: String,
    /// Holder identity override. When unset the identity is derived from
    /// the sequence number assigned at registration (`client<seq>`).
    /// Replay runs set it to the identity of the run being replayed.
    pub holder_id_override: Option<String>,
    /// Blob name -> pinned historical version, for replay/failover runs.
    /// Empty for normal runs. Read-only for the client's lifetime.
    pub replay_index: HashMap<String, u64>,
    /// Capacity announced in `new_server` at registration
    pub capacity: u32,
    /// Backoff between lease retry attempts (milliseconds)
    pub lease_backoff_ms: u64,
    /// Lease max duration requested from the coordinator (seconds)
    pub lease_max_duration_secs: u64,
    /// Payloads above this size are received on a background task
    pub background_threshold: u64,
    /// Chunk size for streaming backing-store transfers
    pub transfer_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/dev/shm/cache"),
            coordinator_addr: "127.0.0.1:1988".to_string(),
            holder_id_override: None,
            replay_index: HashMap::new(),
            capacity: 1222,
            lease_backoff_ms: 100,
            lease_max_duration_secs: 1000,
            background_threshold: 100 * 1024,
            transfer_chunk_size: 1024 * 1024, // 1 MB
        }
    }
}

impl ClientConfig {
    /// Configuration rooted at a specific directory, other fields default
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: root.into(),
            ..Self::default()
        }
    }

    /// True when this client runs in replay/failover mode
    #[must_use]
    pub fn is_replay(&self) -> bool {
        !self.replay_index.is_empty()
    }
}
