//! shmcache Client - cache coordination and blob movement
//!
//! The client side of a shared-memory-backed distributed object cache:
//! - synchronous line protocol to the coordinator (registration, miss
//!   lookup, lease acquire/release, batched commit)
//! - peer-to-peer blob transfer over pooled persistent sockets with
//!   race-free download dedup
//! - backing object-store tiering for full cache misses
//! - deterministic-replay/failover redirection of reads and writes
//! - the stream façade (`CacheClient::open_read` / `open_write` /
//!   `open_read_write`) composing all of the above

pub mod client;
pub mod coordinator;
mod peer;
pub mod stream;
mod tasks;
pub mod tier;

// Re-exports
pub use client::CacheClient;
pub use coordinator::{CoordinatorClient, LockGrant, LockOptions};
pub use shmcache_common::{BlobName, ClientConfig, Error, Location, LockMode, Result};
pub use stream::{InputStream, OpenOptions, OutputStream, ReadWriteStream};
pub use tier::{BackingStore, FsBackingStore};
