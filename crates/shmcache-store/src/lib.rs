//! shmcache Local Blob Store
//!
//! Durable-publish primitive over the fast local medium:
//! - writers stream into uniquely named temp files and make them visible
//!   under the final blob name in one atomic step (symlink + rename), so
//!   no reader ever observes a partially written file under a final name
//! - claim-or-observe exclusive temp creation, used to deduplicate
//!   concurrent downloads of the same artifact
//! - bounded readers that block until a concurrently filling file holds
//!   enough bytes

pub mod pending;
pub mod reader;

// Re-exports
pub use pending::{BlobStore, PendingWrite};
pub use reader::BoundedReader;
