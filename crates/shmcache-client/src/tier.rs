//! Backing object-store tier
//!
//! Fetches from and pushes to the external durable object store when no
//! cache copy exists anywhere. Small objects are filled synchronously;
//! larger ones are published immediately and stream into the still-linked
//! temp file on a background task, with bounded readers keeping callers
//! behind the writer.

use crate::coordinator::CoordinatorClient;
use crate::tasks::TaskTracker;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use shmcache_common::{BlobName, Error, Result};
use shmcache_store::BlobStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Byte stream returned by a backing-store get
pub type BackingBody = Box<dyn AsyncRead + Send + Unpin>;

/// External durable object store: named byte blobs with a declared
/// content length
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Fetch an object and its content length
    async fn get(&self, bucket: &str, key: &str) -> Result<(u64, BackingBody)>;

    /// Store an object
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;
}

/// Directory-backed store: one file per `<bucket>/<key>`. Used by tests
/// and single-host deployments.
pub struct FsBackingStore {
    root: PathBuf,
}

impl FsBackingStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl BackingStore for FsBackingStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<(u64, BackingBody)> {
        let path = self.object_path(bucket, key);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BackingStoreMiss {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(Error::backing(format!("open {bucket}/{key}: {e}"))),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::backing(format!("stat {bucket}/{key}: {e}")))?
            .len();
        Ok((len, Box::new(file)))
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backing(format!("mkdir for {bucket}/{key}: {e}")))?;
        }
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| Error::backing(format!("write {bucket}/{key}: {e}")))?;
        Ok(())
    }
}

/// Fetch `bucket/key` from the backing store and publish it under `name`.
///
/// Below `background_threshold` the body is read fully and published
/// synchronously. Otherwise the final name is published immediately
/// (pointing at the still-filling temp file) and the body streams in
/// `chunk_size` pieces on a tracked background task. After a
/// non-lease-protected fetch completes, the coordinator is told the blob
/// is now cached here.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn fetch_into_store(
    store: &BlobStore,
    backing: &Arc<dyn BackingStore>,
    coordinator: &Arc<Mutex<CoordinatorClient>>,
    tasks: &TaskTracker,
    name: &BlobName,
    bucket: &str,
    key: &str,
    seq: u64,
    background_threshold: u64,
    chunk_size: usize,
) -> Result<u64> {
    let (size, mut body) = backing.get(bucket, key).await?;
    debug!(%name, size, "backing store fetch");

    let disambiguator = format!("{seq}-{}", rand::thread_rng().gen_range(0u32..1_000_000));
    let temp_name = name.temp_name(&disambiguator);
    let temp_path = store.entry_path(&temp_name);
    let mut file = std::fs::File::create(&temp_path)?;

    if size < background_threshold {
        let mut data = Vec::with_capacity(size as usize);
        body.read_to_end(&mut data)
            .await
            .map_err(|e| Error::backing(format!("read {bucket}/{key}: {e}")))?;
        std::io::Write::write_all(&mut file, &data)?;
        drop(file);
        store.link_published(&temp_path, name)?;
        register_fill(coordinator, name).await?;
    } else {
        // Publish first: readers land on the filling temp file and use
        // bounded reads to stay behind the transfer.
        store.link_published(&temp_path, name)?;
        let name = name.clone();
        let bucket = bucket.to_string();
        let key = key.to_string();
        let coordinator = coordinator.clone();
        let consistency = name.is_consistent();
        tasks.spawn(async move {
            stream_body(&mut body, &mut file, size, chunk_size)
                .await
                .map_err(|e| {
                    Error::backing(format!("background fetch of {bucket}/{key}: {e}"))
                })?;
            if !consistency {
                coordinator.lock().await.reg(&name).await?;
            }
            Ok(())
        });
    }
    Ok(size)
}

async fn register_fill(
    coordinator: &Arc<Mutex<CoordinatorClient>>,
    name: &BlobName,
) -> Result<()> {
    if name.is_consistent() {
        return Ok(());
    }
    coordinator.lock().await.reg(name).await
}

async fn stream_body(
    body: &mut BackingBody,
    file: &mut std::fs::File,
    size: u64,
    chunk_size: usize,
) -> Result<()> {
    let mut buf = vec![0u8; chunk_size];
    let mut received: u64 = 0;
    while received < size {
        let n = body
            .read(&mut buf)
            .await
            .map_err(|e| Error::backing(format!("stream read: {e}")))?;
        if n == 0 {
            return Err(Error::backing(format!(
                "stream ended early ({received}/{size} bytes)"
            )));
        }
        std::io::Write::write_all(file, &buf[..n])?;
        received += n as u64;
    }
    debug!(size, "backing store stream complete");
    Ok(())
}

/// Upload a published local file under a version-qualified key on a
/// tracked background task. Never blocks the writer's close.
pub(crate) fn push_background(
    backing: &Arc<dyn BackingStore>,
    tasks: &TaskTracker,
    local_path: PathBuf,
    bucket: String,
    key: String,
    version: u64,
) {
    let backing = backing.clone();
    tasks.spawn(async move {
        let versioned_key = format!("{key}~{version}");
        let data = tokio::fs::read(&local_path).await.map_err(|e| {
            Error::backing(format!("read {} for push: {e}", local_path.display()))
        })?;
        backing.put(&bucket, &versioned_key, data.into()).await
    });
}
