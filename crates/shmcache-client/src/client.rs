//! Client composition and open/close orchestration
//!
//! `CacheClient` wires the local store, the coordinator connection, the
//! peer pool, and the optional backing-store tier behind typed open calls.
//! A read resolves its source in coordinator-directed priority order:
//! local copy, peer transfer, backing store, empty stream. A write buffers
//! into an exclusive temp file and publishes on close. Replay runs
//! redirect indexed reads to their pinned historical artifacts and route
//! write releases through the failover takeover announcement.

use crate::coordinator::{CoordinatorClient, LockOptions};
use crate::peer::PeerPool;
use crate::stream::{
    InputStream, OpenOptions, OutputStream, ReadRelease, ReadWriteStream, Released, SessionRef,
    SessionState, WriteSession,
};
use crate::tasks::TaskTracker;
use crate::tier::{self, BackingStore};
use shmcache_common::{BlobName, ClientConfig, Error, Location, LockMode, Result};
use shmcache_store::{BlobStore, BoundedReader};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Client handle for the distributed object cache.
///
/// Cheap to clone; all clones share one coordinator connection, peer pool,
/// and session registry. [`shutdown`] must be called explicitly before the
/// process exits.
///
/// [`shutdown`]: CacheClient::shutdown
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) store: BlobStore,
    pub(crate) coordinator: Arc<Mutex<CoordinatorClient>>,
    pub(crate) peers: PeerPool,
    pub(crate) backing: Option<Arc<dyn BackingStore>>,
    pub(crate) config: ClientConfig,
    pub(crate) seq: u64,
    pub(crate) tasks: TaskTracker,
    sessions: parking_lot::Mutex<HashMap<u64, SessionRef>>,
    next_session: AtomicU64,
    shut_down: AtomicBool,
}

impl CacheClient {
    /// Connect to the coordinator and register, without a backing store
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::connect_inner(config, None).await
    }

    /// Connect with a backing object-store tier for full cache misses and
    /// write-through pushes
    pub async fn connect_with_backing(
        config: ClientConfig,
        backing: Arc<dyn BackingStore>,
    ) -> Result<Self> {
        Self::connect_inner(config, Some(backing)).await
    }

    async fn connect_inner(
        config: ClientConfig,
        backing: Option<Arc<dyn BackingStore>>,
    ) -> Result<Self> {
        let store = BlobStore::open(&config.storage_root)?;
        // In replay mode the configured override names the run being
        // replayed, not this client; identity then derives from the
        // freshly assigned sequence number.
        let holder_override = if config.is_replay() {
            None
        } else {
            config.holder_id_override.as_deref()
        };
        let coordinator = CoordinatorClient::connect(
            &config.coordinator_addr,
            config.capacity,
            holder_override,
            Duration::from_millis(config.lease_backoff_ms),
        )
        .await?;
        let seq = coordinator.seq();
        info!(seq, replay = config.is_replay(), "cache client connected");
        Ok(Self {
            inner: Arc::new(ClientInner {
                store,
                coordinator: Arc::new(Mutex::new(coordinator)),
                peers: PeerPool::new(),
                backing,
                config,
                seq,
                tasks: TaskTracker::new(),
                sessions: parking_lot::Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Sequence number assigned by the coordinator at registration
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    /// Open a blob for reading.
    ///
    /// With consistency on, a read lease is acquired first and its reply
    /// directs the miss resolution; otherwise a plain miss lookup runs.
    /// An absent blob with no backing store yields an empty stream.
    pub async fn open_read(
        &self,
        bucket: &str,
        key: &str,
        opts: OpenOptions,
    ) -> Result<InputStream> {
        self.inner.ensure_open()?;
        let name = BlobName::new(bucket, key, opts.consistency)?;

        if let Some(version) = self.inner.replay_version(&name) {
            return self.inner.open_replay_read(&name, version, opts).await;
        }

        let location = if opts.consistency {
            let grant = self
                .inner
                .lock(LockMode::Read, &name, opts, /* check_location */ false, 0)
                .await?;
            grant.location
        } else {
            self.inner.coordinator.lock().await.lookup(&name).await?
        };

        let reader = self.inner.resolve_read(&name, location, opts).await?;
        let release = if opts.consistency {
            ReadRelease::Unlock { name }
        } else if reader.is_some() {
            ReadRelease::Cache { name }
        } else {
            ReadRelease::Nothing
        };
        let session = self.inner.register(SessionState::Read(Some(release)));
        Ok(InputStream::new(self.inner.clone(), session, reader))
    }

    /// Open a blob for writing.
    ///
    /// Bytes buffer into an exclusive temp file; close publishes
    /// atomically and releases the lease (immediately, or queued for
    /// `commit_write` under snapshot isolation), or registers the fresh
    /// copy when consistency is off.
    pub async fn open_write(
        &self,
        bucket: &str,
        key: &str,
        opts: OpenOptions,
    ) -> Result<OutputStream> {
        self.inner.ensure_open()?;
        let name = BlobName::new(bucket, key, opts.consistency)?;
        let replay_version = self.inner.replay_version(&name);

        if opts.consistency {
            self.inner
                .lock(
                    LockMode::Write,
                    &name,
                    opts,
                    false,
                    replay_version.unwrap_or(0),
                )
                .await?;
        }
        let pending = self.inner.store.begin_write(&name, self.inner.seq)?;
        let session = self.inner.register(SessionState::Write(Some(WriteSession {
            name,
            bucket: bucket.to_string(),
            key: key.to_string(),
            pending,
            consistency: opts.consistency,
            snapshot: opts.snapshot,
            backing: opts.backing_store,
            replay: replay_version.is_some(),
            version: replay_version.unwrap_or(0),
        })));
        Ok(OutputStream::new(self.inner.clone(), session))
    }

    /// Open a blob for combined reading and writing under one write-mode
    /// lease whose reply also resolves the read location. Requires
    /// consistency.
    pub async fn open_read_write(
        &self,
        bucket: &str,
        key: &str,
        opts: OpenOptions,
    ) -> Result<ReadWriteStream> {
        self.inner.ensure_open()?;
        if !opts.consistency {
            return Err(Error::invalid_argument(
                "read-write sessions require consistency",
            ));
        }
        let name = BlobName::new(bucket, key, true)?;
        let replay_version = self.inner.replay_version(&name);

        let grant = self
            .inner
            .lock(
                LockMode::Write,
                &name,
                opts,
                /* check_location */ true,
                replay_version.unwrap_or(0),
            )
            .await?;

        let reader = match replay_version {
            Some(version) => Some(self.inner.open_pinned(&name, version).await?),
            None => self.inner.resolve_read(&name, grant.location, opts).await?,
        };
        // The write half owns the lease release; the read half closes
        // silently.
        let read_session = self.inner.register(SessionState::Read(Some(ReadRelease::Nothing)));
        let input = InputStream::new(self.inner.clone(), read_session, reader);

        let pending = self.inner.store.begin_write(&name, self.inner.seq)?;
        let write_session = self.inner.register(SessionState::Write(Some(WriteSession {
            name,
            bucket: bucket.to_string(),
            key: key.to_string(),
            pending,
            consistency: true,
            snapshot: opts.snapshot,
            backing: opts.backing_store,
            replay: replay_version.is_some(),
            version: replay_version.unwrap_or(0),
        })));
        let output = OutputStream::new(self.inner.clone(), write_session);
        Ok(ReadWriteStream { input, output })
    }

    /// Shut down the client: force-close straggler sessions, issue the
    /// batched commit once, join in-flight background transfers, and drop
    /// every pooled connection. Idempotent. A failing step does not stop
    /// the later ones; the first failure is returned once the sequence
    /// has run to the end.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let stragglers: Vec<SessionRef> = {
            let mut sessions = self.inner.sessions.lock();
            sessions.drain().map(|(_, session)| session).collect()
        };
        if !stragglers.is_empty() {
            warn!(count = stragglers.len(), "force-closing open sessions");
        }
        // Every step runs even when an earlier one failed; the first
        // error is returned once the whole sequence completed.
        let mut first_err = None;
        for session in stragglers {
            if let Some(released) = session.take() {
                if let Err(e) = self.inner.release(released).await {
                    warn!("straggler release failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.inner.coordinator.lock().await.commit_write().await {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.inner.tasks.join_all().await {
            first_err.get_or_insert(e);
        }
        self.inner.peers.clear().await;
        info!("cache client shut down");
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl ClientInner {
    fn ensure_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::invalid_argument("client is shut down"));
        }
        Ok(())
    }

    fn replay_version(&self, name: &BlobName) -> Option<u64> {
        self.config.replay_index.get(name.as_str()).copied()
    }

    async fn lock(
        &self,
        mode: LockMode,
        name: &BlobName,
        opts: OpenOptions,
        check_location: bool,
        version: u64,
    ) -> Result<crate::coordinator::LockGrant> {
        self.coordinator
            .lock()
            .await
            .lock(
                mode,
                name,
                self.config.lease_max_duration_secs,
                LockOptions {
                    backing: opts.backing_store,
                    snapshot: opts.snapshot,
                    check_location,
                    version,
                },
            )
            .await
    }

    /// Replay read: redirect to the version-pinned artifact from the
    /// original run. The lease (when requested) carries the recorded
    /// version so the coordinator can detect drift; close does nothing.
    async fn open_replay_read(
        self: &Arc<Self>,
        name: &BlobName,
        version: u64,
        opts: OpenOptions,
    ) -> Result<InputStream> {
        if opts.consistency {
            self.lock(LockMode::Read, name, opts, false, version).await?;
        }
        let reader = self.open_pinned(name, version).await?;
        let session = self.register(SessionState::Read(Some(ReadRelease::Nothing)));
        Ok(InputStream::new(self.clone(), session, Some(reader)))
    }

    async fn open_pinned(&self, name: &BlobName, version: u64) -> Result<BoundedReader> {
        let path = self.store.entry_path(&name.temp_name(&version.to_string()));
        debug!(%name, version, "replay redirect");
        BoundedReader::open(&path, None).await
    }

    /// Resolve a read source from a coordinator-provided location:
    /// local copy, peer transfer, backing store, or nothing.
    async fn resolve_read(
        &self,
        name: &BlobName,
        location: Location,
        opts: OpenOptions,
    ) -> Result<Option<BoundedReader>> {
        match location {
            Location::UseLocal => {
                let reader = BoundedReader::open(self.store.blob_path(name), None).await?;
                Ok(Some(reader))
            }
            Location::Peers(_) => {
                let addr = location
                    .primary_peer()
                    .ok_or_else(|| Error::protocol("peer location without addresses"))?;
                let fetch = self
                    .peers
                    .fetch(
                        addr,
                        name.as_str(),
                        &self.store,
                        self.config.background_threshold,
                        &self.tasks,
                    )
                    .await?;
                // The transfer may still be streaming in the background;
                // publish the final name now and read bounded.
                self.store
                    .link_published(&self.store.entry_path(&fetch.temp_key), name)?;
                let reader =
                    BoundedReader::open(self.store.blob_path(name), Some(fetch.size)).await?;
                Ok(Some(reader))
            }
            Location::Absent => match (&self.backing, opts.backing_store) {
                (Some(backing), true) => {
                    let (bucket, key, _) = name.decode()?;
                    let size = tier::fetch_into_store(
                        &self.store,
                        backing,
                        &self.coordinator,
                        &self.tasks,
                        name,
                        &bucket,
                        &key,
                        self.seq,
                        self.config.background_threshold,
                        self.config.transfer_chunk_size,
                    )
                    .await?;
                    let reader =
                        BoundedReader::open(self.store.blob_path(name), Some(size)).await?;
                    Ok(Some(reader))
                }
                _ => {
                    debug!(%name, "absent with no backing store, empty stream");
                    Ok(None)
                }
            },
        }
    }

    fn register(self: &Arc<Self>, state: SessionState) -> SessionRef {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = SessionRef {
            id,
            state: Arc::new(parking_lot::Mutex::new(state)),
        };
        self.sessions.lock().insert(id, session.clone());
        session
    }

    pub(crate) async fn close_session(&self, session: &SessionRef) -> Result<()> {
        self.sessions.lock().remove(&session.id);
        match session.take() {
            None => Ok(()), // already closed
            Some(released) => self.release(released).await,
        }
    }

    async fn release(&self, released: Released) -> Result<()> {
        match released {
            Released::Read(release) => self.release_read(release).await,
            Released::Write(session) => self.release_write(session).await,
        }
    }

    async fn release_read(&self, release: ReadRelease) -> Result<()> {
        match release {
            ReadRelease::Nothing => Ok(()),
            ReadRelease::Cache { name } => {
                self.coordinator.lock().await.cache(&name).await?;
                Ok(())
            }
            ReadRelease::Unlock { name } => {
                self.coordinator
                    .lock()
                    .await
                    .unlock(LockMode::Read, &name, true)
                    .await?;
                Ok(())
            }
        }
    }

    async fn release_write(&self, mut session: WriteSession) -> Result<()> {
        let modified = session.pending.modified();
        session.pending.publish()?;
        if session.replay && session.consistency {
            // Write takeover: announce the new holder instead of the
            // normal unlock/commit path.
            let suffix = self
                .config
                .holder_id_override
                .clone()
                .unwrap_or_default();
            self.coordinator
                .lock()
                .await
                .failover_write_update(&session.name, &suffix)
                .await?;
        } else if session.consistency {
            if session.snapshot {
                self.coordinator
                    .lock()
                    .await
                    .queue_snapshot_unlock(&session.name, modified);
            } else {
                self.coordinator
                    .lock()
                    .await
                    .unlock(LockMode::Write, &session.name, modified)
                    .await?;
            }
        } else {
            self.coordinator.lock().await.reg(&session.name).await?;
            if session.backing {
                if let Some(backing) = &self.backing {
                    tier::push_background(
                        backing,
                        &self.tasks,
                        self.store.blob_path(&session.name),
                        session.bucket.clone(),
                        session.key.clone(),
                        session.version,
                    );
                }
            }
        }
        Ok(())
    }
}
