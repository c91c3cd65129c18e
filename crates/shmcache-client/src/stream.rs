//! Read/write stream sessions
//!
//! The public stream types returned by [`CacheClient`]. Each stream shares
//! its release state with the client's session registry: closing a stream
//! takes the state out and runs the matching coordinator release exactly
//! once, so a double close is a no-op and shutdown can force-close
//! stragglers whose owners never called close.
//!
//! [`CacheClient`]: crate::client::CacheClient

use crate::client::ClientInner;
use bytes::Bytes;
use parking_lot::Mutex;
use shmcache_common::{BlobName, Error, Result};
use shmcache_store::{BoundedReader, PendingWrite};
use std::sync::Arc;

/// Options common to every open call
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Lease-based consistency: acquire a lease on open, release on close
    pub consistency: bool,
    /// Snapshot isolation for writes: the lease release is queued for the
    /// batched `commit_write` instead of running on close
    pub snapshot: bool,
    /// The blob is tiered through the backing object store
    pub backing_store: bool,
}

impl OpenOptions {
    #[must_use]
    pub fn consistency(mut self) -> Self {
        self.consistency = true;
        self
    }

    #[must_use]
    pub fn snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }

    #[must_use]
    pub fn backing_store(mut self) -> Self {
        self.backing_store = true;
        self
    }
}

/// Coordinator work owed when a read session closes
pub(crate) enum ReadRelease {
    /// Replay reads and the read half of a read-write pair: close does
    /// nothing protocol-wise
    Nothing,
    /// Plain read: re-announce the cached copy
    Cache { name: BlobName },
    /// Lease-protected read: release the read lease
    Unlock { name: BlobName },
}

/// A write session's state until close: the open temp file plus everything
/// the release path needs
pub(crate) struct WriteSession {
    pub(crate) name: BlobName,
    pub(crate) bucket: String,
    pub(crate) key: String,
    pub(crate) pending: PendingWrite,
    pub(crate) consistency: bool,
    pub(crate) snapshot: bool,
    pub(crate) backing: bool,
    pub(crate) replay: bool,
    pub(crate) version: u64,
}

/// Release state of one open session. `None` inside means the session is
/// already closed.
pub(crate) enum SessionState {
    Read(Option<ReadRelease>),
    Write(Option<WriteSession>),
}

/// What a close (or forced close) took out of a session
pub(crate) enum Released {
    Read(ReadRelease),
    Write(WriteSession),
}

/// Shared handle to a registered session
#[derive(Clone)]
pub(crate) struct SessionRef {
    pub(crate) id: u64,
    pub(crate) state: Arc<Mutex<SessionState>>,
}

impl SessionRef {
    /// Take the release state, leaving the session closed. `None` if it
    /// was closed already.
    pub(crate) fn take(&self) -> Option<Released> {
        match &mut *self.state.lock() {
            SessionState::Read(release) => release.take().map(Released::Read),
            SessionState::Write(session) => session.take().map(Released::Write),
        }
    }
}

/// An open read session.
///
/// A stream without an underlying reader represents a truly absent blob:
/// every read returns zero bytes.
pub struct InputStream {
    inner: Arc<ClientInner>,
    session: SessionRef,
    reader: Option<BoundedReader>,
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("has_reader", &self.reader.is_some())
            .finish_non_exhaustive()
    }
}

impl InputStream {
    pub(crate) fn new(
        inner: Arc<ClientInner>,
        session: SessionRef,
        reader: Option<BoundedReader>,
    ) -> Self {
        Self {
            inner,
            session,
            reader,
        }
    }

    /// Declared size for bounded sessions
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.reader.as_ref().and_then(BoundedReader::expected)
    }

    /// Read up to `amt` bytes; bounded sessions block until the bytes
    /// exist and return exactly `min(amt, remaining)`
    pub async fn read(&mut self, amt: usize) -> Result<Bytes> {
        match &mut self.reader {
            Some(reader) => reader.read(amt).await,
            None => Ok(Bytes::new()),
        }
    }

    /// Read everything left in the session
    pub async fn read_remaining(&mut self) -> Result<Bytes> {
        match &mut self.reader {
            Some(reader) => reader.read_remaining().await,
            None => Ok(Bytes::new()),
        }
    }

    /// Read one line including the terminator
    pub async fn read_line(&mut self) -> Result<Bytes> {
        match &mut self.reader {
            Some(reader) => reader.read_line().await,
            None => Ok(Bytes::new()),
        }
    }

    /// Close the session, releasing or re-announcing with the coordinator
    /// as the open mode requires. Second close is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.reader = None;
        self.inner.close_session(&self.session).await
    }
}

/// An open write session. Bytes are buffered into an exclusive temp file;
/// close publishes atomically and releases the lease (or queues it for
/// commit, or registers the fresh copy).
pub struct OutputStream {
    inner: Arc<ClientInner>,
    session: SessionRef,
}

impl OutputStream {
    pub(crate) fn new(inner: Arc<ClientInner>, session: SessionRef) -> Self {
        Self { inner, session }
    }

    /// Append bytes to the pending blob
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut *self.session.state.lock() {
            SessionState::Write(Some(session)) => session.pending.append(bytes),
            _ => Err(Error::invalid_argument("write on a closed stream")),
        }
    }

    /// Publish the blob and run the release protocol. Second close is a
    /// no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.inner.close_session(&self.session).await
    }
}

/// Combined read/write session over one blob identity, held under a single
/// write-mode lease. The read half carries no release of its own; closing
/// the combined stream runs the write release once.
pub struct ReadWriteStream {
    pub input: InputStream,
    pub output: OutputStream,
}

impl ReadWriteStream {
    pub async fn read(&mut self, amt: usize) -> Result<Bytes> {
        self.input.read(amt).await
    }

    pub async fn read_remaining(&mut self) -> Result<Bytes> {
        self.input.read_remaining().await
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.output.write(bytes)
    }

    /// Close both halves; only the write half talks to the coordinator
    pub async fn close(&mut self) -> Result<()> {
        self.input.close().await?;
        self.output.close().await
    }
}
