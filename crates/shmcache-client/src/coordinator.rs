//! Coordinator protocol client
//!
//! One long-lived TCP connection to the coordinator, strictly synchronous:
//! exactly one request line out, one reply line in, correlated purely by
//! send order. There is no request identifier, so callers must serialize
//! access to this client (the façade holds it behind an async mutex).
//!
//! Requests are `0|<command>|<args...>\n`. Replies echo the client slot:
//! `0|<tag>|<status>|<extra...>\n`, except `lookup` whose reply carries
//! the location field directly after the tag.

use shmcache_common::{BlobName, Error, Location, LockMode, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::sleep;
use tracing::{debug, info};

/// Fixed client slot prefixed to every request line
const CLIENT_SLOT: &str = "0";

/// Maximum unlock commands packed into one batched commit line
const COMMIT_BATCH: usize = 100;

/// Options for a lease request
#[derive(Clone, Copy, Debug, Default)]
pub struct LockOptions {
    /// Lease covers a backing-store-tiered blob; the reply resolves the
    /// actual access mode
    pub backing: bool,
    /// Snapshot isolation: release is deferred to `commit_write`, and
    /// contention raises immediately instead of retrying
    pub snapshot: bool,
    /// Ask the coordinator to resolve the current location in the same
    /// round trip (read-write opens)
    pub check_location: bool,
    /// Declared version; 0 means most recent, a replay run pins the
    /// recorded historical version
    pub version: u64,
}

/// A granted lease
#[derive(Clone, Debug)]
pub struct LockGrant {
    /// Where the freshest copy lives, when the reply carried a location
    pub location: Location,
    /// Resolved access mode (differs from the requested one only for
    /// backing-store-flagged leases)
    pub mode: LockMode,
}

/// The single persistent connection to the coordinator
pub struct CoordinatorClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    seq: u64,
    holder_id: String,
    backoff: Duration,
    /// Unlock commands accumulated by snapshot-isolated writes
    pending_commits: Vec<String>,
    committed: bool,
}

impl CoordinatorClient {
    /// Connect and register. The reply to `new_server` carries the
    /// sequence number that namespaces this client's temp files and,
    /// absent an override, seeds its holder identity.
    pub async fn connect(
        addr: &str,
        capacity: u32,
        holder_id_override: Option<&str>,
        backoff: Duration,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            seq: 0,
            holder_id: String::new(),
            backoff,
            pending_commits: Vec::new(),
            committed: false,
        };
        let fields = client.round_trip(&format!("new_server|{capacity}")).await?;
        let seq = fields
            .get(2)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::protocol(format!("bad new_server reply: {fields:?}")))?;
        client.seq = seq;
        client.holder_id = holder_id_override
            .map_or_else(|| format!("client{seq}"), str::to_string);
        info!(seq, holder = %client.holder_id, "registered with coordinator");
        Ok(client)
    }

    /// Sequence number assigned at registration
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// This client's lease holder identity
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Announce a blob as freshly cached locally (after a write publish
    /// or a backing-store fill)
    pub async fn reg(&mut self, name: &BlobName) -> Result<()> {
        let fields = self.round_trip(&format!("reg|{name}")).await?;
        match fields.get(3).map(String::as_str) {
            Some("success") => Ok(()),
            other => Err(Error::protocol(format!(
                "reg {name} rejected: {other:?}"
            ))),
        }
    }

    /// Re-announce a cached location after a plain read closes
    pub async fn cache(&mut self, name: &BlobName) -> Result<bool> {
        let fields = self.round_trip(&format!("cache|{name}")).await?;
        Ok(fields.get(3).map(String::as_str) == Some("success"))
    }

    /// Miss lookup: where does the freshest copy of `name` live?
    pub async fn lookup(&mut self, name: &BlobName) -> Result<Location> {
        let fields = self.round_trip(&format!("lookup|{name}")).await?;
        let field = fields
            .get(2)
            .ok_or_else(|| Error::protocol(format!("bad lookup reply: {fields:?}")))?;
        Ok(Location::parse(field))
    }

    /// Request a lease.
    ///
    /// A plain `fail` reply is retried every backoff interval with no
    /// attempt limit — unless the request is snapshot-isolated, in which
    /// case the first `fail` raises [`Error::Contended`] immediately. An
    /// `exception` reply is fatal, except a version conflict, which maps
    /// to the distinct caller-retryable [`Error::VersionConflict`].
    pub async fn lock(
        &mut self,
        mode: LockMode,
        name: &BlobName,
        max_duration_secs: u64,
        opts: LockOptions,
    ) -> Result<LockGrant> {
        let command = format!(
            "consistent_lock|{mode}|{name}|{holder}|{max_duration_secs}|{s3}|{snap}|{chk}|{version}",
            holder = self.holder_id,
            s3 = if opts.backing { "s3" } else { "nos3" },
            snap = u8::from(opts.snapshot),
            chk = u8::from(opts.check_location),
            version = opts.version,
        );
        loop {
            let fields = self.round_trip(&command).await?;
            let status = fields
                .get(2)
                .ok_or_else(|| Error::protocol(format!("bad lock reply: {fields:?}")))?;
            if status.starts_with("success") {
                // Field 3 is the resolved access mode when present; a
                // malformed value is a protocol fault, not a fallback.
                let mode = match fields.get(3) {
                    Some(field) if !field.is_empty() => LockMode::parse(field)
                        .map_err(|_| {
                            Error::protocol(format!("bad lock reply mode {field:?}"))
                        })?,
                    _ => mode,
                };
                let location = fields
                    .get(4)
                    .map_or(Location::Absent, |f| Location::parse(f));
                return Ok(LockGrant { location, mode });
            }
            if status.starts_with("exception") {
                if status.contains("version_conflict") || status.contains("stale_version") {
                    return Err(Error::VersionConflict {
                        name: name.to_string(),
                        requested: opts.version,
                    });
                }
                return Err(Error::protocol(status.clone()));
            }
            // Plain contention
            if opts.snapshot {
                return Err(Error::Contended {
                    name: name.to_string(),
                });
            }
            debug!(%name, "lease contended, backing off");
            sleep(self.backoff).await;
        }
    }

    /// Release a held lease. Single round trip, no retry; returns whether
    /// the coordinator acknowledged the release.
    pub async fn unlock(
        &mut self,
        mode: LockMode,
        name: &BlobName,
        modified: bool,
    ) -> Result<bool> {
        let command = self.unlock_command(mode, name, modified);
        let fields = self.round_trip(&command).await?;
        Ok(fields.get(2).map(String::as_str) != Some("fail"))
    }

    /// Queue the release of a snapshot-isolated write lease for the next
    /// `commit_write`
    pub fn queue_snapshot_unlock(&mut self, name: &BlobName, modified: bool) {
        let command = self.unlock_command(LockMode::Write, name, modified);
        self.pending_commits.push(command);
    }

    /// Number of unlock commands waiting for commit
    #[must_use]
    pub fn pending_commit_count(&self) -> usize {
        self.pending_commits.len()
    }

    /// Batch-release all outstanding snapshot write leases.
    ///
    /// Up to 100 unlock commands are `/`-joined per line; the reply must
    /// contain exactly as many `/`-joined acks or the call is a protocol
    /// violation. Idempotent: a second call performs no I/O.
    pub async fn commit_write(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;
        let pending = std::mem::take(&mut self.pending_commits);
        for batch in pending.chunks(COMMIT_BATCH) {
            let line = batch.join("/");
            let reply = self.round_trip_line(&line).await?;
            let acks = reply.split('/').count();
            if acks != batch.len() {
                return Err(Error::protocol(format!(
                    "commit_write ack count mismatch: sent {}, got {acks}",
                    batch.len()
                )));
            }
        }
        Ok(())
    }

    /// Announce a write takeover during replay/failover, bypassing the
    /// normal unlock path
    pub async fn failover_write_update(
        &mut self,
        name: &BlobName,
        original_holder_suffix: &str,
    ) -> Result<()> {
        let command = format!(
            "failover_write_update|{name}|{original_holder_suffix}|{holder}",
            holder = self.holder_id
        );
        let fields = self.round_trip(&command).await?;
        match fields.get(2).map(String::as_str) {
            Some(status) if status.starts_with("exception") => {
                Err(Error::protocol(status.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn unlock_command(&self, mode: LockMode, name: &BlobName, modified: bool) -> String {
        format!(
            "consistent_unlock|{mode}|{name}|{holder}|{m}",
            holder = self.holder_id,
            m = u8::from(modified),
        )
    }

    /// One request line out, one reply line in, split on `|`
    async fn round_trip(&mut self, command: &str) -> Result<Vec<String>> {
        let reply = self.round_trip_line(command).await?;
        Ok(reply.split('|').map(str::to_string).collect())
    }

    async fn round_trip_line(&mut self, command: &str) -> Result<String> {
        debug!(%command, "-> coordinator");
        let line = format!("{CLIENT_SLOT}|{command}\n");
        self.writer.write_all(line.as_bytes()).await?;
        let mut reply = String::new();
        let n = self.reader.read_line(&mut reply).await?;
        if n == 0 {
            return Err(Error::protocol("coordinator closed the connection"));
        }
        let reply = reply.trim_end().to_string();
        debug!(%reply, "<- coordinator");
        Ok(reply)
    }
}
