//! Read sessions over published and still-filling blobs
//!
//! A bounded reader knows the declared size of the blob and blocks until a
//! concurrent writer (background transfer) has produced enough bytes. An
//! unbounded reader is a plain pass-through over an already published
//! local file.

use bytes::Bytes;
use shmcache_common::Result;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::{Duration, sleep};
use tracing::trace;

/// Poll interval while waiting for a writer to catch up
const POLL_INTERVAL: Duration = Duration::from_millis(1);

const READ_CHUNK: usize = 64 * 1024;

/// An open read session bound to either a declared size or a plain file
pub struct BoundedReader {
    file: File,
    path: PathBuf,
    /// Declared total size; `None` means pass-through reads
    expected: Option<u64>,
    /// Bytes already handed to the caller
    consumed: u64,
    /// Read-ahead not yet handed out (line scanning)
    buffered: Vec<u8>,
}

impl BoundedReader {
    /// Open a read session.
    ///
    /// With a declared size the open itself waits (polling) for the path
    /// to appear, because publication of a streamed blob can race the
    /// reader.
    pub async fn open(path: impl AsRef<Path>, expected: Option<u64>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if expected.is_some() {
            loop {
                match File::open(&path).await {
                    Ok(f) => break f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        trace!(path = %path.display(), "waiting for blob to appear");
                        sleep(POLL_INTERVAL).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        } else {
            File::open(&path).await?
        };
        Ok(Self {
            file,
            path,
            expected,
            consumed: 0,
            buffered: Vec::new(),
        })
    }

    /// Declared size, if this is a bounded session
    #[must_use]
    pub fn expected(&self) -> Option<u64> {
        self.expected
    }

    /// Bytes handed to the caller so far
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Bytes still owed to the caller under the declared size
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.expected.map(|total| total - self.consumed)
    }

    /// Path this session reads from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `amt` bytes.
    ///
    /// Bounded: `amt` is clamped to the declared remainder and the call
    /// blocks until exactly that many bytes exist, then returns them all.
    /// Unbounded: reads until `amt` bytes or end of file.
    pub async fn read(&mut self, amt: usize) -> Result<Bytes> {
        match self.expected {
            Some(total) => {
                let remaining = (total - self.consumed) as usize;
                let want = amt.min(remaining);
                self.fill_blocking(want).await?;
                Ok(self.take(want))
            }
            None => {
                while self.buffered.len() < amt {
                    if self.fill_once().await? == 0 {
                        break;
                    }
                }
                let take = amt.min(self.buffered.len());
                Ok(self.take(take))
            }
        }
    }

    /// Read everything left: the declared remainder for bounded sessions,
    /// or until end of file otherwise.
    pub async fn read_remaining(&mut self) -> Result<Bytes> {
        match self.expected {
            Some(total) => {
                let remaining = (total - self.consumed) as usize;
                self.read(remaining).await
            }
            None => {
                self.file.read_to_end(&mut self.buffered).await?;
                let len = self.buffered.len();
                Ok(self.take(len))
            }
        }
    }

    /// Read one line including the terminator.
    ///
    /// Bounded sessions apply the same blocking discipline as [`read`]:
    /// the call returns once a `\n` appears or the declared size is
    /// exhausted. Unbounded sessions stop at end of file.
    ///
    /// [`read`]: BoundedReader::read
    pub async fn read_line(&mut self) -> Result<Bytes> {
        loop {
            // Never hand out bytes past the declared size, even when the
            // underlying file holds more than `expected`.
            let limit = self.expected.map(|total| (total - self.consumed) as usize);
            if let Some(pos) = self.buffered.iter().position(|b| *b == b'\n') {
                let take = match limit {
                    Some(limit) => (pos + 1).min(limit),
                    None => pos + 1,
                };
                return Ok(self.take(take));
            }
            match limit {
                Some(limit) => {
                    if self.buffered.len() >= limit {
                        return Ok(self.take(limit));
                    }
                    if self.fill_once().await? == 0 {
                        sleep(POLL_INTERVAL).await;
                    }
                }
                None => {
                    if self.fill_once().await? == 0 {
                        let len = self.buffered.len();
                        return Ok(self.take(len));
                    }
                }
            }
        }
    }

    /// Block until at least `want` bytes are buffered beyond the consumed
    /// count. A writer may still be streaming into the same path, so a
    /// zero-length read means "not yet", not end of stream.
    async fn fill_blocking(&mut self, want: usize) -> Result<()> {
        while self.buffered.len() < want {
            if self.fill_once().await? == 0 {
                sleep(POLL_INTERVAL).await;
            }
        }
        Ok(())
    }

    /// One read into the read-ahead buffer; returns the byte count
    async fn fill_once(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.file.read(&mut chunk).await?;
        self.buffered.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Hand out the first `n` buffered bytes
    fn take(&mut self, n: usize) -> Bytes {
        let rest = self.buffered.split_off(n);
        let out = std::mem::replace(&mut self.buffered, rest);
        self.consumed += out.len() as u64;
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_unbounded_pass_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"alpha\nbeta\n").unwrap();

        let mut reader = BoundedReader::open(&path, None).await.unwrap();
        assert_eq!(reader.read(5).await.unwrap().as_ref(), b"alpha");
        assert_eq!(reader.read_line().await.unwrap().as_ref(), b"\n");
        assert_eq!(reader.read_line().await.unwrap().as_ref(), b"beta\n");
        // End of file: empty results, no blocking
        assert_eq!(reader.read_line().await.unwrap().len(), 0);
        assert_eq!(reader.read(16).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_bounded_read_exact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut reader = BoundedReader::open(&path, Some(10)).await.unwrap();
        assert_eq!(reader.read(4).await.unwrap().as_ref(), b"0123");
        assert_eq!(reader.remaining(), Some(6));
        assert_eq!(reader.read_remaining().await.unwrap().as_ref(), b"456789");
        assert_eq!(reader.remaining(), Some(0));
        // Fully consumed: further reads return empty without blocking
        assert_eq!(reader.read(8).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_bounded_read_blocks_for_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"head-").unwrap();
        file.flush().unwrap();

        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            file.write_all(b"tail!").unwrap();
        });

        let mut reader = BoundedReader::open(&path, Some(10)).await.unwrap();
        // Asks for more than currently exists: must block until the
        // writer lands the rest, then return exactly the requested bytes.
        let data = reader.read(10).await.unwrap();
        assert_eq!(data.as_ref(), b"head-tail!");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_bounded_open_waits_for_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("late");

        let creator = {
            let path = path.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                std::fs::write(&path, b"late bytes").unwrap();
            })
        };

        let mut reader = BoundedReader::open(&path, Some(10)).await.unwrap();
        assert_eq!(reader.read_remaining().await.unwrap().as_ref(), b"late bytes");
        creator.await.unwrap();
    }

    #[tokio::test]
    async fn test_bounded_reads_clamp_to_declared_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        // The file holds more bytes than the session declares
        std::fs::write(&path, b"0123456789overflow\n").unwrap();

        let mut reader = BoundedReader::open(&path, Some(10)).await.unwrap();
        // No newline within the declared size: the line stops there
        assert_eq!(reader.read_line().await.unwrap().as_ref(), b"0123456789");
        assert_eq!(reader.remaining(), Some(0));
        assert_eq!(reader.read(4).await.unwrap().len(), 0);
        assert_eq!(reader.read_line().await.unwrap().len(), 0);

        // A newline beyond the declared size is clamped too
        let mut reader = BoundedReader::open(&path, Some(4)).await.unwrap();
        assert_eq!(reader.read_line().await.unwrap().as_ref(), b"0123");
        assert_eq!(reader.remaining(), Some(0));
    }

    #[tokio::test]
    async fn test_bounded_read_line_with_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"no newline yet").unwrap();

        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            file.write_all(b" done\nrest").unwrap();
        });

        let total = b"no newline yet done\nrest".len() as u64;
        let mut reader = BoundedReader::open(&path, Some(total)).await.unwrap();
        assert_eq!(
            reader.read_line().await.unwrap().as_ref(),
            b"no newline yet done\n"
        );
        // Last line has no terminator: returned once the size is exhausted
        assert_eq!(reader.read_line().await.unwrap().as_ref(), b"rest");
        writer.await.unwrap();
    }
}
