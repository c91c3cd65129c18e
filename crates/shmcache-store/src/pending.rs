//! Blob store root and the write/publish lifecycle
//!
//! Publishing goes through a two-step indirection: a transient symlink
//! (`lnk<random>`) is created pointing at the temp file, then renamed onto
//! the final blob path. The rename is atomic, so the final path either
//! does not exist or resolves to the full temp file.

use rand::Rng;
use shmcache_common::{BlobName, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Handle to the local store root
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open the store, creating the root directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Storage root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final published path for a blob
    #[must_use]
    pub fn blob_path(&self, name: &BlobName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Path of a file directly under the root (temp keys, replay pins)
    #[must_use]
    pub fn entry_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Begin writing a blob into a fresh exclusive temp file.
    ///
    /// The temp name carries the blob name, the client's sequence number,
    /// and a random disambiguator, so concurrent writers never collide.
    pub fn begin_write(&self, name: &BlobName, seq: u64) -> Result<PendingWrite> {
        let disambiguator = format!("{seq}-{}", rand::thread_rng().gen_range(0u32..1_000_000));
        let temp_path = self.entry_path(&name.temp_name(&disambiguator));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        debug!(name = %name, temp = %temp_path.display(), "begin write");
        Ok(PendingWrite {
            file: Some(file),
            temp_path,
            final_path: self.blob_path(name),
            modified: false,
            published: false,
        })
    }

    /// Claim-or-observe: try an exclusive create of `root/<temp_key>`.
    ///
    /// Returns the open file when this caller won the claim and owns
    /// filling it. `None` means another writer (concurrent fetch or a
    /// previous attempt) already owns the path.
    pub fn claim_temp(&self, temp_key: &str) -> Result<Option<File>> {
        let path = self.entry_path(temp_key);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                debug!(temp_key, "claimed temp file");
                Ok(Some(file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(temp_key, "temp file already claimed");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Publish a temp file under the final blob name.
    ///
    /// Used by streaming fetches: the temp file may still be filling when
    /// the link lands, readers use bounded reads to stay behind the
    /// writer.
    pub fn link_published(&self, temp_path: &Path, name: &BlobName) -> Result<()> {
        atomic_link(&self.root, temp_path, &self.blob_path(name))
    }
}

/// An open, not-yet-published local write session
pub struct PendingWrite {
    file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    modified: bool,
    published: bool,
}

impl PendingWrite {
    /// Append bytes to the temp file and mark the session modified
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| shmcache_common::Error::invalid_argument("write after publish"))?;
        file.write_all(bytes)?;
        self.modified = true;
        Ok(())
    }

    /// Close the temp file and atomically publish it under the final
    /// blob name.
    ///
    /// Idempotent: the first call returns `Ok(true)`, any further call is
    /// a no-op returning `Ok(false)`.
    pub fn publish(&mut self) -> Result<bool> {
        if self.published {
            return Ok(false);
        }
        self.published = true;
        // Dropping the handle closes the fd before the link lands
        drop(self.file.take());
        atomic_link(
            self.final_path.parent().unwrap_or(Path::new(".")),
            &self.temp_path,
            &self.final_path,
        )?;
        debug!(target = %self.final_path.display(), "published blob");
        Ok(true)
    }

    /// Whether any bytes were appended
    #[must_use]
    pub fn modified(&self) -> bool {
        self.modified
    }

    /// Whether publish already ran
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.published
    }

    /// Path of the backing temp file
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

/// Symlink-then-rename publish. The transient link lives in `link_dir` so
/// the rename source and target stay on the same medium.
fn atomic_link(link_dir: &Path, temp_path: &Path, final_path: &Path) -> Result<()> {
    let link = link_dir.join(format!(
        "lnk{}",
        rand::thread_rng().gen_range(0u32..1_000_000)
    ));
    std::os::unix::fs::symlink(temp_path, &link)?;
    fs::rename(&link, final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmcache_common::BlobName;
    use tempfile::tempdir;

    fn name() -> BlobName {
        BlobName::new("bucket1", "a/b", false).unwrap()
    }

    #[test]
    fn test_write_publish_read() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut pending = store.begin_write(&name(), 7).unwrap();
        pending.append(b"hello ").unwrap();
        pending.append(b"world").unwrap();
        assert!(pending.modified());
        assert!(pending.publish().unwrap());

        let data = fs::read(store.blob_path(&name())).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn test_publish_idempotent() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut pending = store.begin_write(&name(), 1).unwrap();
        pending.append(b"x").unwrap();
        assert!(pending.publish().unwrap());
        assert!(!pending.publish().unwrap());
        assert!(pending.is_published());
        // Appends after publish are rejected
        assert!(pending.append(b"y").is_err());
    }

    #[test]
    fn test_final_name_never_partial() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let final_path = store.blob_path(&name());

        let mut pending = store.begin_write(&name(), 2).unwrap();
        pending.append(b"partial bytes in temp").unwrap();
        // Before publish the final name must not resolve at all
        assert!(!final_path.exists());

        pending.publish().unwrap();
        assert_eq!(
            fs::read(&final_path).unwrap(),
            b"partial bytes in temp"
        );
    }

    #[test]
    fn test_publish_replaces_previous_version() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut first = store.begin_write(&name(), 3).unwrap();
        first.append(b"old").unwrap();
        first.publish().unwrap();

        let mut second = store.begin_write(&name(), 3).unwrap();
        second.append(b"new").unwrap();
        second.publish().unwrap();

        assert_eq!(fs::read(store.blob_path(&name())).unwrap(), b"new");
    }

    #[test]
    fn test_claim_temp_single_winner() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let winner = store.claim_temp("~~tmp~bucket1~a~b~55").unwrap();
        assert!(winner.is_some());
        for _ in 0..4 {
            assert!(store.claim_temp("~~tmp~bucket1~a~b~55").unwrap().is_none());
        }
    }

    #[test]
    fn test_claim_temp_concurrent() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.claim_temp("~~tmp~b~k~1").unwrap().is_some()
            }));
        }
        let won = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|claimed| *claimed)
            .count();
        assert_eq!(won, 1);
    }

    #[test]
    fn test_link_published_while_filling() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut file = store.claim_temp("~~tmp~bucket1~a~b~9").unwrap().unwrap();
        file.write_all(b"first chunk").unwrap();
        store
            .link_published(&store.entry_path("~~tmp~bucket1~a~b~9"), &name())
            .unwrap();

        // The final name resolves to the still-open temp file; appended
        // bytes show up through the link.
        file.write_all(b", second chunk").unwrap();
        drop(file);
        assert_eq!(
            fs::read(store.blob_path(&name())).unwrap(),
            b"first chunk, second chunk"
        );
    }
}
