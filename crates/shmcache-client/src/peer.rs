//! Peer-to-peer blob transfer
//!
//! Lightweight request/response framing over pooled persistent sockets:
//! request `get|<key>;`, reply header `<marker>|<tempKey>|<size>;` with
//! the first payload chunk in the same datagram, remainder streamed until
//! `size` bytes arrived. A zero-length read before that is a connection
//! fault and aborts the transfer.
//!
//! Concurrent fetches of the same temp artifact are deduplicated through
//! the store's claim-or-observe primitive: exactly one fetch owns the
//! destination file, the rest drain their socket into a sink so the
//! connection stays consistent.

use crate::tasks::TaskTracker;
use shmcache_common::{Error, Result};
use shmcache_store::BlobStore;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

const RECV_CHUNK: usize = 64 * 1024;

/// Result of a peer fetch
#[derive(Debug)]
pub struct PeerFetch {
    /// Total payload size announced by the peer
    pub size: u64,
    /// Temp key the payload lives (or will live) under
    pub temp_key: String,
    /// Whether this fetch owned the claim and wrote the file
    pub claimed: bool,
}

/// Pool of persistent peer connections, keyed by address.
///
/// Connections are created lazily on first use, reused for every
/// subsequent transfer to that peer, and torn down only at client
/// shutdown. Requests on one connection are strictly sequential; the
/// per-connection mutex enforces that, while different peers can be
/// contacted concurrently.
pub struct PeerPool {
    connections: Mutex<HashMap<String, Arc<Mutex<TcpStream>>>>,
}

impl PeerPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Number of pooled connections
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Drop every pooled connection
    pub async fn clear(&self) {
        self.connections.lock().await.clear();
    }

    async fn get_or_connect(&self, addr: &str) -> Result<Arc<Mutex<TcpStream>>> {
        let mut pool = self.connections.lock().await;
        if let Some(conn) = pool.get(addr) {
            return Ok(conn.clone());
        }
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::peer(format!("connect {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::peer(format!("nodelay {addr}: {e}")))?;
        debug!(addr, "opened peer connection");
        let conn = Arc::new(Mutex::new(stream));
        pool.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    /// Fetch `key` from the peer at `addr` into the local store.
    ///
    /// The winner of the claim streams the payload into `root/<tempKey>`,
    /// in the background when the payload exceeds `background_threshold`
    /// bytes. Losers drain the socket and return the shared temp key.
    /// Publication under the final blob name is left to the caller.
    pub async fn fetch(
        &self,
        addr: &str,
        key: &str,
        store: &BlobStore,
        background_threshold: u64,
        tasks: &TaskTracker,
    ) -> Result<PeerFetch> {
        debug!(addr, key, "peer fetch");
        let conn = self.get_or_connect(addr).await?;
        let mut guard = conn.lock_owned().await;

        guard
            .write_all(format!("get|{key};").as_bytes())
            .await
            .map_err(|e| Error::peer(format!("send to {addr}: {e}")))?;

        let (marker, temp_key, size, mut first_chunk) = read_header(&mut guard).await?;
        if marker != "get_success" {
            // Drain nothing: a failed get carries no payload
            return Err(Error::PeerMiss(key.to_string()));
        }
        if first_chunk.len() as u64 > size {
            first_chunk.truncate(size as usize);
        }

        match store.claim_temp(&temp_key)? {
            Some(mut file) => {
                file.write_all(&first_chunk)?;
                let received = first_chunk.len() as u64;
                if size > background_threshold && received < size {
                    tasks.spawn(async move {
                        recv_remainder(&mut guard, &mut file, received, size).await
                    });
                } else {
                    recv_remainder(&mut guard, &mut file, received, size).await?;
                }
                Ok(PeerFetch {
                    size,
                    temp_key,
                    claimed: true,
                })
            }
            None => {
                // Another fetch owns the file; drain our copy of the
                // payload so the connection stays request-aligned.
                drain(&mut guard, size - first_chunk.len() as u64).await?;
                debug!(key, temp_key, "drained duplicate peer fetch");
                Ok(PeerFetch {
                    size,
                    temp_key,
                    claimed: false,
                })
            }
        }
    }
}

impl Default for PeerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the `;`-terminated header and whatever payload arrived with it
async fn read_header(
    stream: &mut OwnedMutexGuard<TcpStream>,
) -> Result<(String, String, u64, Vec<u8>)> {
    let mut header = Vec::new();
    let mut first_chunk = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| Error::peer(format!("header read: {e}")))?;
        if n == 0 {
            return Err(Error::peer("connection closed during header"));
        }
        if let Some(pos) = buf[..n].iter().position(|b| *b == b';') {
            header.extend_from_slice(&buf[..pos]);
            first_chunk.extend_from_slice(&buf[pos + 1..n]);
            break;
        }
        header.extend_from_slice(&buf[..n]);
    }
    let header = String::from_utf8(header)
        .map_err(|_| Error::peer("non-utf8 transfer header"))?;
    let mut parts = header.split('|');
    let marker = parts
        .next()
        .ok_or_else(|| Error::peer(format!("malformed header {header:?}")))?
        .to_string();
    if marker == "get_fail" {
        return Ok((marker, String::new(), 0, first_chunk));
    }
    let temp_key = parts
        .next()
        .ok_or_else(|| Error::peer(format!("malformed header {header:?}")))?
        .to_string();
    let size = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error::peer(format!("malformed header {header:?}")))?;
    Ok((marker, temp_key, size, first_chunk))
}

/// Receive the remaining payload into the claimed file
async fn recv_remainder(
    stream: &mut OwnedMutexGuard<TcpStream>,
    file: &mut std::fs::File,
    mut received: u64,
    size: u64,
) -> Result<()> {
    let mut buf = vec![0u8; RECV_CHUNK];
    while received < size {
        let want = buf.len().min((size - received) as usize);
        let n = stream
            .read(&mut buf[..want])
            .await
            .map_err(|e| Error::peer(format!("payload read: {e}")))?;
        if n == 0 {
            return Err(Error::peer(format!(
                "connection closed mid-transfer ({received}/{size} bytes)"
            )));
        }
        file.write_all(&buf[..n])?;
        received += n as u64;
    }
    debug!(size, "peer receive complete");
    Ok(())
}

/// Consume `remaining` payload bytes without keeping them
async fn drain(stream: &mut OwnedMutexGuard<TcpStream>, mut remaining: u64) -> Result<()> {
    let mut buf = vec![0u8; RECV_CHUNK];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = stream
            .read(&mut buf[..want])
            .await
            .map_err(|e| Error::peer(format!("drain read: {e}")))?;
        if n == 0 {
            return Err(Error::peer(format!(
                "connection closed mid-drain ({remaining} bytes left)"
            )));
        }
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    /// Minimal peer: serves `get|<key>;` with a fixed payload, optionally
    /// hanging up after `truncate_at` payload bytes.
    async fn spawn_peer(payload: Vec<u8>, truncate_at: Option<usize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let payload = payload.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    loop {
                        let mut byte = [0u8; 1];
                        match stream.read(&mut byte).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        if byte[0] == b';' {
                            let request = String::from_utf8_lossy(&buf).to_string();
                            buf.clear();
                            let key = request.trim_start_matches("get|").to_string();
                            let temp_key = format!("~~tmp~{key}~1");
                            let header =
                                format!("get_success|{temp_key}|{};", payload.len());
                            stream.write_all(header.as_bytes()).await.unwrap();
                            let body = match truncate_at {
                                Some(at) => &payload[..at],
                                None => &payload[..],
                            };
                            stream.write_all(body).await.unwrap();
                            if truncate_at.is_some() {
                                return; // hang up mid-transfer
                            }
                        } else {
                            buf.push(byte[0]);
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_fetch_small_payload() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let addr = spawn_peer(b"hello from peer".to_vec(), None).await;

        let pool = PeerPool::new();
        let tasks = TaskTracker::new();
        let fetch = pool
            .fetch(&addr, "b~k", &store, 100 * 1024, &tasks)
            .await
            .unwrap();
        assert!(fetch.claimed);
        assert_eq!(fetch.size, 15);
        assert_eq!(fetch.temp_key, "~~tmp~b~k~1");
        assert_eq!(
            std::fs::read(store.entry_path(&fetch.temp_key)).unwrap(),
            b"hello from peer"
        );
    }

    #[tokio::test]
    async fn test_fetch_large_payload_in_background() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let payload: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
        let addr = spawn_peer(payload.clone(), None).await;

        let pool = PeerPool::new();
        let tasks = TaskTracker::new();
        let fetch = pool
            .fetch(&addr, "b~big", &store, 100 * 1024, &tasks)
            .await
            .unwrap();
        assert!(fetch.claimed);
        assert_eq!(fetch.size, payload.len() as u64);

        // The call returned while the payload may still be streaming;
        // joining the tracker completes the transfer.
        tasks.join_all().await.unwrap();
        assert_eq!(
            std::fs::read(store.entry_path(&fetch.temp_key)).unwrap(),
            payload
        );
    }

    #[tokio::test]
    async fn test_concurrent_fetches_dedup() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let addr = spawn_peer(b"shared artifact".to_vec(), None).await;

        let pool = Arc::new(PeerPool::new());
        let tasks = Arc::new(TaskTracker::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let store = store.clone();
            let tasks = tasks.clone();
            let addr = addr.clone();
            handles.push(tokio::spawn(async move {
                pool.fetch(&addr, "b~dup", &store, 100 * 1024, &tasks)
                    .await
                    .unwrap()
            }));
        }
        let mut claimed = 0;
        for handle in handles {
            let fetch = handle.await.unwrap();
            assert_eq!(fetch.temp_key, "~~tmp~b~dup~1");
            if fetch.claimed {
                claimed += 1;
            }
        }
        // Exactly one fetch owned the write; all ended with the same file
        assert_eq!(claimed, 1);
        assert_eq!(
            std::fs::read(store.entry_path("~~tmp~b~dup~1")).unwrap(),
            b"shared artifact"
        );
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let addr = spawn_peer(b"abc".to_vec(), None).await;

        let pool = PeerPool::new();
        let tasks = TaskTracker::new();
        pool.fetch(&addr, "b~k1", &store, 1024, &tasks).await.unwrap();
        pool.fetch(&addr, "b~k2", &store, 1024, &tasks).await.unwrap();
        assert_eq!(pool.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_background_failure_surfaces_at_join() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let payload = vec![3u8; 200 * 1024];
        let addr = spawn_peer(payload, Some(1024)).await;

        let pool = PeerPool::new();
        let tasks = TaskTracker::new();
        // Above the threshold the call returns before the peer hangs up
        let fetch = pool
            .fetch(&addr, "b~lost", &store, 100 * 1024, &tasks)
            .await
            .unwrap();
        assert!(fetch.claimed);
        // The truncated transfer is not swallowed: the join reports it
        let err = tasks.join_all().await.unwrap_err();
        assert!(matches!(err, Error::PeerConnection(_)));
    }

    #[tokio::test]
    async fn test_truncated_transfer_is_fatal() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let payload = vec![7u8; 4096];
        let addr = spawn_peer(payload, Some(100)).await;

        let pool = PeerPool::new();
        let tasks = TaskTracker::new();
        let err = pool
            .fetch(&addr, "b~cut", &store, 100 * 1024, &tasks)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerConnection(_)));
    }
}
