//! Background transfer task tracking
//!
//! Oversized peer and backing-store transfers run off the calling path.
//! Their handles are tracked here so shutdown can join every in-flight
//! transfer and surface the first transfer failure instead of leaving
//! dangling writes behind.

use parking_lot::Mutex;
use shmcache_common::Result;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Default)]
pub(crate) struct TaskTracker {
    handles: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked background task
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.handles.lock().push(tokio::spawn(fut));
    }

    /// Await every tracked task started so far. All of them are joined
    /// before the first failure among them is returned.
    pub async fn join_all(&self) -> Result<()> {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let mut first_err = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("background transfer failed: {e}");
                    first_err.get_or_insert(e);
                }
                Err(e) => warn!("background transfer task panicked: {e}"),
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmcache_common::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_join_all_waits_for_tasks() {
        let tracker = TaskTracker::new();
        let done = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let done = done.clone();
            tracker.spawn(async move {
                tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        tracker.join_all().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_join_all_surfaces_first_failure() {
        let tracker = TaskTracker::new();
        tracker.spawn(async { Ok(()) });
        tracker.spawn(async { Err(Error::peer("connection closed mid-transfer")) });
        let err = tracker.join_all().await.unwrap_err();
        assert!(matches!(err, Error::PeerConnection(_)));
        // Drained: a second join has nothing left to report
        tracker.join_all().await.unwrap();
    }
}
