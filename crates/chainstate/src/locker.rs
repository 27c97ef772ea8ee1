//! Single-writer chain lock with pending-key tracking.
//!
//! All mutating chain operations serialize on the inner mutex. Keyed
//! lock attempts additionally register the block hash being processed
//! so a concurrent submission of the same hash fails fast instead of
//! queueing behind the first.

use std::collections::HashSet;
use std::sync::Mutex as StdMutex;

use bitcoind_consensus::{Hash256, VerifyError};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct Locker {
    mutex: Mutex<()>,
    pending: StdMutex<HashSet<Hash256>>,
}

#[derive(Debug)]
pub struct LockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    _token: PendingToken<'a>,
}

#[derive(Debug)]
struct PendingToken<'a> {
    key: Option<Hash256>,
    pending: &'a StdMutex<HashSet<Hash256>>,
}

impl Drop for PendingToken<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&key);
            }
        }
    }
}

impl Locker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the chain lock. With a key, the key is registered as
    /// pending before waiting; a duplicate key errors immediately.
    pub async fn lock(&self, key: Option<Hash256>) -> Result<LockGuard<'_>, VerifyError> {
        if let Some(key) = key {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| VerifyError::duplicate("duplicate", 0))?;
            if !pending.insert(key) {
                return Err(VerifyError::duplicate("duplicate", 0));
            }
        }
        let token = PendingToken {
            key,
            pending: &self.pending,
        };
        let guard = self.mutex.lock().await;
        Ok(LockGuard {
            _guard: guard,
            _token: token,
        })
    }

    pub fn has_pending(&self, hash: &Hash256) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.contains(hash))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_key_fails_fast() {
        let locker = Locker::new();
        let guard = locker.lock(Some([1u8; 32])).await.expect("first lock");
        assert!(locker.has_pending(&[1u8; 32]));
        let err = locker.lock(Some([1u8; 32])).await.expect_err("duplicate");
        assert_eq!(err.reason, "duplicate");
        drop(guard);
        assert!(!locker.has_pending(&[1u8; 32]));
        locker.lock(Some([1u8; 32])).await.expect("after release");
    }

    #[tokio::test]
    async fn distinct_keys_queue() {
        let locker = Locker::new();
        let guard = locker.lock(Some([1u8; 32])).await.expect("first lock");
        // A second key registers as pending immediately even though the
        // mutex is held.
        let pending = locker.lock(Some([2u8; 32]));
        tokio::pin!(pending);
        assert!(futures_poll_once(&mut pending).await.is_none());
        assert!(locker.has_pending(&[2u8; 32]));
        drop(guard);
        pending.await.expect("acquired after release");
    }

    async fn futures_poll_once<F: std::future::Future + Unpin>(future: &mut F) -> Option<F::Output> {
        use std::task::Poll;
        std::future::poll_fn(|cx| {
            let pinned = std::pin::Pin::new(&mut *future);
            match pinned.poll(cx) {
                Poll::Ready(output) => Poll::Ready(Some(output)),
                Poll::Pending => Poll::Ready(None),
            }
        })
        .await
    }
}
