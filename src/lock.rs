//! Per-transaction mutual exclusion
//!
//! A `TransactionLock` serializes units of work against one logical
//! transaction. Three acquisition policies are offered: fail-fast (busy error
//! when held), skip (silent no-op when held) and timed-wait (busy error
//! carrying the wait-start timestamp when the timeout elapses). The
//! last-accessed stamp is touched before and after the guarded unit of work
//! so callers can run idle-based eviction; the lock is released on every exit
//! path.

use crate::error::{Result, TransactionError};
use crate::transaction_id::TransactionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;

pub struct TransactionLock {
    id: TransactionId,
    inner: tokio::sync::Mutex<()>,
    last_accessed: Mutex<DateTime<Utc>>,
}

impl TransactionLock {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            inner: tokio::sync::Mutex::new(()),
            last_accessed: Mutex::new(Utc::now()),
        }
    }

    /// Non-blocking acquisition; fails immediately with a busy error if the
    /// lock is already held.
    pub async fn run_or_fail<T, F>(&self, action: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.inner.try_lock() {
            Ok(guard) => self.run_locked(guard, action).await,
            Err(_) => Err(TransactionError::Busy(self.id)),
        }
    }

    /// Non-blocking acquisition; logs and returns `None` without running the
    /// action if the lock is already held.
    pub async fn run_or_skip<T, F>(&self, action: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        match self.inner.try_lock() {
            Ok(guard) => self.run_locked(guard, action).await.map(Some),
            Err(_) => {
                tracing::info!(
                    "Cannot execute a new action on transaction '{}' as it is still busy executing a previous action",
                    self.id
                );
                Ok(None)
            }
        }
    }

    /// Blocks up to `timeout`; fails with a busy error carrying the original
    /// acquisition timestamp if the lock is still held afterwards.
    pub async fn run_or_wait<T, F>(&self, timeout: Duration, action: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let since = Utc::now();
        match tokio::time::timeout(timeout, self.inner.lock()).await {
            Ok(guard) => self.run_locked(guard, action).await,
            Err(_) => Err(TransactionError::BusyTimedOut { id: self.id, since }),
        }
    }

    async fn run_locked<T, F>(&self, _guard: tokio::sync::MutexGuard<'_, ()>, action: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.touch();
        let result = action.await;
        self.touch();
        result
    }

    pub fn touch(&self) {
        *self.last_accessed.lock() = Utc::now();
    }

    /// Overwrite the last-accessed stamp. Recovery backdates rebuilt
    /// transactions so idle-based sweeps treat them as already stale.
    pub fn set_last_accessed(&self, stamp: DateTime<Utc>) {
        *self.last_accessed.lock() = stamp;
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        *self.last_accessed.lock()
    }

    /// Whether the transaction has been idle longer than `timeout`.
    pub fn is_idle_longer_than(&self, timeout: Duration) -> bool {
        let idle = Utc::now() - self.last_accessed();
        idle.to_std().map(|idle| idle > timeout).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn lock() -> Arc<TransactionLock> {
        Arc::new(TransactionLock::new(TransactionId::new()))
    }

    #[tokio::test]
    async fn test_fail_fast_when_held() {
        let lock = lock();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = lock.clone();
        let task = tokio::spawn(async move {
            holder
                .run_or_fail(async {
                    started_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    Ok(())
                })
                .await
        });

        started_rx.await.unwrap();
        let result = lock.run_or_fail(async { Ok(()) }).await;
        assert!(matches!(result, Err(TransactionError::Busy(_))));

        release_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        // Released on exit, usable again.
        lock.run_or_fail(async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_skip_when_held() {
        let lock = lock();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = lock.clone();
        let task = tokio::spawn(async move {
            holder
                .run_or_fail(async {
                    started_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    Ok(())
                })
                .await
        });

        started_rx.await.unwrap();
        let skipped = lock.run_or_skip(async { Ok(42) }).await.unwrap();
        assert_eq!(skipped, None);
        release_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        // Not held anymore: the action runs.
        let ran = lock.run_or_skip(async { Ok(42) }).await.unwrap();
        assert_eq!(ran, Some(42));
    }

    #[tokio::test]
    async fn test_timed_wait_reports_wait_start() {
        let lock = lock();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = lock.clone();
        tokio::spawn(async move {
            holder
                .run_or_fail(async {
                    started_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    Ok(())
                })
                .await
        });

        started_rx.await.unwrap();
        let before = Utc::now();
        let result = lock
            .run_or_wait(Duration::from_millis(20), async { Ok(()) })
            .await;
        match result {
            Err(TransactionError::BusyTimedOut { since, .. }) => {
                assert!(since >= before);
            }
            other => panic!("expected BusyTimedOut, got {:?}", other),
        }
        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_timed_wait_acquires_once_released() {
        let lock = lock();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let holder = lock.clone();
        tokio::spawn(async move {
            holder
                .run_or_fail(async {
                    started_tx.send(()).unwrap();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                })
                .await
        });

        started_rx.await.unwrap();
        lock.run_or_wait(Duration::from_secs(5), async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_touches_last_accessed() {
        let lock = lock();
        let stamp = lock.last_accessed();
        tokio::time::sleep(Duration::from_millis(5)).await;
        lock.run_or_fail(async { Ok(()) }).await.unwrap();
        assert!(lock.last_accessed() > stamp);
    }

    #[tokio::test]
    async fn test_error_still_releases() {
        let lock = lock();
        let id = TransactionId::new();
        let result: Result<()> = lock
            .run_or_fail(async { Err(TransactionError::TransactionNotFound(id)) })
            .await;
        assert!(result.is_err());
        lock.run_or_fail(async { Ok(()) }).await.unwrap();
    }
}
