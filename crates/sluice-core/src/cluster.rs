//! # Cluster Locks
//!
//! Named action locks so that exactly one server in a cluster runs a given
//! job at a time. Acquisition is compare-and-set on the lock row; a lock
//! whose holder died is reclaimable once it is older than the stale
//! threshold.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::{Result, SluiceError};

/// Job names used as lock actions.
pub mod actions {
    pub const ROUTE: &str = "route";
    pub const PUSH: &str = "push";
    pub const PULL: &str = "pull";
    pub const PURGE: &str = "purge";
}

/// One lock row.
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub action: String,
    pub holder: Option<String>,
    pub locking_time: Option<DateTime<Utc>>,
    pub last_locking_server: Option<String>,
}

impl LockEntry {
    fn free(action: &str) -> Self {
        Self {
            action: action.to_string(),
            holder: None,
            locking_time: None,
            last_locking_server: None,
        }
    }
}

/// Storage seam for cluster locks. Implementations must make `try_acquire`
/// atomic with respect to concurrent callers.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Compare-and-set acquire: succeeds when the lock is free, already held
    /// by `server_id`, or held by a holder older than `stale_after`.
    async fn try_acquire(&self, action: &str, server_id: &str, stale_after: Duration)
        -> Result<bool>;

    /// Release only when held by `server_id`.
    async fn release(&self, action: &str, server_id: &str) -> Result<bool>;

    /// Free every lock held by this server, for startup after a crash.
    async fn clear_all(&self, server_id: &str) -> Result<u64>;

    async fn find(&self, action: &str) -> Result<Option<LockEntry>>;
}

/// In-memory lock store, correct within one process.
#[derive(Default)]
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        action: &str,
        server_id: &str,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut locks = self.locks.lock();
        let entry = locks
            .entry(action.to_string())
            .or_insert_with(|| LockEntry::free(action));

        let stale_cutoff = Utc::now()
            - ChronoDuration::from_std(stale_after)
                .map_err(|e| SluiceError::lock(format!("stale threshold out of range: {e}")))?;

        let acquirable = match (&entry.holder, entry.locking_time) {
            (None, _) => true,
            (Some(holder), _) if holder == server_id => true,
            (Some(holder), Some(time)) if time < stale_cutoff => {
                warn!(
                    action,
                    stale_holder = %holder,
                    held_since = %time,
                    "taking over stale lock"
                );
                true
            }
            _ => false,
        };
        if acquirable {
            entry.holder = Some(server_id.to_string());
            entry.locking_time = Some(Utc::now());
            entry.last_locking_server = Some(server_id.to_string());
        }
        Ok(acquirable)
    }

    async fn release(&self, action: &str, server_id: &str) -> Result<bool> {
        let mut locks = self.locks.lock();
        match locks.get_mut(action) {
            Some(entry) if entry.holder.as_deref() == Some(server_id) => {
                entry.holder = None;
                entry.locking_time = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_all(&self, server_id: &str) -> Result<u64> {
        let mut locks = self.locks.lock();
        let mut cleared = 0;
        for entry in locks.values_mut() {
            if entry.holder.as_deref() == Some(server_id) {
                entry.holder = None;
                entry.locking_time = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn find(&self, action: &str) -> Result<Option<LockEntry>> {
        Ok(self.locks.lock().get(action).cloned())
    }
}

/// Guarded execution of cluster-wide jobs.
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// Clear locks left behind by a previous incarnation of this server.
    pub async fn startup(&self) -> Result<()> {
        let cleared = self.store.clear_all(&self.config.server_id).await?;
        if cleared > 0 {
            info!(cleared, server = %self.config.server_id, "cleared stale locks from previous run");
        }
        Ok(())
    }

    pub async fn acquire(&self, action: &str) -> Result<bool> {
        self.store
            .try_acquire(action, &self.config.server_id, self.config.lock_timeout)
            .await
    }

    pub async fn release(&self, action: &str) -> Result<()> {
        if !self.store.release(action, &self.config.server_id).await? {
            warn!(action, server = %self.config.server_id, "released a lock this server did not hold");
        }
        Ok(())
    }

    /// Run `work` under the action lock; skip silently when another server
    /// holds it. The lock is released even when `work` fails.
    pub async fn with_lock<F, Fut, T>(&self, action: &str, work: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.acquire(action).await? {
            debug!(action, "lock held elsewhere, skipping");
            return Ok(None);
        }
        let result = work().await;
        self.release(action).await?;
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(store: Arc<dyn LockStore>, server: &str) -> LockCoordinator {
        LockCoordinator::new(
            store,
            LockConfig {
                server_id: server.to_string(),
                lock_timeout: Duration::from_secs(30 * 60),
            },
        )
    }

    #[tokio::test]
    async fn test_exclusive_acquire() {
        let store = Arc::new(InMemoryLockStore::new());
        let a = coordinator(store.clone(), "server-a");
        let b = coordinator(store.clone(), "server-b");

        assert!(a.acquire(actions::ROUTE).await.unwrap());
        assert!(!b.acquire(actions::ROUTE).await.unwrap());
        // reentrant for the holder
        assert!(a.acquire(actions::ROUTE).await.unwrap());

        a.release(actions::ROUTE).await.unwrap();
        assert!(b.acquire(actions::ROUTE).await.unwrap());
    }

    #[tokio::test]
    async fn test_independent_actions() {
        let store = Arc::new(InMemoryLockStore::new());
        let a = coordinator(store.clone(), "server-a");
        let b = coordinator(store.clone(), "server-b");
        assert!(a.acquire(actions::ROUTE).await.unwrap());
        assert!(b.acquire(actions::PUSH).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_lock_takeover() {
        let store = Arc::new(InMemoryLockStore::new());
        store
            .try_acquire(actions::PURGE, "dead-server", Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // zero timeout: anything already held counts as stale
        let taker = LockCoordinator::new(
            store.clone(),
            LockConfig {
                server_id: "server-b".to_string(),
                lock_timeout: Duration::from_secs(0),
            },
        );
        assert!(taker.acquire(actions::PURGE).await.unwrap());
        let entry = store.find(actions::PURGE).await.unwrap().unwrap();
        assert_eq!(entry.holder.as_deref(), Some("server-b"));
    }

    #[tokio::test]
    async fn test_clear_all_on_startup() {
        let store = Arc::new(InMemoryLockStore::new());
        let a = coordinator(store.clone(), "server-a");
        a.acquire(actions::ROUTE).await.unwrap();
        a.acquire(actions::PUSH).await.unwrap();

        // same server restarts
        let restarted = coordinator(store.clone(), "server-a");
        restarted.startup().await.unwrap();
        let b = coordinator(store.clone(), "server-b");
        assert!(b.acquire(actions::ROUTE).await.unwrap());
        assert!(b.acquire(actions::PUSH).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_runs_and_releases() {
        let store = Arc::new(InMemoryLockStore::new());
        let a = coordinator(store.clone(), "server-a");
        let ran = a
            .with_lock(actions::ROUTE, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(ran, Some(42));
        // released afterwards
        let b = coordinator(store, "server-b");
        assert!(b.acquire(actions::ROUTE).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_held() {
        let store = Arc::new(InMemoryLockStore::new());
        let a = coordinator(store.clone(), "server-a");
        let b = coordinator(store.clone(), "server-b");
        a.acquire(actions::ROUTE).await.unwrap();
        let ran = b
            .with_lock(actions::ROUTE, || async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(ran, None);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let store = Arc::new(InMemoryLockStore::new());
        let a = coordinator(store.clone(), "server-a");
        let result: Result<Option<()>> = a
            .with_lock(actions::ROUTE, || async {
                Err(SluiceError::other("job blew up"))
            })
            .await;
        assert!(result.is_err());
        let b = coordinator(store, "server-b");
        assert!(b.acquire(actions::ROUTE).await.unwrap());
    }
}
