//! Lease-based resource locking.
//!
//! A lease, not a consensus lock: safety depends on the TTL being well above
//! the interval at which the holder calls [`LockManager::extend`].

use crate::config::LockRetryPolicy;
use crate::errors::NovelflowError;
use crate::persistence::{DistributedLock, LockTable};
use crate::utils::{generate_id, now_unix_ms};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Acquires, extends and releases leases on behalf of one owner.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<dyn LockTable>,
    owner_id: String,
    allow_reentry: bool,
}

impl LockManager {
    /// Creates a manager with a freshly generated owner id.
    pub fn new(table: Arc<dyn LockTable>) -> Self {
        Self {
            table,
            owner_id: generate_id(),
            allow_reentry: false,
        }
    }

    /// Uses a fixed owner id.
    #[must_use]
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// Treats a live lock already owned by this manager as acquired.
    #[must_use]
    pub fn with_reentry(mut self, allow: bool) -> Self {
        self.allow_reentry = allow;
        self
    }

    /// Owner id written into every lease.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Tries to lease `resource_id`.
    ///
    /// Returns `Ok(None)` once `policy.max_attempts` attempts found the
    /// resource held by another owner.
    pub async fn acquire(
        &self,
        resource_id: &str,
        ttl: Duration,
        policy: &LockRetryPolicy,
    ) -> Result<Option<DistributedLock>, NovelflowError> {
        let ttl_ms = duration_ms(ttl);
        let attempts = policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            let now = now_unix_ms();
            let reaped = self.table.delete_expired(now).await.map_err(lock_error)?;
            if reaped > 0 {
                debug!(reaped, "Reaped expired locks");
            }

            let lock = DistributedLock::new(resource_id, &self.owner_id, now, ttl_ms);
            if self.table.insert_if_absent(&lock).await.map_err(lock_error)? {
                debug!(resource_id, owner_id = %self.owner_id, ttl_ms, "Lock acquired");
                return Ok(Some(lock));
            }

            if self.allow_reentry {
                if let Some(existing) = self.table.get(resource_id).await.map_err(lock_error)? {
                    if existing.owner_id == self.owner_id {
                        let expires_at_ms = now.saturating_add(ttl_ms);
                        if self
                            .table
                            .update_expiry_if_owner(resource_id, &self.owner_id, expires_at_ms)
                            .await
                            .map_err(lock_error)?
                        {
                            warn!(resource_id, owner_id = %self.owner_id, "Re-entered lock already held by this owner");
                            return Ok(Some(DistributedLock {
                                expires_at_ms,
                                ..existing
                            }));
                        }
                    }
                }
            }

            if attempt < attempts {
                debug!(resource_id, attempt, "Lock busy, retrying");
                tokio::time::sleep(Duration::from_millis(policy.delay_ms)).await;
            }
        }

        debug!(resource_id, attempts, "Lock acquisition failed");
        Ok(None)
    }

    /// Pushes the expiry of a lease this manager owns. `false` means the lease is gone.
    pub async fn extend(&self, resource_id: &str, ttl: Duration) -> Result<bool, NovelflowError> {
        let expires_at_ms = now_unix_ms().saturating_add(duration_ms(ttl));
        let extended = self
            .table
            .update_expiry_if_owner(resource_id, &self.owner_id, expires_at_ms)
            .await
            .map_err(lock_error)?;
        if !extended {
            debug!(resource_id, owner_id = %self.owner_id, "Lock extension refused");
        }
        Ok(extended)
    }

    /// Releases a lease this manager owns.
    pub async fn release(&self, resource_id: &str) -> Result<bool, NovelflowError> {
        let released = self
            .table
            .delete_if_owner(resource_id, &self.owner_id)
            .await
            .map_err(lock_error)?;
        debug!(resource_id, released, "Lock released");
        Ok(released)
    }

    /// Whether a live lease exists for `resource_id`, whoever owns it.
    pub async fn is_locked(&self, resource_id: &str) -> Result<bool, NovelflowError> {
        let row = self.table.get(resource_id).await.map_err(lock_error)?;
        Ok(row.is_some_and(|lock| !lock.is_expired(now_unix_ms())))
    }

    /// Deletes every expired lease.
    pub async fn cleanup_expired(&self) -> Result<usize, NovelflowError> {
        self.table
            .delete_expired(now_unix_ms())
            .await
            .map_err(lock_error)
    }

    /// Runs `f` while holding the lease, releasing it afterwards.
    ///
    /// Returns `Ok(None)` without running `f` if the lease could not be taken.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource_id: &str,
        ttl: Duration,
        policy: &LockRetryPolicy,
        f: F,
    ) -> Result<Option<T>, NovelflowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.acquire(resource_id, ttl, policy).await?.is_none() {
            return Ok(None);
        }

        let value = f().await;

        if let Err(e) = self.release(resource_id).await {
            warn!(resource_id, error = %e, "Failed to release lock");
        }
        Ok(Some(value))
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("owner_id", &self.owner_id)
            .field("allow_reentry", &self.allow_reentry)
            .finish_non_exhaustive()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn lock_error(e: crate::errors::PersistenceError) -> NovelflowError {
    NovelflowError::Lock(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryLockTable;

    fn managers() -> (LockManager, LockManager) {
        let table = Arc::new(InMemoryLockTable::new());
        (
            LockManager::new(table.clone()).with_owner_id("a"),
            LockManager::new(table).with_owner_id("b"),
        )
    }

    #[tokio::test]
    async fn test_second_owner_is_refused() {
        let (a, b) = managers();
        let ttl = Duration::from_secs(10);
        let policy = LockRetryPolicy::fail_fast();

        assert!(a.acquire("pipeline:chapter:c1", ttl, &policy).await.unwrap().is_some());
        assert!(b.acquire("pipeline:chapter:c1", ttl, &policy).await.unwrap().is_none());
        assert!(b.is_locked("pipeline:chapter:c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let (a, b) = managers();
        let policy = LockRetryPolicy::fail_fast();

        assert!(a
            .acquire("r", Duration::from_millis(100), &policy)
            .await
            .unwrap()
            .is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let lock = b.acquire("r", Duration::from_millis(100), &policy).await.unwrap();
        assert_eq!(lock.map(|l| l.owner_id), Some("b".to_string()));
        assert!(!a.extend("r", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_waits_for_release() {
        let (a, b) = managers();
        let ttl = Duration::from_secs(10);
        a.acquire("r", ttl, &LockRetryPolicy::fail_fast()).await.unwrap();

        let releaser = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.release("r").await.unwrap();
        });

        let policy = LockRetryPolicy::default().with_max_attempts(10).with_delay_ms(20);
        assert!(b.acquire("r", ttl, &policy).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reentry_is_opt_in() {
        let table = Arc::new(InMemoryLockTable::new());
        let strict = LockManager::new(table.clone()).with_owner_id("a");
        let reentrant = LockManager::new(table).with_owner_id("a").with_reentry(true);
        let ttl = Duration::from_secs(10);
        let policy = LockRetryPolicy::fail_fast();

        assert!(strict.acquire("r", ttl, &policy).await.unwrap().is_some());
        assert!(strict.acquire("r", ttl, &policy).await.unwrap().is_none());
        assert!(reentrant.acquire("r", ttl, &policy).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_checks_owner() {
        let (a, b) = managers();
        a.acquire("r", Duration::from_secs(10), &LockRetryPolicy::fail_fast())
            .await
            .unwrap();

        assert!(!b.release("r").await.unwrap());
        assert!(a.release("r").await.unwrap());
        assert!(!a.is_locked("r").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_releases() {
        let (a, b) = managers();
        let policy = LockRetryPolicy::fail_fast();

        let value = a
            .with_lock("r", Duration::from_secs(10), &policy, || async { 42 })
            .await
            .unwrap();
        assert_eq!(value, Some(42));
        assert!(b
            .acquire("r", Duration::from_secs(10), &policy)
            .await
            .unwrap()
            .is_some());

        let refused = a
            .with_lock("r", Duration::from_secs(10), &policy, || async { 7 })
            .await
            .unwrap();
        assert_eq!(refused, None);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (a, _) = managers();
        a.acquire("r1", Duration::from_millis(1), &LockRetryPolicy::fail_fast())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.cleanup_expired().await.unwrap(), 1);
    }
}
