//! Cluster-wide root locks keyed by a small integer id.

use std::sync::Arc;

use tracing::debug;

use crate::{
    config::ClusterConfig,
    coordination::CoordinationClient,
    error::{MeshError, MeshResult},
};

/// Handle to an acquired root lock. Consumed by
/// [`RootLocker::unlock_root`], so a released handle cannot be reused.
#[derive(Debug)]
#[must_use = "a root lock stays held until passed to unlock_root"]
pub struct RootLock {
    id: i32,
    path: String,
    holder: String,
    owner: uuid::Uuid,
}

impl RootLock {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[derive(Debug)]
pub struct RootLocker {
    client: Arc<dyn CoordinationClient>,
    config: ClusterConfig,
    owner: uuid::Uuid,
}

impl RootLocker {
    pub fn new(config: &ClusterConfig, client: Arc<dyn CoordinationClient>) -> Self {
        Self {
            client,
            config: config.clone(),
            owner: uuid::Uuid::new_v4(),
        }
    }

    /// Wait until the cluster-wide lock for `id` is granted.
    pub async fn lock_root(&self, id: i32) -> MeshResult<RootLock> {
        let path = self.config.root_lock_path(id);
        let holder = format!("{}:{}", self.client.session_id(), uuid::Uuid::new_v4());
        self.client.lock_acquire(&path, &holder).await?;
        debug!(id, "Acquired root lock");
        Ok(RootLock {
            id,
            path,
            holder,
            owner: self.owner,
        })
    }

    /// Release a lock acquired through this locker. Handles obtained from
    /// another locker, or locks the store no longer attributes to the holder,
    /// are errors.
    pub async fn unlock_root(&self, lock: RootLock) -> MeshResult<()> {
        if lock.owner != self.owner {
            return Err(MeshError::ForeignLock { id: lock.id });
        }
        self.client.lock_release(&lock.path, &lock.holder).await?;
        debug!(id = lock.id, "Released root lock");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{coordination::MemoryCoordinator, error::CoordinationError};

    #[tokio::test]
    async fn test_lock_exclusivity_across_holders() {
        let ensemble = MemoryCoordinator::new();
        let config = ClusterConfig::new(1, "memory");
        let a = Arc::new(RootLocker::new(&config, ensemble.session()));
        let b = Arc::new(RootLocker::new(&config, ensemble.session()));

        let first = a.lock_root(7).await.unwrap();
        let released = Arc::new(AtomicBool::new(false));

        let waiter = {
            let b = b.clone();
            let released = released.clone();
            tokio::spawn(async move {
                let lock = b.lock_root(7).await.unwrap();
                assert!(
                    released.load(Ordering::SeqCst),
                    "second holder granted before the first released"
                );
                b.unlock_root(lock).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        released.store(true, Ordering::SeqCst);
        a.unlock_root(first).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("second holder never granted")
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_ids_do_not_contend() {
        let ensemble = MemoryCoordinator::new();
        let config = ClusterConfig::new(1, "memory");
        let locker = RootLocker::new(&config, ensemble.session());

        let one = locker.lock_root(1).await.unwrap();
        let two = tokio::time::timeout(Duration::from_millis(200), locker.lock_root(2))
            .await
            .expect("independent id blocked")
            .unwrap();
        locker.unlock_root(one).await.unwrap();
        locker.unlock_root(two).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_handle_is_rejected() {
        let ensemble = MemoryCoordinator::new();
        let config = ClusterConfig::new(1, "memory");
        let a = RootLocker::new(&config, ensemble.session());
        let b = RootLocker::new(&config, ensemble.session());

        let lock = a.lock_root(3).await.unwrap();
        assert!(matches!(
            b.unlock_root(lock).await,
            Err(MeshError::ForeignLock { id: 3 })
        ));
        // The lock is still held by a
        assert!(ensemble.lock_holder(&config.root_lock_path(3)).is_some());
    }

    #[tokio::test]
    async fn test_release_after_session_expiry_fails() {
        let ensemble = MemoryCoordinator::new();
        let config = ClusterConfig::new(1, "memory");
        let session = ensemble.session();
        let locker = RootLocker::new(&config, session.clone());

        let lock = locker.lock_root(9).await.unwrap();
        session.close().await;
        assert!(matches!(
            locker.unlock_root(lock).await,
            Err(MeshError::Coordination(CoordinationError::SessionClosed))
        ));
        assert_eq!(ensemble.lock_holder(&config.root_lock_path(9)), None);
    }
}
