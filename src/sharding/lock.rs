//! Cluster-wide migration lock, one holder per namespace.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::Namespace;

/// Current holder of a namespace lock.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub lock_id: Uuid,
    pub holder: String,
    pub why: String,
    pub acquired_at: Instant,
}

/// Migration locks shared by every shard of a cluster.
///
/// Acquisition never queues: a held lock fails the caller immediately with
/// [`Error::LockContention`].
#[derive(Debug, Default)]
pub struct DistLockManager {
    locks: DashMap<Namespace, LockInfo>,
}

impl DistLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lock for `ns` on behalf of `who`.
    pub fn try_lock(self: &Arc<Self>, ns: &Namespace, who: &str, why: &str) -> Result<DistLockGuard> {
        match self.locks.entry(ns.clone()) {
            Entry::Occupied(held) => {
                let info = held.get();
                tracing::debug!(ns = %ns, holder = %info.holder, requester = who, "migration lock busy");
                Err(Error::LockContention {
                    ns: ns.clone(),
                    holder: info.holder.clone(),
                    why: info.why.clone(),
                })
            }
            Entry::Vacant(slot) => {
                let lock_id = Uuid::new_v4();
                slot.insert(LockInfo {
                    lock_id,
                    holder: who.to_string(),
                    why: why.to_string(),
                    acquired_at: Instant::now(),
                });
                tracing::debug!(ns = %ns, holder = who, why, %lock_id, "migration lock acquired");
                Ok(DistLockGuard {
                    manager: self.clone(),
                    ns: ns.clone(),
                    lock_id,
                })
            }
        }
    }

    /// Current holder of the lock for `ns`.
    pub fn holder(&self, ns: &Namespace) -> Option<LockInfo> {
        self.locks.get(ns).map(|info| info.clone())
    }

    /// Release the lock for `ns` regardless of holder. Returns whether it was held.
    pub fn force_unlock(&self, ns: &Namespace) -> bool {
        let released = self.locks.remove(ns);
        if let Some((_, info)) = &released {
            tracing::warn!(ns = %ns, holder = %info.holder, "migration lock forcibly released");
        }
        released.is_some()
    }

    fn unlock(&self, ns: &Namespace, lock_id: Uuid) {
        if self
            .locks
            .remove_if(ns, |_, info| info.lock_id == lock_id)
            .is_some()
        {
            tracing::debug!(ns = %ns, %lock_id, "migration lock released");
        }
    }
}

/// Holds a namespace lock until dropped.
#[derive(Debug)]
pub struct DistLockGuard {
    manager: Arc<DistLockManager>,
    ns: Namespace,
    lock_id: Uuid,
}

impl DistLockGuard {
    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn lock_id(&self) -> Uuid {
        self.lock_id
    }
}

impl Drop for DistLockGuard {
    fn drop(&mut self) {
        self.manager.unlock(&self.ns, self.lock_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_fails_fast() {
        let locks = DistLockManager::new();
        let ns = Namespace::new("foo.bar");
        let guard = locks.try_lock(&ns, "shard0000", "migrating chunk").unwrap();

        let err = locks.try_lock(&ns, "shard0001", "migrating chunk").unwrap_err();
        match err {
            Error::LockContention { holder, .. } => assert_eq!(holder, "shard0000"),
            other => panic!("unexpected error: {other}"),
        }

        // Other namespaces are independent.
        let _other = locks.try_lock(&Namespace::new("foo.baz"), "shard0001", "x").unwrap();

        drop(guard);
        assert!(locks.holder(&ns).is_none());
        assert!(locks.try_lock(&ns, "shard0001", "migrating chunk").is_ok());
    }

    #[test]
    fn test_stale_guard_does_not_release_new_holder() {
        let locks = DistLockManager::new();
        let ns = Namespace::new("foo.bar");
        let stale = locks.try_lock(&ns, "a", "x").unwrap();
        assert!(locks.force_unlock(&ns));

        let _fresh = locks.try_lock(&ns, "b", "y").unwrap();
        drop(stale);
        assert_eq!(locks.holder(&ns).unwrap().holder, "b");
    }
}
