//! Per-project serialization of quota check-and-insert.
//!
//! The quota is the project's `max_parallelism` counted over instances in
//! an active status. The count lives in the database, so the check and the
//! write that follows must not interleave with another creation for the
//! same project. [`ProjectLocks`] hands out one async mutex per project.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::trace;

/// Held while a quota-affecting write for one project is in flight.
pub struct QuotaGuard {
    _guard: OwnedMutexGuard<()>,
}

/// One lock per project, created on first use.
#[derive(Default)]
pub struct ProjectLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `project_id`'s quota.
    pub async fn acquire(&self, project_id: &str) -> QuotaGuard {
        let existing = self.locks.read().await.get(project_id).cloned();
        let lock = match existing {
            Some(lock) => lock,
            None => Arc::clone(
                self.locks
                    .write()
                    .await
                    .entry(project_id.to_string())
                    .or_default(),
            ),
        };
        trace!(project_id, "Waiting for project quota lock");
        QuotaGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of projects that have been locked at least once.
    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_project_is_exclusive() {
        let locks = Arc::new(ProjectLocks::new());
        let guard = locks.acquire("p1").await;

        let contender = Arc::clone(&locks);
        let waiting = tokio::spawn(async move {
            let _guard = contender.acquire("p1").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_projects_do_not_block() {
        let locks = ProjectLocks::new();
        let _a = locks.acquire("p1").await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.acquire("p2"))
            .await
            .unwrap();
        assert_eq!(locks.len().await, 2);
    }
}
