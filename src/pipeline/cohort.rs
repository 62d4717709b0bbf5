//! Per-cohort mutual exclusion
//!
//! A cohort is a `(show_id, season_number)` pair: the unit the detector
//! clusters over (spec §4.4). Only one detection pass may run per cohort
//! at a time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

pub type CohortKey = (Uuid, i32);

/// Lazily-created per-cohort async mutexes, keyed by `(show_id, season_number)`.
#[derive(Clone, Default)]
pub struct CohortLocks {
    locks: Arc<Mutex<HashMap<CohortKey, Arc<AsyncMutex<()>>>>>,
}

impl CohortLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: CohortKey) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Acquire a single cohort's lock.
    pub async fn lock(&self, show_id: Uuid, season_number: i32) -> tokio::sync::OwnedMutexGuard<()> {
        self.entry((show_id, season_number)).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_same_cohort() {
        let locks = CohortLocks::new();
        let show_id = Uuid::new_v4();

        let _g1 = locks.lock(show_id, 1).await;
        let attempt = tokio::time::timeout(std::time::Duration::from_millis(20), locks.lock(show_id, 1)).await;
        assert!(attempt.is_err(), "second lock on same cohort should block");
    }

    #[tokio::test]
    async fn different_cohorts_dont_block() {
        let locks = CohortLocks::new();
        let show_id = Uuid::new_v4();

        let _g1 = locks.lock(show_id, 1).await;
        let attempt = tokio::time::timeout(std::time::Duration::from_millis(20), locks.lock(show_id, 2)).await;
        assert!(attempt.is_ok(), "different cohort should not block");
    }
}
