//! CPU/GPU concurrency governor
//!
//! Two resizable semaphore-backed pools bound how many stage workers may
//! be running a subprocess concurrently (spec §5). Resizing takes effect
//! on the next pickup; in-flight permits already acquired are honored to
//! completion. Setting a pool's limit to 0 pauses it — `acquire` simply
//! never returns a permit until the limit is raised again.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A single resizable pool. Resizing is implemented by forget/add: growing
/// adds permits, shrinking forgets outstanding ones (so the pool drains
/// down to the new size as in-flight permits are released) — the same
/// technique `tokio::sync::Semaphore` documents for dynamic resize.
pub struct Pool {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
}

impl Pool {
    fn new(limit: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(limit)), limit: AtomicUsize::new(limit) }
    }

    /// Acquire a permit, suspending the worker until one is available.
    /// Paused pools (limit 0) never yield a permit.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore.clone().acquire_owned().await.expect("pool semaphore never closed")
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn resize(&self, new_limit: usize) {
        let old_limit = self.limit.swap(new_limit, Ordering::Relaxed);
        if new_limit > old_limit {
            self.semaphore.add_permits(new_limit - old_limit);
        } else if new_limit < old_limit {
            let to_remove = old_limit - new_limit;
            // forget_permits blocks until it can remove `to_remove` permits;
            // since we only call this from a synchronous settings update we
            // use try_acquire in a loop instead so shrink never blocks the
            // caller on in-flight work.
            for _ in 0..to_remove {
                if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                    permit.forget();
                }
            }
        }
    }

    pub fn pause(&self) {
        self.resize(0);
    }
}

/// The CPU and GPU pools shared across all stage workers, sized from
/// `Config::cpu_worker_limit`/`gpu_worker_limit` (spec §5). Stages 2-4
/// acquire from `cpu`; stage 5 acquires from `gpu` when the trim uses a
/// GPU-accelerated encoder, else from `cpu`.
#[derive(Clone)]
pub struct WorkerPools {
    pub cpu: Arc<Pool>,
    pub gpu: Arc<Pool>,
}

impl WorkerPools {
    pub fn new(cpu_limit: usize, gpu_limit: usize) -> Self {
        Self { cpu: Arc::new(Pool::new(cpu_limit)), gpu: Arc::new(Pool::new(gpu_limit)) }
    }

    pub fn pause_all(&self) -> (usize, usize) {
        let prev = (self.cpu.limit(), self.gpu.limit());
        self.cpu.pause();
        self.gpu.pause();
        prev
    }

    pub fn resume(&self, limits: (usize, usize)) {
        self.cpu.resize(limits.0);
        self.gpu.resize(limits.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resize_up_admits_more_concurrent_permits() {
        let pool = Pool::new(1);
        let _p1 = pool.acquire().await;
        pool.resize(2);
        let _p2 = pool.acquire().await;
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn pause_blocks_new_pickups() {
        let pool = Pool::new(1);
        pool.pause();
        let attempt = tokio::time::timeout(std::time::Duration::from_millis(20), pool.acquire()).await;
        assert!(attempt.is_err());
    }

    #[tokio::test]
    async fn pause_all_and_resume_restores_previous_limits() {
        let pools = WorkerPools::new(2, 1);
        let prev = pools.pause_all();
        assert_eq!(pools.cpu.limit(), 0);
        pools.resume(prev);
        assert_eq!(pools.cpu.limit(), 2);
        assert_eq!(pools.gpu.limit(), 1);
    }
}
