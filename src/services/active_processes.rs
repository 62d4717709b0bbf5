//! Process-wide table of in-flight FFmpeg/fingerprint subprocesses
//!
//! Backs `GET /processing/active-ffmpeg` and cleanup's "kill by known PID"
//! step (spec §4.7, §9 "Global mutable state" — isolated behind a small
//! service with explicit init/teardown rather than an ambient singleton).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveProcess {
    pub episode_file_id: Uuid,
    pub job_id: Uuid,
    pub pid: u32,
    pub file_path: String,
}

#[derive(Clone, Default)]
pub struct ActiveProcessTable {
    inner: Arc<Mutex<HashMap<Uuid, ActiveProcess>>>,
}

impl ActiveProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, process: ActiveProcess) {
        self.inner.lock().insert(process.job_id, process);
    }

    pub fn unregister(&self, job_id: Uuid) {
        self.inner.lock().remove(&job_id);
    }

    pub fn get(&self, job_id: Uuid) -> Option<ActiveProcess> {
        self.inner.lock().get(&job_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ActiveProcess> {
        self.inner.lock().values().cloned().collect()
    }

    /// Send SIGTERM (via `kill`), used by cancel/cleanup. On non-Unix this
    /// is a no-op; FFmpeg child handling there would use job-level kill
    /// through `tokio::process::Child` instead.
    pub fn terminate(&self, job_id: Uuid) -> bool {
        let Some(process) = self.get(job_id) else { return false };
        #[cfg(unix)]
        unsafe {
            libc_kill(process.pid as i32, 15);
        }
        self.unregister(job_id);
        true
    }
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    unsafe extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    unsafe {
        kill(pid, sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_round_trip() {
        let table = ActiveProcessTable::new();
        let job_id = Uuid::new_v4();
        table.register(ActiveProcess {
            episode_file_id: Uuid::new_v4(),
            job_id,
            pid: std::process::id(),
            file_path: "/tmp/episode.mkv".into(),
        });

        assert!(table.get(job_id).is_some());
        assert_eq!(table.snapshot().len(), 1);
        table.unregister(job_id);
        assert!(table.get(job_id).is_none());
    }
}
