//! Process-wide progress fan-out
//!
//! One broadcaster per process, mirroring the teacher's torrent/cast
//! broadcast-channel services: producers publish, consumers subscribe
//! and get a fresh `Receiver`; a slow consumer drops the oldest events
//! rather than blocking a producer (spec §4.6).

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

/// One stage's identity, carried on every `ProgressEvent` so consumers
/// never need to blend percentages across stages (spec §9, Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    EpisodeProcessor,
    AudioExtractor,
    Fingerprinter,
    Detector,
    Trimmer,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub episode_file_id: Uuid,
    pub file_path: String,
    pub stage: Stage,
    pub percent: f32,
    pub fps: Option<f32>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Emitted by the cleanup service when a job is removed (spec §4.7 step 4).
#[derive(Debug, Clone, Serialize)]
pub struct JobDeletedEvent {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BroadcastMessage {
    #[serde(rename = "ffmpeg-progress")]
    FfmpegProgress(ProgressEvent),
    JobDeleted(JobDeletedEvent),
}

#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }

    pub fn publish_progress(&self, event: ProgressEvent) {
        let _ = self.sender.send(BroadcastMessage::FfmpegProgress(event));
    }

    pub fn publish_job_deleted(&self, job_id: Uuid) {
        let _ = self.sender.send(BroadcastMessage::JobDeleted(JobDeletedEvent { job_id }));
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest_without_blocking_publish() {
        let broadcaster = ProgressBroadcaster::new(2);
        let mut rx = broadcaster.subscribe();

        for i in 0..5 {
            broadcaster.publish_job_deleted(Uuid::nil());
            let _ = i;
        }

        // The channel holds only the last `capacity` messages; the
        // publishes above never blocked even though nobody was reading.
        let received = rx.recv().await;
        assert!(received.is_ok() || matches!(received, Err(broadcast::error::RecvError::Lagged(_))));
    }
}
