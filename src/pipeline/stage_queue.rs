//! Work-queue plumbing for pipeline stages
//!
//! Generalizes the bounded-concurrency job queue into a `Broker` trait
//! with explicit ack and visibility-timeout redelivery, so a stage that
//! panics or crashes mid-flight doesn't silently drop the item it was
//! holding (spec §4, "Queue semantics").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

/// A delivered item plus the handle needed to ack it.
pub struct Delivery<T> {
    pub receipt: Uuid,
    pub item: T,
}

/// Minimal message-broker surface a stage needs: push work, pull it back
/// with a visibility timeout, and ack once it's durably handled. Mirrors
/// Redis-stream semantics (`XADD`/`XREADGROUP`/`XACK`) without requiring
/// an actual Redis — the in-process implementation below satisfies it
/// for a single-binary deployment.
#[async_trait]
pub trait Broker<T: Send + 'static>: Send + Sync {
    async fn push(&self, item: T);
    async fn pull(&self) -> Option<Delivery<T>>;
    async fn ack(&self, receipt: Uuid);
    /// Re-deliver unacked items whose visibility timeout elapsed. Called
    /// periodically by the orchestrator's sweep loop.
    async fn sweep_expired(&self);
}

struct InFlight<T> {
    item: T,
    expires_at: tokio::time::Instant,
}

/// An in-process `Broker` backed by an mpsc channel plus an in-flight
/// table for visibility-timeout tracking. Items must be `Clone` since a
/// copy is kept in the in-flight table for redelivery while the original
/// is handed to the caller. Bounded by `capacity`; callers that need
/// cross-process durability should swap this for a real queue behind the
/// same trait.
pub struct InProcessBroker<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
    in_flight: SyncMutex<HashMap<Uuid, InFlight<T>>>,
    visibility_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl<T: Send + Clone + 'static> InProcessBroker<T> {
    pub fn new(capacity: usize, max_concurrent: usize, visibility_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            in_flight: SyncMutex::new(HashMap::new()),
            visibility_timeout,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }
}

#[async_trait]
impl<T: Send + Clone + 'static> Broker<T> for InProcessBroker<T> {
    async fn push(&self, item: T) {
        if self.sender.send(item).await.is_err() {
            warn!("broker receiver dropped, item discarded");
        }
    }

    async fn pull(&self) -> Option<Delivery<T>> {
        let item = self.receiver.lock().await.recv().await?;

        let receipt = Uuid::new_v4();
        let expires_at = tokio::time::Instant::now() + self.visibility_timeout;
        self.in_flight.lock().insert(receipt, InFlight { item: item.clone(), expires_at });

        Some(Delivery { receipt, item })
    }

    async fn ack(&self, receipt: Uuid) {
        self.in_flight.lock().remove(&receipt);
        debug!(receipt = %receipt, "broker item acked");
    }

    async fn sweep_expired(&self) {
        let now = tokio::time::Instant::now();
        let expired: Vec<Uuid> =
            self.in_flight.lock().iter().filter(|(_, f)| f.expires_at <= now).map(|(id, _)| *id).collect();

        for id in expired {
            let entry = self.in_flight.lock().remove(&id);
            if let Some(entry) = entry {
                warn!(receipt = %id, "visibility timeout elapsed, redelivering");
                let _ = self.sender.send(entry.item).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_pull_ack_roundtrip() {
        let broker: InProcessBroker<u32> = InProcessBroker::new(10, 2, Duration::from_secs(30));
        broker.push(42).await;

        let delivery = broker.pull().await.expect("item delivered");
        assert_eq!(delivery.item, 42);
        broker.ack(delivery.receipt).await;

        broker.sweep_expired().await;
        assert!(broker.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn expired_delivery_is_redelivered() {
        let broker: InProcessBroker<u32> = InProcessBroker::new(10, 2, Duration::from_millis(1));
        broker.push(7).await;
        let _delivery = broker.pull().await.expect("item delivered");

        tokio::time::sleep(Duration::from_millis(5)).await;
        broker.sweep_expired().await;

        let redelivered = broker.pull().await.expect("item redelivered");
        assert_eq!(redelivered.item, 7);
    }
}
