//! Live progress for running jobs.
//!
//! The tracker keeps the latest event per job for status queries and fans
//! every event out on a broadcast channel for live observers. Events are
//! published by a single task per job in the order the engine emitted them.
//! Progress is not persisted; only terminal job state reaches the log.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

/// Capacity of the live feed; slow subscribers observe `Lagged` beyond this.
const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub files_processed: u64,
    pub bytes_transferred: u64,
    pub percent: Option<f64>,
    pub current_file: Option<String>,
}

#[derive(Clone)]
pub struct ProgressTracker {
    latest: Arc<RwLock<HashMap<String, ProgressEvent>>>,
    feed: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            latest: Arc::new(RwLock::new(HashMap::new())),
            feed,
        }
    }

    /// Record an event and forward it to subscribers.
    pub async fn publish(&self, event: ProgressEvent) {
        self.latest
            .write()
            .await
            .insert(event.job_id.clone(), event.clone());
        // No subscribers is fine
        let _ = self.feed.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.feed.subscribe()
    }

    pub async fn get(&self, job_id: &str) -> Option<ProgressEvent> {
        self.latest.read().await.get(job_id).cloned()
    }

    /// Drop a job's entry once it reaches a terminal state.
    pub async fn remove(&self, job_id: &str) {
        self.latest.write().await.remove(job_id);
    }

    pub async fn get_all(&self) -> HashMap<String, ProgressEvent> {
        self.latest.read().await.clone()
    }

    pub async fn active_count(&self) -> usize {
        self.latest.read().await.len()
    }
}
