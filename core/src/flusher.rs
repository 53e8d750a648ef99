/*
    playstate-rs | Dual-backend persistence for player sources and watch history.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Background flushing for a shared [`WatchedSetTracker`].

use crate::store::Persisted;
use crate::watched::WatchedSetTracker;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A tracker shared between the host and the flusher task. The lock is held
/// across the backend write, so a flush never interleaves with a mark.
pub type SharedTracker = Arc<Mutex<WatchedSetTracker>>;

pub struct FlushHandle {
    tracker: SharedTracker,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Starts a task that checks the tracker's thresholds every
/// `check_interval` and flushes when one is met.
pub fn spawn_flusher(tracker: SharedTracker, check_interval: Duration) -> FlushHandle {
    let (stop, mut stop_rx) = watch::channel(false);
    let task_tracker = tracker.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut tracker = task_tracker.lock().await;
                    if let Some(reason) = tracker.flush_due() {
                        tracker.flush_for(reason).await;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Watched-set flusher stopped");
    });

    FlushHandle {
        tracker,
        stop,
        task,
    }
}

impl FlushHandle {
    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    /// Stops the task and runs the bounded final flush.
    pub async fn shutdown(self) -> Option<Persisted> {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("Watched-set flusher ended abnormally: {}", e);
        }
        self.tracker.lock().await.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{keys, Backend, BackendError, MemoryBackend};
    use crate::config::BatchConfig;
    use crate::store::DualBackendStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Answers reads at once but never finishes a write.
    struct HangingWrites;

    #[async_trait]
    impl Backend for HangingWrites {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn read(&self, _key: &str) -> Result<Option<Value>, BackendError> {
            Ok(None)
        }

        async fn write(&self, _key: &str, _value: &Value) -> Result<(), BackendError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn shared(
        files: Arc<MemoryBackend>,
        flush_count: usize,
        flush_ms: u64,
    ) -> SharedTracker {
        let store = Arc::new(DualBackendStore::file_only(files));
        let config = BatchConfig {
            flush_count,
            flush_ms,
            ..Default::default()
        };
        Arc::new(Mutex::new(WatchedSetTracker::initialize(store, config).await))
    }

    async fn wait_for_write(files: &MemoryBackend) {
        for _ in 0..100 {
            if files.get(keys::WATCHED).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("flusher never wrote the watched set");
    }

    #[tokio::test]
    async fn test_flusher_writes_when_count_reached() {
        let files = Arc::new(MemoryBackend::new());
        let tracker = shared(files.clone(), 2, 60_000).await;
        let handle = spawn_flusher(tracker.clone(), Duration::from_millis(10));

        tracker.lock().await.mark_watched("a");
        tracker.lock().await.mark_watched("b");
        wait_for_write(&files).await;

        assert_eq!(files.get(keys::WATCHED), Some(json!({"watched": ["a", "b"]})));
        assert_eq!(handle.shutdown().await, None);
    }

    #[tokio::test]
    async fn test_flusher_writes_when_batch_ages() {
        let files = Arc::new(MemoryBackend::new());
        let tracker = shared(files.clone(), 100, 20).await;
        let handle = spawn_flusher(tracker.clone(), Duration::from_millis(10));

        tracker.lock().await.mark_watched("a");
        wait_for_write(&files).await;

        assert_eq!(tracker.lock().await.pending_len(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let files = Arc::new(MemoryBackend::new());
        let tracker = shared(files.clone(), 100, 60_000).await;
        let handle = spawn_flusher(tracker.clone(), Duration::from_secs(60));

        tracker.lock().await.mark_watched("late");
        assert_eq!(handle.shutdown().await, Some(Persisted::Secondary));
        assert_eq!(files.get(keys::WATCHED), Some(json!({"watched": ["late"]})));
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_when_primary_hangs() {
        let files = Arc::new(MemoryBackend::new());
        let store = Arc::new(
            DualBackendStore::new(Some(Arc::new(HangingWrites)), files.clone())
                .with_primary_timeout(Duration::from_secs(600)),
        );
        let config = BatchConfig {
            flush_count: 100,
            flush_ms: 600_000,
            shutdown_timeout_ms: 50,
            ..Default::default()
        };
        let tracker = Arc::new(Mutex::new(WatchedSetTracker::initialize(store, config).await));
        let handle = spawn_flusher(tracker.clone(), Duration::from_secs(60));

        tracker.lock().await.mark_watched("last");
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown must not wait for the primary timeout");

        assert_eq!(outcome, Some(Persisted::Secondary));
        assert_eq!(files.get(keys::WATCHED), Some(json!({"watched": ["last"]})));
    }
}
