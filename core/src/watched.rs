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

//! Watched-item tracking with batched persistence.
//!
//! Membership checks never touch a backend. New ids collect in a pending
//! batch; a flush writes the whole set as one blob, triggered by the
//! count or age threshold (see [`crate::flusher`]), by an explicit call,
//! or by shutdown.

use crate::backend::keys;
use crate::config::BatchConfig;
use crate::models::WatchedSnapshot;
use crate::store::{DualBackendStore, Persisted};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Pending count reached `flush_count`
    Count,
    /// Oldest pending id older than `flush_ms`
    Time,
    /// Requested by the host
    Manual,
    /// Final flush before exit
    Shutdown,
}

/// Ids marked since the last flush.
#[derive(Debug, Default)]
struct PendingBatch {
    ids: Vec<String>,
    since: Option<Instant>,
    // Set after a failed write; only the time threshold fires until cleared.
    retrying: bool,
}

impl PendingBatch {
    fn push(&mut self, id: String) {
        if self.ids.is_empty() {
            self.since = Some(Instant::now());
        }
        self.ids.push(id);
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn age(&self) -> Duration {
        self.since.map(|t| t.elapsed()).unwrap_or_default()
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.since = None;
        self.retrying = false;
    }

    /// Keeps the ids but restarts the age clock after a failed write.
    fn retry_later(&mut self) {
        self.since = Some(Instant::now());
        self.retrying = true;
    }
}

pub struct WatchedSetTracker {
    store: Arc<DualBackendStore>,
    config: BatchConfig,
    watched: HashSet<String>,
    pending: PendingBatch,
}

impl WatchedSetTracker {
    /// Loads the persisted set in one read.
    pub async fn initialize(store: Arc<DualBackendStore>, config: BatchConfig) -> Self {
        let watched = match store.load(keys::WATCHED).await {
            Some(value) => match serde_json::from_value::<WatchedSnapshot>(value) {
                Ok(snapshot) => snapshot.into_set(),
                Err(e) => {
                    error!("Ignoring malformed watched set: {}", e);
                    HashSet::new()
                }
            },
            None => HashSet::new(),
        };

        info!("WatchedSetTracker initialized (watched: {} items)", watched.len());

        Self {
            store,
            config,
            watched,
            pending: PendingBatch::default(),
        }
    }

    /// Records `id` as watched. Returns [`FlushReason::Count`] when the
    /// pending batch has reached its size threshold; nothing is written here.
    pub fn mark_watched(&mut self, id: impl Into<String>) -> Option<FlushReason> {
        let id = id.into();
        if self.watched.insert(id.clone()) {
            self.pending.push(id);
        }

        if self.count_reached() {
            Some(FlushReason::Count)
        } else {
            None
        }
    }

    pub fn is_watched(&self, id: &str) -> bool {
        self.watched.contains(id)
    }

    /// First candidate that has not been watched yet.
    pub fn first_unwatched<'a, I>(&self, candidates: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates.into_iter().find(|id| !self.is_watched(id))
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Which threshold, if any, says the pending batch should be written.
    pub fn flush_due(&self) -> Option<FlushReason> {
        if self.pending.is_empty() {
            None
        } else if self.count_reached() {
            Some(FlushReason::Count)
        } else if self.pending.age() >= self.config.flush_interval() {
            Some(FlushReason::Time)
        } else {
            None
        }
    }

    fn count_reached(&self) -> bool {
        !self.pending.retrying && self.pending.len() >= self.config.flush_count.max(1)
    }

    /// Writes the whole set if anything is pending.
    pub async fn flush(&mut self) -> Option<Persisted> {
        self.flush_for(FlushReason::Manual).await
    }

    /// Final flush. The primary gets at most `shutdown_timeout` before the
    /// snapshot goes to the file instead.
    pub async fn shutdown(&mut self) -> Option<Persisted> {
        self.flush_for(FlushReason::Shutdown).await
    }

    pub(crate) async fn flush_for(&mut self, reason: FlushReason) -> Option<Persisted> {
        if self.pending.is_empty() {
            return None;
        }

        let value = match serde_json::to_value(WatchedSnapshot::from_set(&self.watched)) {
            Ok(value) => value,
            Err(e) => {
                error!("Could not serialize watched set: {}", e);
                return None;
            }
        };

        let outcome = match reason {
            FlushReason::Shutdown => {
                self.store
                    .save_within(keys::WATCHED, &value, self.config.shutdown_timeout())
                    .await
            }
            _ => self.store.save(keys::WATCHED, &value).await,
        };

        if outcome == Persisted::Nowhere {
            // Nothing durable yet: keep the batch so a later flush or the
            // shutdown flush still writes it.
            warn!(
                "Watched set not persisted ({:?}), keeping {} pending ids",
                reason,
                self.pending.len()
            );
            self.pending.retry_later();
            return Some(outcome);
        }

        debug!(
            "Flushed {} new watched ids ({:?}), {} total, stored: {:?}",
            self.pending.len(),
            reason,
            self.watched.len(),
            outcome
        );
        self.pending.clear();
        Some(outcome)
    }
}

impl Drop for WatchedSetTracker {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                "WatchedSetTracker dropped with {} unflushed ids",
                self.pending.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    fn config(flush_count: usize, flush_ms: u64) -> BatchConfig {
        BatchConfig {
            flush_count,
            flush_ms,
            ..Default::default()
        }
    }

    fn memory_store() -> (Arc<MemoryBackend>, Arc<DualBackendStore>) {
        let files = Arc::new(MemoryBackend::new());
        let store = Arc::new(DualBackendStore::file_only(files.clone()));
        (files, store)
    }

    #[tokio::test]
    async fn test_mark_is_visible_before_flush() {
        let (files, store) = memory_store();
        let mut tracker = WatchedSetTracker::initialize(store, config(10, 60_000)).await;

        assert!(!tracker.is_watched("abc"));
        assert_eq!(tracker.mark_watched("abc"), None);
        assert!(tracker.is_watched("abc"));
        assert_eq!(tracker.pending_len(), 1);
        assert_eq!(files.write_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_marks_are_not_pending_twice() {
        let (_files, store) = memory_store();
        let mut tracker = WatchedSetTracker::initialize(store, config(10, 60_000)).await;

        tracker.mark_watched("abc");
        tracker.mark_watched("abc");
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_count_threshold() {
        let (_files, store) = memory_store();
        let mut tracker = WatchedSetTracker::initialize(store, config(2, 60_000)).await;

        assert_eq!(tracker.mark_watched("a"), None);
        assert_eq!(tracker.flush_due(), None);
        assert_eq!(tracker.mark_watched("b"), Some(FlushReason::Count));
        assert_eq!(tracker.flush_due(), Some(FlushReason::Count));
    }

    #[tokio::test]
    async fn test_time_threshold() {
        let (_files, store) = memory_store();
        let mut tracker = WatchedSetTracker::initialize(store, config(100, 0)).await;

        assert_eq!(tracker.flush_due(), None);
        tracker.mark_watched("a");
        assert_eq!(tracker.flush_due(), Some(FlushReason::Time));
    }

    #[tokio::test]
    async fn test_flush_writes_whole_set_and_clears_pending() {
        let (files, store) = memory_store();
        files.insert(keys::WATCHED, json!({"watched": ["old"]}));
        let mut tracker = WatchedSetTracker::initialize(store, config(10, 60_000)).await;

        tracker.mark_watched("new");
        assert_eq!(tracker.flush().await, Some(Persisted::Secondary));
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(
            files.get(keys::WATCHED),
            Some(json!({"watched": ["new", "old"]}))
        );

        // Nothing pending: no write.
        assert_eq!(tracker.flush().await, None);
        assert_eq!(files.write_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_snapshot_starts_empty() {
        let (files, store) = memory_store();
        files.insert(keys::WATCHED, json!({"watched": "abc"}));

        let tracker = WatchedSetTracker::initialize(store, BatchConfig::default()).await;
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_first_unwatched() {
        let (_files, store) = memory_store();
        let mut tracker = WatchedSetTracker::initialize(store, BatchConfig::default()).await;
        tracker.mark_watched("v1");
        tracker.mark_watched("v2");

        assert_eq!(tracker.first_unwatched(["v1", "v2", "v3", "v4"]), Some("v3"));
        assert_eq!(tracker.first_unwatched(["v1", "v2"]), None);
        tracker.flush().await;
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_pending_until_shutdown() {
        let files = Arc::new(MemoryBackend::unavailable());
        let store = Arc::new(DualBackendStore::file_only(files.clone()));
        let mut tracker =
            WatchedSetTracker::initialize(store.clone(), BatchConfig::default()).await;

        tracker.mark_watched("abc");
        assert_eq!(tracker.flush().await, Some(Persisted::Nowhere));
        assert_eq!(tracker.pending_len(), 1);
        assert!(tracker.is_watched("abc"));

        // Backend back before exit: the shutdown flush still writes the id.
        files.set_available(true);
        assert_eq!(tracker.shutdown().await, Some(Persisted::Secondary));
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(files.get(keys::WATCHED), Some(json!({"watched": ["abc"]})));
        drop(tracker);

        let restarted = WatchedSetTracker::initialize(store, BatchConfig::default()).await;
        assert!(restarted.is_watched("abc"));
    }

    #[tokio::test]
    async fn test_failed_flush_is_carried_by_next_flush() {
        let files = Arc::new(MemoryBackend::unavailable());
        let store = Arc::new(DualBackendStore::file_only(files.clone()));
        let mut tracker = WatchedSetTracker::initialize(store, BatchConfig::default()).await;

        tracker.mark_watched("abc");
        tracker.flush().await;

        files.set_available(true);
        tracker.mark_watched("def");
        assert_eq!(tracker.pending_len(), 2);
        assert_eq!(tracker.flush().await, Some(Persisted::Secondary));
        assert_eq!(files.get(keys::WATCHED), Some(json!({"watched": ["abc", "def"]})));
    }

    #[tokio::test]
    async fn test_failed_count_flush_waits_for_time_threshold() {
        let files = Arc::new(MemoryBackend::unavailable());
        let store = Arc::new(DualBackendStore::file_only(files));
        let mut tracker = WatchedSetTracker::initialize(store, config(1, 60_000)).await;

        assert_eq!(tracker.mark_watched("a"), Some(FlushReason::Count));
        assert_eq!(tracker.flush_for(FlushReason::Count).await, Some(Persisted::Nowhere));

        assert_eq!(tracker.flush_due(), None);
        assert_eq!(tracker.mark_watched("b"), None);
        assert_eq!(tracker.pending_len(), 2);
    }
}
