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

//! The persistence façade shared by the registry and the watched tracker.
//!
//! [`DualBackendStore`] tries the primary backend first and falls back to
//! the secondary on any failure. A failed primary call demotes the store to
//! [`BackendState::PrimaryUnavailable`] for the rest of the process (or
//! until [`DualBackendStore::reprobe`]), so a dead database costs one
//! timeout instead of one per mutation. Nothing here returns an error:
//! absence and failure both read as "no persisted state".

use crate::backend::{Backend, BackendError, FileBackend, PostgresBackend};
use crate::config::StoreConfig;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Availability of the primary backend as last observed by one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unknown,
    PrimaryAvailable,
    PrimaryUnavailable,
}

impl BackendState {
    fn as_u8(self) -> u8 {
        match self {
            BackendState::Unknown => 0,
            BackendState::PrimaryAvailable => 1,
            BackendState::PrimaryUnavailable => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BackendState::PrimaryAvailable,
            2 => BackendState::PrimaryUnavailable,
            _ => BackendState::Unknown,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendState::Unknown => "unknown",
            BackendState::PrimaryAvailable => "primary available",
            BackendState::PrimaryUnavailable => "primary unavailable (file fallback)",
        };
        f.write_str(label)
    }
}

/// Where a saved blob ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Primary,
    Secondary,
    /// Both backends failed; only the in-memory copy holds the value.
    Nowhere,
}

pub struct DualBackendStore {
    primary: Option<Arc<dyn Backend>>,
    secondary: Arc<dyn Backend>,
    state: AtomicU8,
    primary_timeout: Duration,
    mirror_writes: bool,
}

impl DualBackendStore {
    pub fn new(primary: Option<Arc<dyn Backend>>, secondary: Arc<dyn Backend>) -> Self {
        let initial = if primary.is_some() {
            BackendState::Unknown
        } else {
            BackendState::PrimaryUnavailable
        };

        Self {
            primary,
            secondary,
            state: AtomicU8::new(initial.as_u8()),
            primary_timeout: Duration::from_secs(5),
            mirror_writes: false,
        }
    }

    pub fn file_only(secondary: Arc<dyn Backend>) -> Self {
        Self::new(None, secondary)
    }

    pub fn with_primary_timeout(mut self, timeout: Duration) -> Self {
        self.primary_timeout = timeout;
        self
    }

    pub fn with_mirror_writes(mut self, mirror_writes: bool) -> Self {
        self.mirror_writes = mirror_writes;
        self
    }

    /// Builds the PostgreSQL + file store described by `config`.
    ///
    /// A missing or malformed database URL yields a file-only store. Must be
    /// called from within a Tokio runtime (the pool is created lazily).
    pub fn open(config: &StoreConfig) -> Self {
        let secondary: Arc<dyn Backend> = Arc::new(FileBackend::new(&config.data_dir));

        let primary: Option<Arc<dyn Backend>> = match config.database_url.as_deref() {
            Some(url) => match PostgresBackend::connect_lazy(
                url,
                config.max_connections,
                config.primary_timeout(),
            ) {
                Ok(pg) => Some(Arc::new(pg) as Arc<dyn Backend>),
                Err(e) => {
                    error!("Database disabled, using files only: {}", e);
                    None
                }
            },
            None => {
                info!("No database configured, using files only");
                None
            }
        };

        Self::new(primary, secondary)
            .with_primary_timeout(config.primary_timeout())
            .with_mirror_writes(config.mirror_writes)
    }

    pub fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Reads `key`, preferring the primary. `None` means "use defaults".
    pub async fn load(&self, key: &str) -> Option<Value> {
        if let Some(primary) = self.active_primary() {
            match tokio::time::timeout(self.primary_timeout, primary.read(key)).await {
                Ok(Ok(Some(value))) => {
                    self.mark_available();
                    debug!("Loaded '{}' from {}", key, primary.name());
                    return Some(value);
                }
                Ok(Ok(None)) => {
                    self.mark_available();
                    debug!("'{}' not in {}, checking {}", key, primary.name(), self.secondary.name());
                }
                Ok(Err(e @ BackendError::CorruptData { .. })) => {
                    self.mark_available();
                    error!("Ignoring '{}' from {}: {}", key, primary.name(), e);
                }
                Ok(Err(e)) => self.demote("load", key, &e),
                Err(_) => self.demote("load", key, &self.timed_out(self.primary_timeout)),
            }
        }

        match self.secondary.read(key).await {
            Ok(Some(value)) => {
                debug!("Loaded '{}' from {}", key, self.secondary.name());
                Some(value)
            }
            Ok(None) => None,
            Err(e @ BackendError::CorruptData { .. }) => {
                error!("Ignoring persisted '{}': {}", key, e);
                None
            }
            Err(e) => {
                warn!("Could not read '{}' from {}: {}", key, self.secondary.name(), e);
                None
            }
        }
    }

    /// Writes `key` with the configured primary timeout.
    pub async fn save(&self, key: &str, value: &Value) -> Persisted {
        self.save_within(key, value, self.primary_timeout).await
    }

    /// Writes `key`, giving the primary at most `limit` before falling
    /// through to the secondary.
    pub async fn save_within(&self, key: &str, value: &Value, limit: Duration) -> Persisted {
        if let Some(primary) = self.active_primary() {
            match tokio::time::timeout(limit, primary.write(key, value)).await {
                Ok(Ok(())) => {
                    self.mark_available();
                    debug!("Saved '{}' to {}", key, primary.name());
                    if self.mirror_writes {
                        self.write_secondary(key, value).await;
                    }
                    return Persisted::Primary;
                }
                Ok(Err(e @ BackendError::CorruptData { .. })) => {
                    error!("{} rejected '{}', writing it to {}: {}", primary.name(), key, self.secondary.name(), e);
                }
                Ok(Err(e)) => self.demote("save", key, &e),
                Err(_) => self.demote("save", key, &self.timed_out(limit)),
            }
        }

        if self.write_secondary(key, value).await {
            Persisted::Secondary
        } else {
            Persisted::Nowhere
        }
    }

    /// Checks the primary again and resets the state from the outcome.
    /// Meant for natural checkpoints, never called automatically.
    pub async fn reprobe(&self) -> BackendState {
        let Some(primary) = self.primary.as_ref() else {
            return self.state();
        };

        match tokio::time::timeout(self.primary_timeout, primary.probe()).await {
            Ok(Ok(())) => {
                if self.state() != BackendState::PrimaryAvailable {
                    info!("Primary backend {} is reachable", primary.name());
                }
                self.mark_available();
            }
            Ok(Err(e)) => self.demote("probe", "-", &e),
            Err(_) => self.demote("probe", "-", &self.timed_out(self.primary_timeout)),
        }
        self.state()
    }

    fn active_primary(&self) -> Option<&Arc<dyn Backend>> {
        match self.state() {
            BackendState::PrimaryUnavailable => None,
            _ => self.primary.as_ref(),
        }
    }

    async fn write_secondary(&self, key: &str, value: &Value) -> bool {
        match self.secondary.write(key, value).await {
            Ok(()) => {
                debug!("Saved '{}' to {}", key, self.secondary.name());
                true
            }
            Err(e) => {
                error!(
                    "Failed to persist '{}' to {}, keeping it in memory only: {}",
                    key,
                    self.secondary.name(),
                    e
                );
                false
            }
        }
    }

    fn mark_available(&self) {
        self.state
            .store(BackendState::PrimaryAvailable.as_u8(), Ordering::SeqCst);
    }

    fn demote(&self, operation: &str, key: &str, err: &BackendError) {
        let previous = BackendState::from_u8(
            self.state
                .swap(BackendState::PrimaryUnavailable.as_u8(), Ordering::SeqCst),
        );

        if previous == BackendState::PrimaryUnavailable {
            debug!("Primary {} of '{}' failed again: {}", operation, key, err);
        } else {
            warn!(
                "Primary backend failed during {} of '{}', switching to {}: {}",
                operation,
                key,
                self.secondary.name(),
                err
            );
        }
    }

    fn timed_out(&self, limit: Duration) -> BackendError {
        BackendError::PrimaryUnavailable(format!("timed out after {:?}", limit))
    }
}
