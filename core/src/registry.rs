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

use crate::backend::keys;
use crate::models::Source;
use crate::store::DualBackendStore;
use log::{error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No sources available")]
    Empty,
    #[error("Source index {index} out of range ({len} sources)")]
    OutOfRange { index: usize, len: usize },
}

/// Ordered list of sources with a persisted current selection.
///
/// Index changes are saved before the call returns so a restart resumes on
/// the same source. Hosts sharing a registry across tasks should wrap it in
/// a `tokio::sync::Mutex`.
pub struct SourceRegistry {
    store: Arc<DualBackendStore>,
    sources: Vec<Source>,
    current: Option<usize>,
}

impl SourceRegistry {
    /// Loads sources and the saved index. A saved index that no longer fits
    /// the list is clamped into range.
    pub async fn initialize(store: Arc<DualBackendStore>) -> Self {
        let sources = match store.load(keys::SOURCES).await {
            Some(value) => parse_sources(&value),
            None => Vec::new(),
        };
        let saved = match store.load(keys::CURRENT_INDEX).await {
            Some(value) => parse_index(&value),
            None => None,
        };
        let current = restore_index(saved, sources.len());

        info!(
            "SourceRegistry initialized with {} sources (current index: {:?})",
            sources.len(),
            current
        );

        Self {
            store,
            sources,
            current,
        }
    }

    /// Starts from an explicit list without loading anything.
    pub fn with_sources(store: Arc<DualBackendStore>, sources: Vec<Source>) -> Self {
        let current = if sources.is_empty() { None } else { Some(0) };
        Self {
            store,
            sources,
            current,
        }
    }

    pub fn current(&self) -> Option<&Source> {
        self.current.and_then(|i| self.sources.get(i))
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Cycles forward, wrapping to the first source.
    pub async fn next(&mut self) -> Result<&Source, RegistryError> {
        let current = self.current.ok_or(RegistryError::Empty)?;
        let index = (current + 1) % self.sources.len();
        self.move_to(index, "next").await
    }

    /// Cycles backward, wrapping to the last source.
    pub async fn previous(&mut self) -> Result<&Source, RegistryError> {
        let current = self.current.ok_or(RegistryError::Empty)?;
        let len = self.sources.len();
        let index = (current + len - 1) % len;
        self.move_to(index, "previous").await
    }

    pub async fn select(&mut self, index: usize) -> Result<&Source, RegistryError> {
        if self.sources.is_empty() {
            return Err(RegistryError::Empty);
        }
        if index >= self.sources.len() {
            return Err(RegistryError::OutOfRange {
                index,
                len: self.sources.len(),
            });
        }
        self.move_to(index, "selected").await
    }

    pub async fn add_source(&mut self, source: Source) {
        info!("Added source: {}", source.name);
        self.sources.push(source);
        self.persist_sources().await;

        if self.current.is_none() {
            self.current = Some(0);
            self.persist_index().await;
        }
    }

    /// Removes the source at `index`. The selection keeps pointing at the
    /// same source when it survives, and wraps to the first one otherwise.
    pub async fn remove_source(&mut self, index: usize) -> Result<Source, RegistryError> {
        if index >= self.sources.len() {
            return Err(RegistryError::OutOfRange {
                index,
                len: self.sources.len(),
            });
        }

        let removed = self.sources.remove(index);
        let len = self.sources.len();
        self.current = match self.current {
            _ if len == 0 => None,
            Some(current) if index < current => Some(current - 1),
            Some(current) if current >= len => Some(0),
            other => other,
        };
        info!("Removed source: {}", removed.name);

        self.persist_sources().await;
        self.persist_index().await;
        Ok(removed)
    }

    async fn move_to(&mut self, index: usize, direction: &str) -> Result<&Source, RegistryError> {
        self.current = Some(index);
        self.persist_index().await;

        let source = &self.sources[index];
        info!("Cycled to {} source: {} ({})", direction, source.name, source.kind);
        Ok(source)
    }

    async fn persist_index(&self) {
        if let Some(index) = self.current {
            self.store.save(keys::CURRENT_INDEX, &json!(index)).await;
        }
    }

    async fn persist_sources(&self) {
        match serde_json::to_value(&self.sources) {
            Ok(value) => {
                self.store.save(keys::SOURCES, &value).await;
            }
            Err(e) => error!("Could not serialize sources: {}", e),
        }
    }
}

/// Decodes a persisted source list, dropping entries that do not parse.
fn parse_sources(value: &Value) -> Vec<Source> {
    let Some(items) = value.as_array() else {
        error!("Persisted sources are not a list, ignoring them");
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<Source>(item.clone()) {
            Ok(source) => Some(source),
            Err(e) => {
                error!("Skipping invalid source entry {}: {}", item, e);
                None
            }
        })
        .collect()
}

/// Accepts a number or a numeric string (older rows store `"3"`).
fn parse_index(value: &Value) -> Option<i64> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    if parsed.is_none() {
        warn!("Invalid current source index {}, ignoring it", value);
    }
    parsed
}

fn restore_index(saved: Option<i64>, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }

    match saved {
        None => Some(0),
        Some(index) if index < 0 => {
            warn!("Current source index {} is negative, resetting to 0", index);
            Some(0)
        }
        Some(index) if index as u64 >= len as u64 => {
            warn!(
                "Current source index {} out of bounds for {} sources, clamping",
                index, len
            );
            Some(len - 1)
        }
        Some(index) => Some(index as usize),
    }
}
