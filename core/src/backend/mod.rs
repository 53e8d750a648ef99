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

//! Storage backends behind the [`DualBackendStore`](crate::store::DualBackendStore).
//!
//! Every backend speaks the same key/blob protocol: a logical key (see
//! [`keys`]) maps to one JSON value. Each call returns an explicit
//! `Result` so the store can decide whether to demote or fall back.

mod file;
mod memory;
mod postgres;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// Logical keys persisted by the core.
pub mod keys {
    pub const SOURCES: &str = "sources";
    pub const CURRENT_INDEX: &str = "current_index";
    pub const WATCHED: &str = "watched_videos";
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Primary backend unavailable: {0}")]
    PrimaryUnavailable(String),
    #[error("Secondary backend unavailable at {path}: {source}")]
    SecondaryUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt data for '{key}': {reason}")]
    CorruptData { key: String, reason: String },
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        BackendError::PrimaryUnavailable(err.to_string())
    }
}

impl BackendError {
    pub fn corrupt(key: &str, reason: impl ToString) -> Self {
        BackendError::CorruptData {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Reads the blob stored under `key`. `Ok(None)` means never written.
    async fn read(&self, key: &str) -> Result<Option<Value>, BackendError>;

    /// Replaces the blob stored under `key`.
    async fn write(&self, key: &str, value: &Value) -> Result<(), BackendError>;

    /// Cheap reachability check. Backends that are always local succeed.
    async fn probe(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
