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

pub mod backend;
pub mod config;
pub mod flusher;
pub mod models;
pub mod registry;
pub mod store;
pub mod watched;

// Re-export key items for convenience
pub use backend::{keys, Backend, BackendError, FileBackend, MemoryBackend, PostgresBackend};
pub use config::{BatchConfig, ConfigError, StoreConfig};
pub use flusher::{spawn_flusher, FlushHandle, SharedTracker};
pub use models::{Source, SourceCategory, SourceKind, WatchedSnapshot};
pub use registry::{RegistryError, SourceRegistry};
pub use store::{BackendState, DualBackendStore, Persisted};
pub use watched::{FlushReason, WatchedSetTracker};
