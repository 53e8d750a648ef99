//! PostgreSQL backend over the `sources`, `app_state` and `watched_videos`
//! tables. The schema is created by the migration tool, not here.

use super::{keys, Backend, BackendError};
use crate::models::{Source, WatchedSnapshot};
use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::types::Json;
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

/// `app_state` row holding the selected source index.
const CURRENT_INDEX_STATE_KEY: &str = "current_source_index";
const SOURCES_WRITTEN_STATE_KEY: &str = "sources_written";

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Builds a lazily-connecting pool. No connection is attempted until the
    /// first query, so an unreachable server surfaces as a failed call
    /// instead of a failed startup. Must be called inside a Tokio runtime.
    pub fn connect_lazy(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let mut options = PgConnectOptions::from_str(url).map_err(|e| {
            BackendError::PrimaryUnavailable(format!("invalid database url: {}", e))
        })?;

        if requires_tls(options.get_host()) {
            options = options.ssl_mode(PgSslMode::Require);
        }

        info!(
            "Using PostgreSQL at {}:{} (pool size {})",
            options.get_host(),
            options.get_port(),
            max_connections
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    async fn read_sources(&self) -> Result<Option<Value>, BackendError> {
        let rows = sqlx::query(
            "SELECT type, name, uri, source_type FROM sources ORDER BY created_at, uri",
        )
        .fetch_all(&self.pool)
        .await?;

        let written = rows.is_empty()
            && self.read_app_state(SOURCES_WRITTEN_STATE_KEY).await?.is_some();

        let mut sources = Vec::with_capacity(rows.len());
        for row in rows {
            sources.push(json!({
                "type": row.try_get::<String, _>("type")?,
                "name": row.try_get::<String, _>("name")?,
                "uri": row.try_get::<String, _>("uri")?,
                "source_type": row.try_get::<String, _>("source_type")?,
            }));
        }
        Ok(sources_blob(sources, written))
    }

    async fn write_sources(&self, value: &Value) -> Result<(), BackendError> {
        let items = value
            .as_array()
            .ok_or_else(|| BackendError::corrupt(keys::SOURCES, "expected an array"))?;

        let mut kinds = Vec::with_capacity(items.len());
        let mut names = Vec::with_capacity(items.len());
        let mut uris = Vec::with_capacity(items.len());
        let mut categories = Vec::with_capacity(items.len());
        for item in items {
            let source: Source = serde_json::from_value(item.clone())
                .map_err(|e| BackendError::corrupt(keys::SOURCES, e))?;
            kinds.push(source.kind.as_str().to_string());
            names.push(source.name);
            uris.push(source.uri);
            categories.push(source.category.as_str().to_string());
        }

        // created_at carries list order; ordinality spaces rows 1ms apart.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sources")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO sources (id, type, name, uri, source_type, created_at, updated_at) \
             SELECT gen_random_uuid(), t.kind, t.name, t.uri, t.category, \
                    now() + (t.ord * interval '1 millisecond'), now() \
             FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[]) \
                  WITH ORDINALITY AS t(kind, name, uri, category, ord)",
        )
        .bind(kinds)
        .bind(names)
        .bind(uris)
        .bind(categories)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO app_state (key, value, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(SOURCES_WRITTEN_STATE_KEY)
        .bind(Json(json!(true)))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("Replaced {} sources in database", items.len());
        Ok(())
    }

    async fn read_watched(&self) -> Result<Option<Value>, BackendError> {
        let rows = sqlx::query("SELECT video_id FROM watched_videos ORDER BY video_id")
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let watched = rows
            .iter()
            .map(|row| row.try_get::<String, _>("video_id"))
            .collect::<Result<Vec<_>, _>>()?;
        let value = serde_json::to_value(WatchedSnapshot { watched })
            .map_err(|e| BackendError::corrupt(keys::WATCHED, e))?;
        Ok(Some(value))
    }

    async fn write_watched(&self, value: &Value) -> Result<(), BackendError> {
        let snapshot: WatchedSnapshot = serde_json::from_value(value.clone())
            .map_err(|e| BackendError::corrupt(keys::WATCHED, e))?;

        if snapshot.watched.is_empty() {
            return Ok(());
        }

        // Upsert only: rows already present keep their original watched_at.
        let result = sqlx::query(
            "INSERT INTO watched_videos (id, video_id, watched_at) \
             SELECT gen_random_uuid(), t.video_id, now() \
             FROM UNNEST($1::text[]) AS t(video_id) \
             ON CONFLICT (video_id) DO NOTHING",
        )
        .bind(&snapshot.watched)
        .execute(&self.pool)
        .await?;

        debug!(
            "Upserted watched ids ({} new, {} total in memory)",
            result.rows_affected(),
            snapshot.watched.len()
        );
        Ok(())
    }

    async fn read_app_state(&self, key: &str) -> Result<Option<Value>, BackendError> {
        let row = sqlx::query("SELECT value FROM app_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<Json<Value>, _>("value")?.0)),
            None => Ok(None),
        }
    }

    async fn write_app_state(&self, key: &str, value: &Value) -> Result<(), BackendError> {
        sqlx::query(
            "INSERT INTO app_state (key, value, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(Json(value))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, BackendError> {
        match key {
            keys::SOURCES => self.read_sources().await,
            keys::WATCHED => self.read_watched().await,
            other => self.read_app_state(app_state_key(other)).await,
        }
    }

    async fn write(&self, key: &str, value: &Value) -> Result<(), BackendError> {
        match key {
            keys::SOURCES => self.write_sources(value).await,
            keys::WATCHED => self.write_watched(value).await,
            other => self.write_app_state(app_state_key(other), value).await,
        }
    }

    async fn probe(&self) -> Result<(), BackendError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// An empty `sources` table only counts as a stored (empty) list once it
/// has been written through this backend; before that the key is absent.
fn sources_blob(rows: Vec<Value>, written: bool) -> Option<Value> {
    if rows.is_empty() && !written {
        None
    } else {
        Some(Value::Array(rows))
    }
}

/// Maps a logical key to its `app_state` row.
fn app_state_key(key: &str) -> &str {
    match key {
        keys::CURRENT_INDEX => CURRENT_INDEX_STATE_KEY,
        other => other,
    }
}

/// Hosted Supabase instances only accept TLS connections.
fn requires_tls(host: &str) -> bool {
    host.ends_with("supabase.co") || host.ends_with("pooler.supabase.com")
}
