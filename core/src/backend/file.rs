use super::{Backend, BackendError};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Local snapshot store: one pretty-printed JSON file per key.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn unavailable(path: &Path, source: std::io::Error) -> BackendError {
        BackendError::SecondaryUnavailable {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, BackendError> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No snapshot for '{}' at {}", key, path.display());
                return Ok(None);
            }
            Err(e) => return Err(Self::unavailable(&path, e)),
        };

        let value = serde_json::from_str(&content).map_err(|e| BackendError::corrupt(key, e))?;
        Ok(Some(value))
    }

    async fn write(&self, key: &str, value: &Value) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::unavailable(&self.dir, e))?;

        let path = self.path_for(key);
        let json = serde_json::to_string_pretty(value).map_err(|e| BackendError::corrupt(key, e))?;

        // Rename over the old snapshot so readers never see a partial file.
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Self::unavailable(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::unavailable(&path, e))?;

        debug!("Wrote snapshot for '{}' to {}", key, path.display());
        Ok(())
    }
}
