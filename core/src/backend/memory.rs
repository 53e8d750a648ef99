use super::{Backend, BackendError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// In-process backend with an availability switch.
///
/// Stands in for the database when it is not reachable from tests or when a
/// host wants to run without persistence. While switched off, every call
/// fails with [`BackendError::PrimaryUnavailable`].
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Value>>,
    available: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// A backend that refuses every call until switched on.
    #[must_use]
    pub fn unavailable() -> Self {
        let backend = Self::new();
        backend.set_available(false);
        backend
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Current value for `key`, bypassing the availability switch.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Seeds a value, bypassing the availability switch.
    pub fn insert(&self, key: &str, value: Value) {
        self.lock().insert(key.to_string(), value);
    }

    /// Number of read attempts, including refused ones.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of write attempts, including refused ones.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BackendError::PrimaryUnavailable(
                "memory backend switched off".to_string(),
            ))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, value: &Value) -> Result<(), BackendError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.insert(key, value.clone());
        Ok(())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        self.check_available()
    }
}
