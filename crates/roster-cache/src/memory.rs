//! In-process cache. Atomic under its own mutex; expiry follows the injected clock.

use crate::backend::{BackendKind, CacheBackend, CacheError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use roster_core::Clock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Entry count above which expired keys are swept on write.
const SWEEP_THRESHOLD: usize = 4096;

pub struct MemoryCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys that have not yet expired.
    pub fn live_entries(&self) -> usize {
        let now = self.clock.now();
        self.entries.lock().values().filter(|exp| **exp > now).count()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn try_admit(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::Protocol(format!("ttl out of range: {e}")))?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(expiry) = entries.get(key) {
            if *expiry > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), now + ttl);

        if entries.len() > SWEEP_THRESHOLD {
            entries.retain(|_, exp| *exp > now);
        }
        Ok(true)
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
