use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected cache reply: {0}")]
    Protocol(String),
    #[error("cache not configured: {0}")]
    NotConfigured(String),
}

/// Which concrete strategy a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Networked cache service reached over HTTPS.
    Remote,
    /// Cache instance on this host, reached over TCP.
    Local,
    /// Process-local map; no sharing across daemons.
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Remote => "remote",
            BackendKind::Local => "local",
            BackendKind::Memory => "memory",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability set every cache strategy provides.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Atomically create `key` with a time-to-live of `ttl` if it does not
    /// already exist. Returns `true` when this call created it.
    async fn try_admit(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Cheap round-trip proving the backend is reachable.
    async fn health_check(&self) -> Result<(), CacheError>;
}

/// TTL in whole milliseconds, never zero.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
