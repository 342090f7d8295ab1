//! Cooldown Gate: one admission per identity per window.

use crate::backend::{CacheBackend, CacheError};
use std::sync::Arc;
use std::time::Duration;

const KEY_PREFIX: &str = "cooldown:";
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

pub struct CooldownGate {
    backend: Arc<dyn CacheBackend>,
    window: Duration,
    retry_backoff: Duration,
}

impl CooldownGate {
    pub fn new(backend: Arc<dyn CacheBackend>, window: Duration) -> Self {
        Self {
            backend,
            window,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Admit `identity_id` with the configured window.
    pub async fn admit(&self, identity_id: i64) -> Result<bool, CacheError> {
        self.try_admit(identity_id, self.window).await
    }

    /// Atomically create the cooldown entry for `identity_id` if none is live.
    ///
    /// Returns `Ok(true)` when admitted and `Ok(false)` while cooled down.
    /// A backend failure is retried once after a short backoff; a second
    /// failure surfaces as `CacheError::Unavailable`.
    pub async fn try_admit(&self, identity_id: i64, window: Duration) -> Result<bool, CacheError> {
        let key = cooldown_key(identity_id);
        let first = match self.backend.try_admit(&key, window).await {
            Ok(admitted) => {
                tracing::debug!(identity_id, admitted, "cooldown check");
                return Ok(admitted);
            }
            Err(e) => e,
        };

        tracing::warn!(identity_id, error = %first, "cooldown check failed; retrying once");
        tokio::time::sleep(self.retry_backoff).await;

        match self.backend.try_admit(&key, window).await {
            Ok(admitted) => {
                tracing::debug!(identity_id, admitted, "cooldown check after retry");
                Ok(admitted)
            }
            Err(e) => {
                tracing::error!(identity_id, error = %e, "cooldown backend unavailable");
                Err(match e {
                    CacheError::Unavailable(msg) => CacheError::Unavailable(msg),
                    other => CacheError::Unavailable(other.to_string()),
                })
            }
        }
    }
}

fn cooldown_key(identity_id: i64) -> String {
    format!("{KEY_PREFIX}{identity_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::memory::MemoryCache;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use roster_core::{ManualClock, SystemClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WINDOW: Duration = Duration::from_secs(12 * 3600);

    fn memory_gate() -> (CooldownGate, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());
        let cache = Arc::new(MemoryCache::new(Arc::new(clock.clone())));
        (CooldownGate::new(cache, WINDOW), clock)
    }

    /// Fails the first `failures` calls, then delegates to a memory cache.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        inner: MemoryCache,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                inner: MemoryCache::new(Arc::new(SystemClock)),
            }
        }
    }

    #[async_trait]
    impl CacheBackend for Flaky {
        fn kind(&self) -> BackendKind {
            BackendKind::Remote
        }

        async fn try_admit(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(CacheError::Protocol("connection reset".into()));
            }
            self.inner.try_admit(key, ttl).await
        }

        async fn health_check(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_immediate_second_call_is_rejected() {
        let (gate, _) = memory_gate();
        assert!(gate.admit(7).await.unwrap());
        assert!(!gate.admit(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_admitted_again_after_window() {
        let (gate, clock) = memory_gate();
        assert!(gate.admit(7).await.unwrap());

        clock.advance(chrono::Duration::minutes(1));
        assert!(!gate.admit(7).await.unwrap());

        clock.advance(chrono::Duration::hours(12));
        assert!(gate.admit(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_identities_do_not_share_cooldown() {
        let (gate, _) = memory_gate();
        assert!(gate.admit(1).await.unwrap());
        assert!(gate.admit(2).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_admit_exactly_once() {
        let (gate, _) = memory_gate();
        let gate = Arc::new(gate);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.admit(42).await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_single_failure_is_retried() {
        let backend = Arc::new(Flaky::new(1));
        let gate = CooldownGate::new(backend.clone(), WINDOW).with_retry_backoff(Duration::from_millis(1));

        assert!(gate.admit(3).await.unwrap());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_unavailable() {
        let backend = Arc::new(Flaky::new(usize::MAX));
        let gate = CooldownGate::new(backend.clone(), WINDOW).with_retry_backoff(Duration::from_millis(1));

        assert!(matches!(gate.admit(3).await, Err(CacheError::Unavailable(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_key_format() {
        assert_eq!(cooldown_key(12), "cooldown:12");
    }
}
