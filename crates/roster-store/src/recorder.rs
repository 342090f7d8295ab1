//! Attendance Recorder: append-only persistence of admitted events.

use crate::store::{Store, StoreError};
use async_trait::async_trait;
use roster_core::{AttendanceEvent, AttendanceMethod, Clock};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Pause before the single retry of a failed insert.
pub const INSERT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Append-only destination for admitted events.
#[async_trait]
pub trait AttendanceSink: Send + Sync {
    async fn insert_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError>;
}

#[async_trait]
impl AttendanceSink for Store {
    async fn insert_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        Store::insert_attendance(self, event).await
    }
}

/// Writes one event per call. Deduplication belongs to the cooldown gate,
/// so two calls for the same identity produce two rows.
#[derive(Clone)]
pub struct AttendanceRecorder {
    sink: Arc<dyn AttendanceSink>,
    clock: Arc<dyn Clock>,
    retry_backoff: Duration,
}

impl AttendanceRecorder {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self::with_sink(Arc::new(store), clock)
    }

    pub fn with_sink(sink: Arc<dyn AttendanceSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sink,
            clock,
            retry_backoff: INSERT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Persist one event. A failed insert is retried once after the backoff;
    /// the second failure is returned.
    pub async fn record(
        &self,
        identity_id: i64,
        camera_id: &str,
        confidence: f32,
        method: AttendanceMethod,
    ) -> Result<AttendanceEvent, StoreError> {
        let event = AttendanceEvent {
            id: Uuid::new_v4(),
            identity_id,
            camera_id: camera_id.to_string(),
            method,
            confidence,
            timestamp: self.clock.now(),
        };
        if let Err(e) = self.sink.insert_attendance(&event).await {
            tracing::warn!(identity_id, error = %e, "attendance insert failed; retrying once");
            tokio::time::sleep(self.retry_backoff).await;
            self.sink.insert_attendance(&event).await?;
        }
        tracing::info!(
            identity_id,
            camera = %event.camera_id,
            confidence = event.confidence,
            method = event.method.as_str(),
            "attendance recorded"
        );
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewIdentity;
    use chrono::{TimeZone, Utc};
    use roster_core::{Embedding, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` inserts, then writes through to the store.
    struct FlakySink {
        store: Store,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AttendanceSink for FlakySink {
        async fn insert_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Io(std::io::Error::other("disk I/O error")));
            }
            self.store.insert_attendance(event).await
        }
    }

    async fn flaky_recorder(failures: usize) -> (AttendanceRecorder, Arc<FlakySink>, Store, i64, ManualClock) {
        let store = Store::open_in_memory().await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());
        let identity = store
            .enroll_identity(
                NewIdentity {
                    name: "Bob".into(),
                    external_id: None,
                    role: "staff".into(),
                },
                &Embedding::new(vec![1.0]),
                clock.now(),
            )
            .await
            .unwrap();
        let sink = Arc::new(FlakySink {
            store: store.clone(),
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        });
        let recorder = AttendanceRecorder::with_sink(sink.clone(), Arc::new(clock.clone()))
            .with_retry_backoff(Duration::from_millis(10));
        (recorder, sink, store, identity.id, clock)
    }

    #[tokio::test]
    async fn test_single_insert_failure_is_retried() {
        let (recorder, sink, store, identity_id, clock) = flaky_recorder(1).await;
        let event = recorder
            .record(identity_id, "dock", 0.9, AttendanceMethod::FaceBio)
            .await
            .unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(event.timestamp, clock.now());
        assert_eq!(store.count_attendance_on(event.date()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_insert_failure_is_surfaced() {
        let (recorder, sink, store, identity_id, clock) = flaky_recorder(2).await;
        let err = recorder
            .record(identity_id, "dock", 0.9, AttendanceMethod::FaceBio)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        let day = clock.now().date_naive();
        assert_eq!(store.count_attendance_on(day).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_records_every_call_without_dedup() {
        let store = Store::open_in_memory().await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());
        let identity = store
            .enroll_identity(
                NewIdentity {
                    name: "Alice".into(),
                    external_id: None,
                    role: "staff".into(),
                },
                &Embedding::new(vec![1.0]),
                clock.now(),
            )
            .await
            .unwrap();
        let recorder = AttendanceRecorder::new(store.clone(), Arc::new(clock.clone()));

        let first = recorder
            .record(identity.id, "gate-1", 0.97, AttendanceMethod::FaceBio)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(5));
        let second = recorder
            .record(identity.id, "gate-1", 0.95, AttendanceMethod::FaceBio)
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.timestamp - first.timestamp, chrono::Duration::seconds(5));
        assert_eq!(store.count_attendance_on(first.date()).await.unwrap(), 2);
    }
}
