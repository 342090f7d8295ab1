//! Recognition pipeline: Matcher → Cooldown Gate → Recorder, plus enrollment.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use roster_cache::{CacheError, CooldownGate};
use roster_core::{
    AttendanceEvent, AttendanceMethod, Clock, Embedding, EmbeddingError, Gallery, Identity, MatchError, NoMatchReason,
};
use roster_store::{AttendanceRecorder, NewIdentity, Store, StoreError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(EmbeddingError),

    #[error("cooldown cache unavailable: {0}")]
    CacheUnavailable(#[from] CacheError),

    #[error("face already enrolled (similarity {similarity:.3})")]
    DuplicateFace { identity_id: Option<i64>, similarity: f32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("matched identity {0} is missing from the store")]
    DanglingIdentity(i64),
}

/// Outcome of one recognition submission.
#[derive(Debug, Clone)]
pub enum Recognition {
    Admitted {
        identity: Identity,
        event: AttendanceEvent,
    },
    CooledDown {
        identity: Identity,
        similarity: f32,
    },
    Unknown {
        reason: NoMatchReason,
        best: Option<f32>,
    },
}

pub struct Pipeline {
    gallery: RwLock<Gallery>,
    gate: CooldownGate,
    recorder: AttendanceRecorder,
    store: Store,
    clock: Arc<dyn Clock>,
    threshold: f32,
    /// Serializes enrollment so two submissions of one face cannot both pass
    /// the duplicate check.
    enrolling: tokio::sync::Mutex<()>,
}

impl Pipeline {
    pub fn new(gallery: Gallery, gate: CooldownGate, store: Store, clock: Arc<dyn Clock>, threshold: f32) -> Self {
        Self {
            gallery: RwLock::new(gallery),
            gate,
            recorder: AttendanceRecorder::new(store.clone(), clock.clone()),
            store,
            clock,
            threshold,
            enrolling: tokio::sync::Mutex::new(()),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn gallery_len(&self) -> usize {
        self.gallery.read().len()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Load every stored embedding into the in-memory gallery.
    pub async fn load_gallery(&self) -> Result<usize, PipelineError> {
        let rows = self.store.load_embeddings().await?;
        let mut gallery = self.gallery.write();
        let mut loaded = 0;
        for (identity_id, embedding) in rows {
            match gallery.enroll(identity_id, &embedding) {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!(identity_id, error = %e, "skipping stored embedding"),
            }
        }
        tracing::info!(embeddings = loaded, graph = gallery.uses_graph(), "gallery loaded");
        Ok(loaded)
    }

    fn check(&self, embedding: &Embedding) -> Result<(), PipelineError> {
        let dim = self.gallery.read().config().dim;
        embedding.validate(dim).map_err(PipelineError::InvalidEmbedding)
    }

    async fn identity(&self, identity_id: i64) -> Result<Identity, PipelineError> {
        self.store
            .identity(identity_id)
            .await?
            .ok_or(PipelineError::DanglingIdentity(identity_id))
    }

    /// Match, gate and record one submission from an edge camera.
    pub async fn identify(&self, embedding: &Embedding, camera_id: &str) -> Result<Recognition, PipelineError> {
        let found = self.gallery.read().best_match(embedding, self.threshold);
        let matched = match found {
            Ok(m) => m,
            Err(MatchError::InvalidEmbedding(e)) => return Err(PipelineError::InvalidEmbedding(e)),
            Err(MatchError::NoMatch { reason, best }) => {
                tracing::debug!(camera = camera_id, %reason, ?best, "unrecognised face");
                return Ok(Recognition::Unknown { reason, best });
            }
        };

        let identity = self.identity(matched.identity_id).await?;
        if !self.gate.admit(matched.identity_id).await? {
            tracing::debug!(identity_id = identity.id, camera = camera_id, "within cooldown; ignored");
            return Ok(Recognition::CooledDown {
                identity,
                similarity: matched.similarity,
            });
        }

        let event = match self
            .recorder
            .record(identity.id, camera_id, matched.similarity, AttendanceMethod::FaceBio)
            .await
        {
            Ok(event) => event,
            Err(e) => {
                // The gate already holds a cooldown key, so later sightings in
                // the window are ignored until it expires.
                tracing::error!(
                    identity_id = identity.id,
                    camera = camera_id,
                    error = %e,
                    "cooldown set but attendance not recorded"
                );
                return Err(e.into());
            }
        };
        Ok(Recognition::Admitted { identity, event })
    }

    /// Enroll a new identity unless the face or the external id is already known.
    pub async fn enroll(&self, new: NewIdentity, embedding: &Embedding) -> Result<Identity, PipelineError> {
        self.check(embedding)?;
        let _guard = self.enrolling.lock().await;

        let existing = self.gallery.read().best_match(embedding, self.threshold);
        match existing {
            Ok(m) => {
                return Err(PipelineError::DuplicateFace {
                    identity_id: Some(m.identity_id),
                    similarity: m.similarity,
                })
            }
            // Two enrolled identities both above threshold: still a known face.
            Err(MatchError::NoMatch {
                reason: NoMatchReason::Ambiguous,
                best: Some(best),
            }) => {
                return Err(PipelineError::DuplicateFace {
                    identity_id: None,
                    similarity: best,
                })
            }
            Err(_) => {}
        }

        let identity = self.store.enroll_identity(new, embedding, self.clock.now()).await?;
        self.gallery
            .write()
            .enroll(identity.id, embedding)
            .map_err(|e| match e {
                MatchError::InvalidEmbedding(e) => PipelineError::InvalidEmbedding(e),
                MatchError::NoMatch { .. } => PipelineError::DanglingIdentity(identity.id),
            })?;
        Ok(identity)
    }

    /// Attach another embedding to an enrolled identity.
    pub async fn add_embedding(&self, identity_id: i64, embedding: &Embedding) -> Result<Identity, PipelineError> {
        self.check(embedding)?;
        let identity = self.identity(identity_id).await.map_err(|e| match e {
            PipelineError::DanglingIdentity(id) => PipelineError::Store(StoreError::IdentityNotFound(id)),
            other => other,
        })?;
        self.store.add_embedding(identity_id, embedding).await?;
        if let Err(e) = self.gallery.write().enroll(identity_id, embedding) {
            tracing::warn!(identity_id, error = %e, "stored embedding not added to gallery");
        }
        tracing::info!(identity_id, "embedding added");
        Ok(identity)
    }
}
