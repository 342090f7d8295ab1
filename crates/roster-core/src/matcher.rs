//! Identity matching over enrolled embeddings.
//!
//! A [`Gallery`] owns every enrolled embedding together with the identity it
//! belongs to. Small catalogs are searched exactly; once the catalog grows past
//! `exact_limit` the gallery migrates to a navigable-small-world graph. Either
//! way the final decision is taken on exact similarities of the candidates, so
//! the outcome does not depend on which index produced them.

use crate::index::{ExactIndex, Neighbor, NeighborIndex, NswIndex};
use crate::types::{Embedding, EmbeddingError, EMBEDDING_DIM};
use thiserror::Error;

/// Default gap between the best and second-best identity below which a match
/// is considered ambiguous.
pub const DEFAULT_AMBIGUITY_EPSILON: f32 = 0.01;
/// Default catalog size up to which exact search is used.
pub const DEFAULT_EXACT_LIMIT: usize = 1024;
const DEFAULT_CANDIDATES: usize = 32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] EmbeddingError),
    #[error("no match ({reason})")]
    NoMatch { reason: NoMatchReason, best: Option<f32> },
}

/// Why a probe did not resolve to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoMatchReason {
    EmptyGallery,
    BelowThreshold,
    Ambiguous,
}

impl std::fmt::Display for NoMatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NoMatchReason::EmptyGallery => "no enrolled identities",
            NoMatchReason::BelowThreshold => "best similarity below threshold",
            NoMatchReason::Ambiguous => "multiple identities equally similar",
        };
        f.write_str(s)
    }
}

/// A resolved identity and the similarity of its closest embedding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentityMatch {
    pub identity_id: i64,
    pub similarity: f32,
}

/// Tunables for a [`Gallery`].
#[derive(Debug, Clone, Copy)]
pub struct MatcherConfig {
    pub dim: usize,
    pub ambiguity_epsilon: f32,
    pub exact_limit: usize,
    /// Initial number of candidate embeddings pulled from the index per query.
    pub candidates: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            dim: EMBEDDING_DIM,
            ambiguity_epsilon: DEFAULT_AMBIGUITY_EPSILON,
            exact_limit: DEFAULT_EXACT_LIMIT,
            candidates: DEFAULT_CANDIDATES,
        }
    }
}

/// Enrolled embeddings plus the index used to search them.
pub struct Gallery {
    config: MatcherConfig,
    index: Box<dyn NeighborIndex>,
    /// Identity id per index slot.
    owners: Vec<i64>,
}

impl Gallery {
    pub fn new(config: MatcherConfig) -> Self {
        Self {
            config,
            index: Box::new(ExactIndex::new()),
            owners: Vec::new(),
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Number of enrolled embeddings.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Whether queries currently go through the graph index.
    pub fn uses_graph(&self) -> bool {
        self.owners.len() > self.config.exact_limit
    }

    fn check(&self, embedding: &Embedding) -> Result<(), MatchError> {
        embedding.validate(self.config.dim)?;
        Ok(())
    }

    /// Add an embedding for `identity_id`.
    pub fn enroll(&mut self, identity_id: i64, embedding: &Embedding) -> Result<(), MatchError> {
        self.check(embedding)?;
        self.index.insert(embedding.normalized());
        self.owners.push(identity_id);

        if self.owners.len() == self.config.exact_limit + 1 {
            tracing::info!(
                embeddings = self.owners.len(),
                "catalog exceeded exact search limit; building graph index"
            );
            let graph = NswIndex::from_vectors(self.index.vectors().iter().cloned());
            self.index = Box::new(graph);
        }
        Ok(())
    }

    /// Resolve `probe` to the single best identity.
    ///
    /// Fails with `InvalidEmbedding` on a dimension mismatch or a vector with
    /// non-finite values or zero length, and with
    /// `NoMatch` when the best identity is below `threshold` or when another
    /// identity is within `ambiguity_epsilon` of it.
    pub fn best_match(&self, probe: &Embedding, threshold: f32) -> Result<IdentityMatch, MatchError> {
        self.check(probe)?;
        if self.is_empty() {
            return Err(MatchError::NoMatch {
                reason: NoMatchReason::EmptyGallery,
                best: None,
            });
        }

        let probe = probe.normalized();
        let epsilon = self.config.ambiguity_epsilon;
        let mut k = self.config.candidates.max(1);

        loop {
            let hits = self.index.search(&probe, k);
            let (top, runner_up) = self.rank_identities(&hits);
            let Some(top) = top else {
                return Err(MatchError::NoMatch {
                    reason: NoMatchReason::EmptyGallery,
                    best: None,
                });
            };

            // Every candidate belonged to the top identity. A competing
            // identity may still sit just past the candidate window.
            let exhausted = hits.len() < k || k >= self.len();
            if runner_up.is_none() && !exhausted {
                let last = hits.last().map(|h| h.similarity).unwrap_or(f32::NEG_INFINITY);
                if top.similarity - last < epsilon {
                    k = (k * 2).min(self.len());
                    continue;
                }
            }

            if top.similarity < threshold {
                tracing::debug!(best = top.similarity, threshold, "no match: below threshold");
                return Err(MatchError::NoMatch {
                    reason: NoMatchReason::BelowThreshold,
                    best: Some(top.similarity),
                });
            }

            if let Some(second) = runner_up {
                if top.similarity - second.similarity < epsilon {
                    tracing::debug!(
                        best = top.similarity,
                        second = second.similarity,
                        "no match: ambiguous"
                    );
                    return Err(MatchError::NoMatch {
                        reason: NoMatchReason::Ambiguous,
                        best: Some(top.similarity),
                    });
                }
            }

            return Ok(top);
        }
    }

    /// Best hit of the best identity, and best hit of the next distinct identity.
    fn rank_identities(&self, hits: &[Neighbor]) -> (Option<IdentityMatch>, Option<IdentityMatch>) {
        let mut top: Option<IdentityMatch> = None;
        for hit in hits {
            let identity_id = self.owners[hit.slot];
            match top {
                None => {
                    top = Some(IdentityMatch {
                        identity_id,
                        similarity: hit.similarity,
                    })
                }
                Some(t) if t.identity_id != identity_id => {
                    return (
                        top,
                        Some(IdentityMatch {
                            identity_id,
                            similarity: hit.similarity,
                        }),
                    );
                }
                Some(_) => {}
            }
        }
        (top, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn small_config() -> MatcherConfig {
        MatcherConfig {
            dim: 3,
            ..MatcherConfig::default()
        }
    }

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    #[test]
    fn test_identical_embedding_matches_at_max_similarity() {
        let mut gallery = Gallery::new(small_config());
        gallery.enroll(1, &emb(&[0.0, 1.0, 0.0])).unwrap();
        gallery.enroll(2, &emb(&[0.0, 0.0, 1.0])).unwrap();
        gallery.enroll(3, &emb(&[1.0, 0.0, 0.0])).unwrap();

        let m = gallery.best_match(&emb(&[1.0, 0.0, 0.0]), 0.5).unwrap();
        assert_eq!(m.identity_id, 3);
        assert!((m.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold_is_no_match() {
        let mut gallery = Gallery::new(small_config());
        gallery.enroll(1, &emb(&[0.0, 1.0, 0.0])).unwrap();

        let err = gallery.best_match(&emb(&[1.0, 0.0, 0.0]), 0.5).unwrap_err();
        assert!(matches!(
            err,
            MatchError::NoMatch { reason: NoMatchReason::BelowThreshold, .. }
        ));
    }

    #[test]
    fn test_wrong_dimension_rejected_before_search() {
        let gallery = Gallery::new(small_config());
        let err = gallery.best_match(&emb(&[1.0, 0.0]), 0.5).unwrap_err();
        assert_eq!(
            err,
            MatchError::InvalidEmbedding(EmbeddingError::Dimension { expected: 3, actual: 2 })
        );
    }

    fn two_identities() -> Gallery {
        let mut gallery = Gallery::new(small_config());
        gallery.enroll(1, &emb(&[1.0, 0.0, 0.0])).unwrap();
        gallery.enroll(2, &emb(&[0.0, 1.0, 0.0])).unwrap();
        gallery
    }

    #[test]
    fn test_infinite_query_is_rejected_not_matched() {
        let gallery = two_identities();
        let err = gallery.best_match(&emb(&[f32::INFINITY, 0.0, 0.0]), 0.5).unwrap_err();
        assert_eq!(err, MatchError::InvalidEmbedding(EmbeddingError::NonFinite { index: 0 }));
    }

    #[test]
    fn test_nan_query_is_rejected_at_any_threshold() {
        let gallery = two_identities();
        for threshold in [0.0, 0.5, 0.99] {
            let err = gallery.best_match(&emb(&[f32::NAN, 0.0, 0.0]), threshold).unwrap_err();
            assert_eq!(err, MatchError::InvalidEmbedding(EmbeddingError::NonFinite { index: 0 }));
        }
    }

    #[test]
    fn test_zero_query_is_rejected() {
        let gallery = two_identities();
        let err = gallery.best_match(&emb(&[0.0, 0.0, 0.0]), 0.0).unwrap_err();
        assert_eq!(err, MatchError::InvalidEmbedding(EmbeddingError::ZeroNorm));
    }

    #[test]
    fn test_enroll_rejects_unusable_vectors() {
        let mut gallery = two_identities();
        assert!(gallery.enroll(3, &emb(&[0.0, f32::NEG_INFINITY, 0.0])).is_err());
        assert!(gallery.enroll(3, &emb(&[f32::NAN, 1.0, 0.0])).is_err());
        assert!(gallery.enroll(3, &emb(&[0.0, 0.0, 0.0])).is_err());
        assert_eq!(gallery.len(), 2);
    }

    #[test]
    fn test_enroll_rejects_wrong_dimension() {
        let mut gallery = Gallery::new(small_config());
        assert!(gallery.enroll(1, &emb(&[1.0])).is_err());
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_empty_gallery_is_no_match() {
        let gallery = Gallery::new(small_config());
        let err = gallery.best_match(&emb(&[1.0, 0.0, 0.0]), 0.5).unwrap_err();
        assert!(matches!(
            err,
            MatchError::NoMatch { reason: NoMatchReason::EmptyGallery, .. }
        ));
    }

    #[test]
    fn test_near_identical_identities_are_ambiguous() {
        let mut gallery = Gallery::new(small_config());
        gallery.enroll(1, &emb(&[1.0, 0.0, 0.0])).unwrap();
        gallery.enroll(2, &emb(&[1.0, 0.001, 0.0])).unwrap();

        let err = gallery.best_match(&emb(&[1.0, 0.0005, 0.0]), 0.5).unwrap_err();
        assert!(matches!(
            err,
            MatchError::NoMatch { reason: NoMatchReason::Ambiguous, .. }
        ));
    }

    #[test]
    fn test_same_identity_multiple_embeddings_not_ambiguous() {
        let mut gallery = Gallery::new(small_config());
        gallery.enroll(1, &emb(&[1.0, 0.0, 0.0])).unwrap();
        gallery.enroll(1, &emb(&[1.0, 0.001, 0.0])).unwrap();
        gallery.enroll(2, &emb(&[0.0, 1.0, 0.0])).unwrap();

        let m = gallery.best_match(&emb(&[1.0, 0.0005, 0.0]), 0.5).unwrap();
        assert_eq!(m.identity_id, 1);
    }

    #[test]
    fn test_competitor_hidden_behind_candidate_window_is_found() {
        let config = MatcherConfig {
            dim: 3,
            candidates: 2,
            ..MatcherConfig::default()
        };
        let mut gallery = Gallery::new(config);
        for _ in 0..5 {
            gallery.enroll(1, &emb(&[1.0, 0.0, 0.0])).unwrap();
        }
        gallery.enroll(2, &emb(&[1.0, 0.0001, 0.0])).unwrap();

        let err = gallery.best_match(&emb(&[1.0, 0.0, 0.0]), 0.5).unwrap_err();
        assert!(matches!(
            err,
            MatchError::NoMatch { reason: NoMatchReason::Ambiguous, .. }
        ));
    }

    #[test]
    fn test_graph_and_exact_galleries_agree() {
        let mut rng = StdRng::seed_from_u64(11);
        let dim = 32;
        let exact_cfg = MatcherConfig { dim, exact_limit: usize::MAX, ..MatcherConfig::default() };
        let graph_cfg = MatcherConfig { dim, exact_limit: 10, ..MatcherConfig::default() };
        let mut exact = Gallery::new(exact_cfg);
        let mut graph = Gallery::new(graph_cfg);

        let mut stored = Vec::new();
        for id in 0..300i64 {
            let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let e = Embedding::new(v);
            exact.enroll(id, &e).unwrap();
            graph.enroll(id, &e).unwrap();
            stored.push(e);
        }
        assert!(graph.uses_graph());
        assert!(!exact.uses_graph());

        for i in (0..stored.len()).step_by(7) {
            let a = exact.best_match(&stored[i], 0.5).unwrap();
            let b = graph.best_match(&stored[i], 0.5).unwrap();
            assert_eq!(a.identity_id, b.identity_id);
            assert_eq!(a.identity_id, i as i64);
        }
    }
}
