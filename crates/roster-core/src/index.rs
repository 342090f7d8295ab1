//! Nearest-neighbor indexes over L2-normalized embeddings.
//!
//! Two implementations share the [`NeighborIndex`] interface:
//! - [`ExactIndex`]: linear scan, exact results, fine for small catalogs.
//! - [`NswIndex`]: flat navigable-small-world graph with beam search,
//!   sub-linear query cost on large catalogs.
//!
//! Vectors are expected to be normalized by the caller, so cosine similarity
//! reduces to a dot product.

use crate::types::Embedding;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

// --- Graph parameters ---
const NSW_MAX_LINKS: usize = 16;
const NSW_EF_CONSTRUCTION: usize = 64;
const NSW_EF_SEARCH: usize = 64;

/// One search hit: index slot and its similarity to the probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub slot: usize,
    pub similarity: f32,
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.similarity
            .total_cmp(&other.similarity)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Strategy for finding the most similar stored vectors to a probe.
pub trait NeighborIndex: Send + Sync {
    /// Store a vector and return its slot. Slots are assigned sequentially from 0.
    fn insert(&mut self, vector: Embedding) -> usize;

    /// Up to `k` nearest slots, most similar first.
    fn search(&self, probe: &Embedding, k: usize) -> Vec<Neighbor>;

    /// All stored vectors in slot order.
    fn vectors(&self) -> &[Embedding];

    fn len(&self) -> usize {
        self.vectors().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Brute-force linear scan.
#[derive(Debug, Default)]
pub struct ExactIndex {
    vectors: Vec<Embedding>,
}

impl ExactIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NeighborIndex for ExactIndex {
    fn insert(&mut self, vector: Embedding) -> usize {
        self.vectors.push(vector);
        self.vectors.len() - 1
    }

    fn search(&self, probe: &Embedding, k: usize) -> Vec<Neighbor> {
        let mut hits: Vec<Neighbor> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(slot, v)| Neighbor {
                slot,
                similarity: dot(&probe.values, &v.values),
            })
            .collect();
        hits.sort_by(|a, b| b.cmp(a));
        hits.truncate(k);
        hits
    }

    fn vectors(&self) -> &[Embedding] {
        &self.vectors
    }
}

/// Flat navigable-small-world graph.
///
/// Each inserted node is linked to its nearest existing nodes (found with the
/// same beam search used for queries), and links are made bidirectional with
/// degree pruning.
#[derive(Debug)]
pub struct NswIndex {
    vectors: Vec<Embedding>,
    links: Vec<Vec<usize>>,
    max_links: usize,
    ef_construction: usize,
    ef_search: usize,
}

impl Default for NswIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl NswIndex {
    pub fn new() -> Self {
        Self::with_params(NSW_MAX_LINKS, NSW_EF_CONSTRUCTION, NSW_EF_SEARCH)
    }

    pub fn with_params(max_links: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self {
            vectors: Vec::new(),
            links: Vec::new(),
            max_links: max_links.max(2),
            ef_construction: ef_construction.max(1),
            ef_search: ef_search.max(1),
        }
    }

    /// Build a graph from existing vectors, preserving slot order.
    pub fn from_vectors(vectors: impl IntoIterator<Item = Embedding>) -> Self {
        let mut index = Self::new();
        for v in vectors {
            index.insert(v);
        }
        index
    }

    /// Entry points for a search: the first node plus the newest one, which
    /// spreads starting positions across the insertion history.
    fn entry_points(&self) -> Vec<usize> {
        match self.vectors.len() {
            0 => Vec::new(),
            1 => vec![0],
            n => vec![0, n - 1],
        }
    }

    fn beam_search(&self, probe: &[f32], ef: usize) -> Vec<Neighbor> {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut candidates: BinaryHeap<Neighbor> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Neighbor>> = BinaryHeap::new();

        for entry in self.entry_points() {
            if !visited.insert(entry) {
                continue;
            }
            let hit = Neighbor {
                slot: entry,
                similarity: dot(probe, &self.vectors[entry].values),
            };
            candidates.push(hit);
            results.push(Reverse(hit));
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(current) = candidates.pop() {
            let worst = results.peek().map(|r| r.0.similarity).unwrap_or(f32::NEG_INFINITY);
            if results.len() >= ef && current.similarity < worst {
                break;
            }

            for &next in &self.links[current.slot] {
                if !visited.insert(next) {
                    continue;
                }
                let similarity = dot(probe, &self.vectors[next].values);
                let worst = results.peek().map(|r| r.0.similarity).unwrap_or(f32::NEG_INFINITY);
                if results.len() < ef || similarity > worst {
                    let hit = Neighbor { slot: next, similarity };
                    candidates.push(hit);
                    results.push(Reverse(hit));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Neighbor> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    fn prune(&mut self, node: usize) {
        let limit = self.max_links * 2;
        if self.links[node].len() <= limit {
            return;
        }
        let base = self.vectors[node].values.clone();
        let mut scored: Vec<Neighbor> = self.links[node]
            .iter()
            .map(|&slot| Neighbor {
                slot,
                similarity: dot(&base, &self.vectors[slot].values),
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(limit);
        self.links[node] = scored.into_iter().map(|n| n.slot).collect();
    }

    #[cfg(test)]
    fn degree(&self, slot: usize) -> usize {
        self.links[slot].len()
    }
}

impl NeighborIndex for NswIndex {
    fn insert(&mut self, vector: Embedding) -> usize {
        let neighbors = if self.vectors.is_empty() {
            Vec::new()
        } else {
            let mut found = self.beam_search(&vector.values, self.ef_construction);
            found.truncate(self.max_links);
            found
        };

        let slot = self.vectors.len();
        self.vectors.push(vector);
        self.links.push(neighbors.iter().map(|n| n.slot).collect());

        for n in neighbors {
            self.links[n.slot].push(slot);
            self.prune(n.slot);
        }
        slot
    }

    fn search(&self, probe: &Embedding, k: usize) -> Vec<Neighbor> {
        if self.vectors.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut hits = self.beam_search(&probe.values, self.ef_search.max(k));
        hits.truncate(k);
        hits
    }

    fn vectors(&self) -> &[Embedding] {
        &self.vectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_unit(rng: &mut StdRng, dim: usize) -> Embedding {
        let values: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Embedding::new(values).normalized()
    }

    fn jitter(rng: &mut StdRng, base: &Embedding, amount: f32) -> Embedding {
        let values: Vec<f32> = base
            .values
            .iter()
            .map(|v| v + rng.gen_range(-amount..amount))
            .collect();
        Embedding::new(values).normalized()
    }

    #[test]
    fn test_exact_index_orders_by_similarity() {
        let mut index = ExactIndex::new();
        index.insert(Embedding::new(vec![0.0, 1.0]));
        index.insert(Embedding::new(vec![1.0, 0.0]));
        index.insert(Embedding::new(vec![0.6, 0.8]));

        let hits = index.search(&Embedding::new(vec![1.0, 0.0]), 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].slot, 1);
        assert_eq!(hits[1].slot, 2);
    }

    #[test]
    fn test_nsw_empty_index() {
        let index = NswIndex::new();
        assert!(index.search(&Embedding::new(vec![1.0]), 5).is_empty());
    }

    #[test]
    fn test_nsw_degree_is_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut index = NswIndex::with_params(4, 16, 16);
        for _ in 0..200 {
            index.insert(random_unit(&mut rng, 16));
        }
        for slot in 0..index.len() {
            assert!(index.degree(slot) <= 8, "slot {slot} has degree {}", index.degree(slot));
        }
    }

    #[test]
    fn test_nsw_agrees_with_exact_on_top_hit() {
        let mut rng = StdRng::seed_from_u64(42);
        let dim = 64;
        let mut exact = ExactIndex::new();
        let mut graph = NswIndex::new();
        let mut stored = Vec::new();
        for _ in 0..600 {
            let v = random_unit(&mut rng, dim);
            exact.insert(v.clone());
            graph.insert(v.clone());
            stored.push(v);
        }

        for i in (0..stored.len()).step_by(13) {
            let probe = jitter(&mut rng, &stored[i], 0.05);
            let e = exact.search(&probe, 1);
            let g = graph.search(&probe, 1);
            assert_eq!(e[0].slot, g[0].slot, "probe {i}");
            assert!((e[0].similarity - g[0].similarity).abs() < 1e-6);
        }
    }
}
