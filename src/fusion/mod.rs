//! Score fusion: merging vector distances and BM25 scores into one ranking.
//!
//! The two retrieval channels live on incompatible scales (L2 distance,
//! lower-better and unbounded; BM25, higher-better and unbounded), so each
//! channel is min-max normalized into `[0, 1]` over the current candidate
//! set before the weighted combination. Distances are inverted into
//! similarities first so that both normalized channels read higher-is-better.
//!
//! Normalization is relative to the candidate set of this query only; fused
//! scores are not comparable across queries.

use rustc_hash::FxHashMap;

use crate::types::ChunkId;

/// Knobs for the hybrid query path.
#[derive(Clone, Copy, Debug)]
pub struct FusionConfig {
    /// Weight of the vector channel; `1 - alpha` goes to the lexical one.
    pub alpha: f32,
    /// The vector search fetches `top_k * overfetch` candidates so the
    /// post-fusion ranking has room to differ from the raw distance order.
    pub overfetch: usize,
    /// Corpora at or below this size are BM25-scored in full, concurrently
    /// with the vector search. Larger corpora get lexical scoring restricted
    /// to the vector candidates after the search returns.
    pub lexical_full_scan_limit: usize,
    /// When the vector store is unreachable, serve lexical-only results
    /// (marked degraded) instead of failing the query.
    pub lexical_fallback: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            overfetch: 3,
            lexical_full_scan_limit: 10_000,
            lexical_fallback: false,
        }
    }
}

/// One fused candidate: both normalized channel scores plus the combination.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusedHit {
    pub id: ChunkId,
    /// Normalized vector similarity in `[0, 1]`; `0.0` when the chunk was
    /// not a vector candidate.
    pub vector_score: f32,
    /// Normalized BM25 score in `[0, 1]`; `0.0` when lexical scoring did not
    /// match the chunk.
    pub lexical_score: f32,
    pub fused_score: f32,
}

/// Min-max parameters over a slice of raw values. A degenerate range (all
/// values equal, or fewer than two values) uses a span of 1.0 so every input
/// maps to 0.0 instead of dividing by zero.
fn min_range(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut any = false;
    for v in values {
        any = true;
        min = min.min(v);
        max = max.max(v);
    }
    if !any {
        return (0.0, 1.0);
    }
    let range = if max > min { max - min } else { 1.0 };
    (min, range)
}

/// Fuse the two channels and rank.
///
/// The candidate set is the union of vector hits and lexically scored
/// chunks; a chunk absent from one channel contributes 0.0 there. Ties on
/// the fused score break toward the lower chunk id so rankings are
/// reproducible. The result is sorted descending and truncated to `top_k`.
pub fn fuse(
    vector_hits: &[(ChunkId, f32)],
    lexical_scores: &FxHashMap<ChunkId, f32>,
    alpha: f32,
    top_k: usize,
) -> Vec<FusedHit> {
    // Distances become similarities before normalization, so the nearest
    // hit lands at 1.0 and the farthest at 0.0.
    let (d_min, d_range) = min_range(vector_hits.iter().map(|(_, d)| *d));
    let mut vector_sims: FxHashMap<ChunkId, f32> = FxHashMap::default();
    for (id, distance) in vector_hits {
        vector_sims.insert(*id, 1.0 - (distance - d_min) / d_range);
    }

    let (l_min, l_range) = min_range(lexical_scores.values().copied());

    let mut hits: Vec<FusedHit> = Vec::with_capacity(vector_sims.len() + lexical_scores.len());
    let mut push = |id: ChunkId| {
        let vector_score = vector_sims.get(&id).copied().unwrap_or(0.0);
        let lexical_score = lexical_scores
            .get(&id)
            .map(|raw| (raw - l_min) / l_range)
            .unwrap_or(0.0);
        hits.push(FusedHit {
            id,
            vector_score,
            lexical_score,
            fused_score: alpha * vector_score + (1.0 - alpha) * lexical_score,
        });
    };
    for (id, _) in vector_hits {
        push(*id);
    }
    for id in lexical_scores.keys() {
        if !vector_sims.contains_key(id) {
            push(*id);
        }
    }

    hits.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(top_k);
    hits
}
