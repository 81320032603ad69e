//! Hierarchical context expansion.
//!
//! After fusion picks the primary hits, this stage walks the stored tree
//! links to append surrounding structure: ancestors give the "where in the
//! document is this" framing, children give the detail under a matched
//! section. Expansion only ever appends; the primary ranking is left intact,
//! and each result appears at most once regardless of how many hits share an
//! ancestor.

use std::collections::HashSet;

use tracing::debug;

use crate::stores::{RetrievalResult, VectorStore};
use crate::types::{ChunkId, KbError};

/// What to pull in around each primary hit.
#[derive(Clone, Copy, Debug)]
pub struct ExpandOptions {
    pub include_parent: bool,
    pub include_children: bool,
    /// How many tree hops to walk in each enabled direction.
    pub max_depth: u32,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            include_parent: true,
            include_children: true,
            max_depth: 1,
        }
    }
}

/// Append context chunks to `hits` in place.
///
/// Context entries inherit the fused score of the hit that pulled them in
/// and are flagged `is_context`; they are appended after the whole primary
/// block, in the order their originating hits rank, so the primary ranking
/// is never disturbed. Chunks whose records are missing from the store (a concurrent
/// delete) are skipped silently; store errors abort the expansion.
pub async fn expand<S: VectorStore + ?Sized>(
    store: &S,
    hits: &mut Vec<RetrievalResult>,
    opts: &ExpandOptions,
) -> Result<(), KbError> {
    if opts.max_depth == 0 || !(opts.include_parent || opts.include_children) {
        return Ok(());
    }

    // Primary hits are never re-emitted as context, even for each other.
    let mut seen: HashSet<ChunkId> = hits.iter().map(|h| h.chunk_id).collect();
    let mut context: Vec<RetrievalResult> = Vec::new();

    for hit in hits.iter() {
        // Only primaries drive expansion. Context entries from an earlier
        // pass must not spawn context of their own, so expanding an
        // already-expanded list is a no-op.
        if hit.is_context {
            continue;
        }
        if opts.include_parent {
            // Walk the ancestor chain. A node another hit already claimed
            // is not re-added, but the walk continues through it so a
            // deeper hit still reaches its grandparents.
            let mut cursor = hit.parent_id;
            let mut hops = 0;
            while let Some(parent_id) = cursor {
                if hops >= opts.max_depth {
                    break;
                }
                hops += 1;
                let Some(record) = store.fetch(parent_id).await? else {
                    break;
                };
                cursor = record.parent_id;
                if seen.insert(parent_id) {
                    context.push(RetrievalResult::context(record, hit.fused_score));
                }
            }
        }

        if opts.include_children {
            // Breadth-first by level, children in stored (document) order.
            let mut frontier: Vec<ChunkId> = hit.children_ids.clone();
            for _ in 0..opts.max_depth {
                if frontier.is_empty() {
                    break;
                }
                let mut next = Vec::new();
                for child_id in frontier {
                    let Some(record) = store.fetch(child_id).await? else {
                        continue;
                    };
                    next.extend(record.children_ids());
                    if seen.insert(child_id) {
                        context.push(RetrievalResult::context(record, hit.fused_score));
                    }
                }
                frontier = next;
            }
        }
    }

    debug!(
        primaries = hits.len(),
        context = context.len(),
        "hierarchical expansion complete"
    );
    hits.extend(context);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{Chunk, ChunkType, Metadata};
    use crate::stores::{ChunkRecord, InMemoryVectorStore};
    use crate::types::ChunkId;

    /// doc(1) -> section(2) -> [para(3), para(4)]; section(5) childless.
    async fn seeded_store() -> InMemoryVectorStore {
        let store = InMemoryVectorStore::new();
        let mk = |id: u64, ty: ChunkType, level: u32, parent: Option<u64>, children: Vec<u64>| {
            let chunk = Chunk {
                id: ChunkId(id),
                content: format!("chunk {id}"),
                chunk_type: ty,
                level,
                parent_id: parent.map(ChunkId),
                children_ids: children.into_iter().map(ChunkId).collect(),
                metadata: Metadata::new(),
            };
            (
                ChunkRecord::from_chunk(&chunk, "doc.md", id as usize),
                vec![id as f32, 0.0],
            )
        };
        store
            .insert(vec![
                mk(1, ChunkType::Document, 0, None, vec![2, 5]),
                mk(2, ChunkType::Section, 1, Some(1), vec![3, 4]),
                mk(3, ChunkType::Paragraph, 2, Some(2), vec![]),
                mk(4, ChunkType::Paragraph, 2, Some(2), vec![]),
                mk(5, ChunkType::Section, 1, Some(1), vec![]),
            ])
            .await
            .unwrap();
        store
    }

    async fn primary(store: &InMemoryVectorStore, id: u64, score: f32) -> RetrievalResult {
        let record = store.fetch(ChunkId(id)).await.unwrap().unwrap();
        RetrievalResult::primary(record, score, 0.0, score)
    }

    #[tokio::test]
    async fn parent_and_children_are_appended_once() {
        let store = seeded_store().await;
        let mut hits = vec![primary(&store, 2, 0.9).await];
        expand(&store, &mut hits, &ExpandOptions::default())
            .await
            .unwrap();

        let ids: Vec<u64> = hits.iter().map(|h| h.chunk_id.0).collect();
        assert_eq!(ids, vec![2, 1, 3, 4]);
        assert!(!hits[0].is_context);
        for ctx in &hits[1..] {
            assert!(ctx.is_context);
            assert_eq!(ctx.fused_score, 0.9);
        }
    }

    #[tokio::test]
    async fn shared_parent_is_not_duplicated() {
        let store = seeded_store().await;
        let mut hits = vec![primary(&store, 3, 0.8).await, primary(&store, 4, 0.6).await];
        expand(
            &store,
            &mut hits,
            &ExpandOptions {
                include_children: false,
                ..ExpandOptions::default()
            },
        )
        .await
        .unwrap();

        let parents: Vec<&RetrievalResult> =
            hits.iter().filter(|h| h.chunk_id == ChunkId(2)).collect();
        assert_eq!(parents.len(), 1);
        // The first (higher-ranked) hit claims the shared parent's score.
        assert_eq!(parents[0].fused_score, 0.8);
    }

    #[tokio::test]
    async fn primary_hits_are_never_reemitted_as_context() {
        let store = seeded_store().await;
        // Section 2 and its own child 3 are both primaries.
        let mut hits = vec![primary(&store, 2, 0.9).await, primary(&store, 3, 0.7).await];
        expand(&store, &mut hits, &ExpandOptions::default())
            .await
            .unwrap();

        let threes = hits.iter().filter(|h| h.chunk_id == ChunkId(3)).count();
        assert_eq!(threes, 1);
        assert!(!hits.iter().any(|h| h.chunk_id == ChunkId(3) && h.is_context));
    }

    #[tokio::test]
    async fn max_depth_two_reaches_grandparents_and_grandchildren() {
        let store = seeded_store().await;
        let mut up = vec![primary(&store, 3, 0.5).await];
        expand(
            &store,
            &mut up,
            &ExpandOptions {
                include_children: false,
                max_depth: 2,
                ..ExpandOptions::default()
            },
        )
        .await
        .unwrap();
        let ids: Vec<u64> = up.iter().map(|h| h.chunk_id.0).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let mut down = vec![primary(&store, 1, 0.5).await];
        expand(
            &store,
            &mut down,
            &ExpandOptions {
                include_parent: false,
                max_depth: 2,
                ..ExpandOptions::default()
            },
        )
        .await
        .unwrap();
        let ids: Vec<u64> = down.iter().map(|h| h.chunk_id.0).collect();
        // Level order: both sections first, then the paragraphs.
        assert_eq!(ids, vec![1, 2, 5, 3, 4]);
    }

    #[tokio::test]
    async fn reexpansion_adds_nothing() {
        let store = seeded_store().await;
        let mut hits = vec![primary(&store, 3, 0.8).await];
        let opts = ExpandOptions::default();
        expand(&store, &mut hits, &opts).await.unwrap();
        let after_first: Vec<u64> = hits.iter().map(|h| h.chunk_id.0).collect();
        // The context parent (2) has children of its own; they must not be
        // pulled in by a second pass.
        assert_eq!(after_first, vec![3, 2]);

        expand(&store, &mut hits, &opts).await.unwrap();
        let after_second: Vec<u64> = hits.iter().map(|h| h.chunk_id.0).collect();
        assert_eq!(after_second, after_first);
    }

    #[tokio::test]
    async fn missing_context_chunks_are_skipped() {
        let store = seeded_store().await;
        let mut hits = vec![primary(&store, 2, 0.9).await];
        // Simulate a concurrent delete landing between fusion and expansion.
        store.delete_by_path("doc.md").await.unwrap();

        expand(&store, &mut hits, &ExpandOptions::default())
            .await
            .unwrap();
        // Everything is gone from the store, so nothing could be appended.
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn disabled_expansion_is_a_no_op() {
        let store = seeded_store().await;
        let mut hits = vec![primary(&store, 2, 0.9).await];
        expand(
            &store,
            &mut hits,
            &ExpandOptions {
                include_parent: false,
                include_children: false,
                max_depth: 1,
            },
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
