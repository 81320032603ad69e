//! The knowledge base facade: ingestion on one side, hybrid queries on the
//! other.
//!
//! One value owns the vector store, the embedding provider, and the lexical
//! index, and keeps the two indexes consistent: every chunk that reaches the
//! store is also BM25-indexed, and deleting a document removes it from both.
//! The lexical index sits behind a single-writer/multiple-reader lock;
//! ingestion and deletion take the write side, queries only ever read.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::embeddings::EmbeddingProvider;
use crate::expand::{expand, ExpandOptions};
use crate::fusion::{fuse, FusionConfig};
use crate::hierarchy::{Chunk, Fragment, TreeBuilder, TreeConfig};
use crate::lexical::{Bm25Index, Bm25Params, Tokenizer, UnicodeTokenizer};
use crate::stores::{ChunkRecord, FilterExpr, RetrievalResult, VectorStore};
use crate::types::{CancelToken, ChunkId, ChunkIdGen, KbError};

/// One hybrid query.
///
/// Build with [`QueryRequest::new`] and adjust through the `with_*` methods;
/// the defaults give a hierarchical hybrid search weighted toward the vector
/// channel.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub text: String,
    pub top_k: usize,
    /// Vector weight in `[0, 1]`; out-of-range values are clamped.
    pub alpha: f32,
    pub hierarchical: bool,
    pub include_parent: bool,
    pub include_children: bool,
    pub max_depth: u32,
    pub filter: Option<FilterExpr>,
    pub cancel: Option<CancelToken>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: 10,
            alpha: 0.7,
            hierarchical: true,
            include_parent: true,
            include_children: true,
            max_depth: 1,
            filter: None,
            cancel: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_hierarchical(mut self, hierarchical: bool) -> Self {
        self.hierarchical = hierarchical;
        self
    }

    pub fn with_include_parent(mut self, include: bool) -> Self {
        self.include_parent = include;
        self
    }

    pub fn with_include_children(mut self, include: bool) -> Self {
        self.include_children = include;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Ranked results plus how they were produced.
#[derive(Clone, Debug)]
pub struct QueryResponse {
    pub results: Vec<RetrievalResult>,
    /// True when the vector store was unreachable and the response came from
    /// the lexical channel alone. Degraded results carry no content for
    /// chunks whose records could not be fetched.
    pub degraded: bool,
}

/// What one ingestion produced.
#[derive(Clone, Debug)]
pub struct IngestSummary {
    pub file_path: String,
    pub root: ChunkId,
    pub chunk_count: usize,
}

/// Corpus-wide counters.
#[derive(Clone, Copy, Debug)]
pub struct KbStats {
    pub documents: usize,
    pub chunks: usize,
    pub lexical_chunks: usize,
    pub lexical_terms: usize,
}

pub struct KnowledgeBase<S> {
    store: S,
    embedder: Arc<dyn EmbeddingProvider>,
    tree: TreeBuilder,
    fusion: FusionConfig,
    bm25_params: Bm25Params,
    tokenizer: Arc<dyn Tokenizer>,
    lexical: RwLock<Bm25Index>,
    ids: ChunkIdGen,
}

impl<S: VectorStore> KnowledgeBase<S> {
    pub fn new(store: S, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(UnicodeTokenizer);
        let bm25_params = Bm25Params::default();
        Self {
            store,
            embedder,
            tree: TreeBuilder::default(),
            fusion: FusionConfig::default(),
            bm25_params,
            tokenizer: tokenizer.clone(),
            lexical: RwLock::new(Bm25Index::new(bm25_params, tokenizer)),
            ids: ChunkIdGen::new(),
        }
    }

    pub fn with_tree_config(mut self, config: TreeConfig) -> Self {
        self.tree = TreeBuilder::new(config);
        self
    }

    pub fn with_fusion_config(mut self, config: FusionConfig) -> Self {
        self.fusion = config;
        self
    }

    pub fn with_bm25_params(mut self, params: Bm25Params) -> Self {
        self.bm25_params = params;
        self.lexical = RwLock::new(Bm25Index::new(params, self.tokenizer.clone()));
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer.clone();
        self.lexical = RwLock::new(Bm25Index::new(self.bm25_params, tokenizer));
        self
    }

    pub fn with_id_gen(mut self, ids: ChunkIdGen) -> Self {
        self.ids = ids;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Chunk, embed, and index one document. Re-ingesting a path replaces
    /// everything previously stored for it, but the previous version is only
    /// removed once the replacement's vectors are in hand: a failed
    /// embedding call leaves both indexes exactly as they were.
    pub async fn add_document(
        &self,
        file_path: &str,
        fragments: &[Fragment],
    ) -> Result<IngestSummary, KbError> {
        let name = file_path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(file_path);
        let tree = self.tree.build(name, fragments, &self.ids)?;

        let chunks = tree.flatten();
        let records: Vec<ChunkRecord> = chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| ChunkRecord::from_chunk(chunk, file_path, index))
            .collect();
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

        let embeddings = self.embedder.embed(&texts).await?;
        if embeddings.len() != records.len() {
            return Err(KbError::Embedding(format!(
                "provider returned {} vectors for {} chunks",
                embeddings.len(),
                records.len()
            )));
        }
        let dim = self.embedder.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dim) {
            return Err(KbError::Embedding(format!(
                "provider advertises dimension {dim} but returned {}",
                bad.len()
            )));
        }

        let previous = self.store.delete_by_path(file_path).await?;
        if !previous.is_empty() {
            self.lexical.write().remove(&previous);
            debug!(file_path, replaced = previous.len(), "replacing document");
        }

        let lexical_entries: Vec<(ChunkId, String)> = records
            .iter()
            .map(|r| (r.id, r.content.clone()))
            .collect();
        let chunk_count = records.len();
        let root = tree.root_id();

        self.store
            .insert(records.into_iter().zip(embeddings).collect())
            .await?;

        {
            let mut lexical = self.lexical.write();
            lexical.add_all(lexical_entries.iter().map(|(id, text)| (*id, text.as_str())));
        }

        info!(file_path, chunks = chunk_count, "document ingested");
        Ok(IngestSummary {
            file_path: file_path.to_string(),
            root,
            chunk_count,
        })
    }

    /// Ingest pre-built chunks with pre-computed embeddings, bypassing the
    /// tree builder and the embedding provider. The caller is responsible
    /// for consistent parent/child links; vectors are still checked against
    /// the provider's dimension. Existing chunks for the path are replaced.
    pub async fn insert_chunks(
        &self,
        file_path: &str,
        chunks: &[Chunk],
        embeddings: Vec<Vec<f32>>,
    ) -> Result<usize, KbError> {
        if chunks.len() != embeddings.len() {
            return Err(KbError::Embedding(format!(
                "{} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }
        let dim = self.embedder.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dim) {
            return Err(KbError::Embedding(format!(
                "corpus dimension is {dim}, got a vector of {}",
                bad.len()
            )));
        }

        let previous = self.store.delete_by_path(file_path).await?;
        if !previous.is_empty() {
            self.lexical.write().remove(&previous);
        }

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| ChunkRecord::from_chunk(chunk, file_path, index))
            .collect();
        let lexical_entries: Vec<(ChunkId, String)> = records
            .iter()
            .map(|r| (r.id, r.content.clone()))
            .collect();
        let count = records.len();

        self.store
            .insert(records.into_iter().zip(embeddings).collect())
            .await?;
        self.lexical
            .write()
            .add_all(lexical_entries.iter().map(|(id, text)| (*id, text.as_str())));

        info!(file_path, chunks = count, "pre-embedded chunks ingested");
        Ok(count)
    }

    /// Ingest a batch. Documents are independent: one failure does not stop
    /// or roll back the others, and each gets its own result slot.
    pub async fn add_documents(
        &self,
        documents: &[(String, Vec<Fragment>)],
    ) -> Vec<Result<IngestSummary, KbError>> {
        let mut results = Vec::with_capacity(documents.len());
        for (file_path, fragments) in documents {
            results.push(self.add_document(file_path, fragments).await);
        }
        results
    }

    /// Remove a document from the store and the lexical index. Returns how
    /// many chunks were deleted; deleting an unknown path is a no-op zero.
    pub async fn delete_document(&self, file_path: &str) -> Result<usize, KbError> {
        let deleted = self.store.delete_by_path(file_path).await?;
        if !deleted.is_empty() {
            self.lexical.write().remove(&deleted);
            info!(file_path, chunks = deleted.len(), "document deleted");
        }
        Ok(deleted.len())
    }

    /// Rebuild the BM25 index from the store and swap it in atomically.
    /// Queries running against the old index will notice the generation
    /// change and report [`KbError::IndexState`] rather than fuse stale
    /// scores.
    pub async fn rebuild_lexical_index(&self) -> Result<usize, KbError> {
        let mut fresh = Bm25Index::new(self.bm25_params, self.tokenizer.clone());
        for path in self.store.list_paths().await? {
            for record in self.store.fetch_by_path(&path).await? {
                fresh.add(record.id, &record.content);
            }
        }
        let indexed = fresh.len();
        *self.lexical.write() = fresh;
        info!(chunks = indexed, "lexical index rebuilt");
        Ok(indexed)
    }

    pub async fn list_documents(&self) -> Result<Vec<String>, KbError> {
        self.store.list_paths().await
    }

    pub async fn stats(&self) -> Result<KbStats, KbError> {
        let documents = self.store.list_paths().await?.len();
        let chunks = self.store.count().await?;
        let lexical = self.lexical.read();
        Ok(KbStats {
            documents,
            chunks,
            lexical_chunks: lexical.len(),
            lexical_terms: lexical.term_count(),
        })
    }

    /// Run one hybrid query end to end: embed, search both channels, fuse,
    /// then optionally expand hierarchical context.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, KbError> {
        if request.top_k == 0 || request.text.trim().is_empty() {
            return Ok(QueryResponse {
                results: Vec::new(),
                degraded: false,
            });
        }
        let alpha = request.alpha.clamp(0.0, 1.0);
        check_cancel(&request.cancel)?;

        let query_vec = self
            .embedder
            .embed(std::slice::from_ref(&request.text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KbError::Embedding("provider returned no vector for query".into()))?;

        // Small corpora are BM25-scored in full while the vector search runs;
        // large ones defer lexical scoring to the vector candidates so the
        // scan stays bounded.
        let (generation, full_scan) = {
            let lexical = self.lexical.read();
            (
                lexical.generation(),
                lexical.len() <= self.fusion.lexical_full_scan_limit,
            )
        };

        let fetch_k = request.top_k.saturating_mul(self.fusion.overfetch.max(1));
        let (mut lexical_scores, vector_result) = tokio::join!(
            async {
                if full_scan {
                    self.lexical.read().score(&request.text, None)
                } else {
                    FxHashMap::default()
                }
            },
            self.store.search(&query_vec, fetch_k, request.filter.as_ref()),
        );
        check_cancel(&request.cancel)?;

        let vector_hits = match vector_result {
            Ok(hits) => hits,
            Err(KbError::StoreUnavailable(reason)) if self.fusion.lexical_fallback => {
                warn!(%reason, "vector store unavailable, serving lexical-only results");
                return self
                    .lexical_only_response(&request, generation, lexical_scores, full_scan)
                    .await;
            }
            Err(err) => return Err(err),
        };

        if !full_scan {
            let candidates: HashSet<ChunkId> = vector_hits.iter().map(|h| h.id).collect();
            lexical_scores = self.lexical.read().score(&request.text, Some(&candidates));
        }

        // A rebuild or concurrent ingestion between scoring and fusion would
        // make the lexical scores incomparable; detect it instead of fusing.
        self.check_generation(generation)?;

        let mut records: FxHashMap<ChunkId, ChunkRecord> = FxHashMap::default();
        let distances: Vec<(ChunkId, f32)> = vector_hits
            .iter()
            .map(|hit| (hit.id, hit.distance))
            .collect();
        for hit in vector_hits {
            records.insert(hit.id, hit.record);
        }

        // Lexical-only candidates are capped at the same overfetch count as
        // the vector channel, then hydrated before fusion so the request
        // filter applies to them too (the vector search already ran under it).
        let mut lexical_only: Vec<(ChunkId, f32)> = lexical_scores
            .iter()
            .filter(|(id, _)| !records.contains_key(id))
            .map(|(id, score)| (*id, *score))
            .collect();
        lexical_only.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        lexical_only.truncate(fetch_k);
        for (id, _) in lexical_only {
            match self.store.fetch(id).await? {
                Some(record)
                    if request
                        .filter
                        .as_ref()
                        .map_or(true, |f| f.matches(&record)) =>
                {
                    records.insert(id, record);
                }
                // Filtered out, or deleted mid-query: drop from the pool.
                _ => {
                    lexical_scores.remove(&id);
                }
            }
        }
        lexical_scores.retain(|id, _| records.contains_key(id));

        let fused = fuse(&distances, &lexical_scores, alpha, request.top_k);
        check_cancel(&request.cancel)?;

        let mut results = Vec::with_capacity(fused.len());
        for hit in fused {
            if let Some(record) = records.remove(&hit.id) {
                results.push(RetrievalResult::primary(
                    record,
                    hit.vector_score,
                    hit.lexical_score,
                    hit.fused_score,
                ));
            }
        }

        if request.hierarchical {
            check_cancel(&request.cancel)?;
            let opts = ExpandOptions {
                include_parent: request.include_parent,
                include_children: request.include_children,
                max_depth: request.max_depth,
            };
            expand(&self.store, &mut results, &opts).await?;
        }

        debug!(
            query = %request.text,
            top_k = request.top_k,
            alpha,
            results = results.len(),
            "hybrid query complete"
        );
        Ok(QueryResponse {
            results,
            degraded: false,
        })
    }

    /// Degraded path: rank by BM25 alone. Chunk records are fetched on a
    /// best-effort basis; if the store stays down, results keep their ids
    /// and scores but carry empty content.
    async fn lexical_only_response(
        &self,
        request: &QueryRequest,
        generation: u64,
        prescored: FxHashMap<ChunkId, f32>,
        full_scan: bool,
    ) -> Result<QueryResponse, KbError> {
        let lexical_scores = if full_scan {
            prescored
        } else {
            self.lexical.read().score(&request.text, None)
        };
        self.check_generation(generation)?;

        // The surviving channel gets full weight regardless of the
        // requested alpha.
        let fused = fuse(&[], &lexical_scores, 0.0, request.top_k);
        check_cancel(&request.cancel)?;

        let mut results = Vec::with_capacity(fused.len());
        for hit in fused {
            match self.store.fetch(hit.id).await {
                Ok(Some(record)) => {
                    if request
                        .filter
                        .as_ref()
                        .map_or(true, |f| f.matches(&record))
                    {
                        results.push(RetrievalResult::primary(
                            record,
                            0.0,
                            hit.lexical_score,
                            hit.fused_score,
                        ));
                    }
                }
                Ok(None) => {}
                Err(KbError::StoreUnavailable(_)) => {
                    results.push(placeholder_result(hit.id, hit.lexical_score, hit.fused_score));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(QueryResponse {
            results,
            degraded: true,
        })
    }

    fn check_generation(&self, recorded: u64) -> Result<(), KbError> {
        let current = self.lexical.read().generation();
        if current != recorded {
            return Err(KbError::IndexState(format!(
                "lexical index changed during query (generation {recorded} -> {current})"
            )));
        }
        Ok(())
    }
}

fn check_cancel(cancel: &Option<CancelToken>) -> Result<(), KbError> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(KbError::Cancelled),
        _ => Ok(()),
    }
}

fn placeholder_result(id: ChunkId, lexical_score: f32, fused_score: f32) -> RetrievalResult {
    RetrievalResult {
        chunk_id: id,
        content: String::new(),
        chunk_type: crate::hierarchy::ChunkType::Paragraph,
        level: 0,
        parent_id: None,
        children_ids: Vec::new(),
        file_path: String::new(),
        chunk_index: 0,
        metadata: serde_json::Value::Null,
        lexical_score,
        vector_score: 0.0,
        fused_score,
        is_context: false,
    }
}
