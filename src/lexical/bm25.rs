//! From-scratch BM25 index with incremental add and remove.
//!
//! The index is a plain in-memory structure: per-chunk term frequencies, a
//! corpus-wide document-frequency table, and the running total length. It is
//! rebuildable at any time from the chunk store and is shared behind a
//! single-writer/multiple-reader lock by the knowledge base; mutation bumps
//! a generation counter so callers can detect an index that changed under a
//! long-running query.

use std::collections::HashSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{Bm25Params, Tokenizer, UnicodeTokenizer};
use crate::types::ChunkId;

struct DocEntry {
    terms: FxHashMap<String, u32>,
    len: u32,
}

pub struct Bm25Index {
    params: Bm25Params,
    tokenizer: Arc<dyn Tokenizer>,
    docs: FxHashMap<ChunkId, DocEntry>,
    doc_freq: FxHashMap<String, u32>,
    total_len: u64,
    generation: u64,
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new(Bm25Params::default(), Arc::new(UnicodeTokenizer))
    }
}

impl Bm25Index {
    pub fn new(params: Bm25Params, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            params,
            tokenizer,
            docs: FxHashMap::default(),
            doc_freq: FxHashMap::default(),
            total_len: 0,
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Number of distinct terms across the corpus.
    pub fn term_count(&self) -> usize {
        self.doc_freq.len()
    }

    /// Bumped on every mutation. A query that records the generation while
    /// scoring can detect a concurrent rebuild before trusting the scores.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Index one chunk's content. Re-adding an id replaces its previous
    /// statistics (upsert), keeping document frequencies consistent.
    pub fn add(&mut self, id: ChunkId, content: &str) {
        if self.docs.contains_key(&id) {
            self.remove(&[id]);
        }
        let tokens = self.tokenizer.tokenize(content);
        let mut terms: FxHashMap<String, u32> = FxHashMap::default();
        for token in &tokens {
            *terms.entry(token.clone()).or_insert(0) += 1;
        }
        for term in terms.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        let len = tokens.len() as u32;
        self.total_len += u64::from(len);
        self.docs.insert(id, DocEntry { terms, len });
        self.generation += 1;
    }

    pub fn add_all<'a>(&mut self, entries: impl IntoIterator<Item = (ChunkId, &'a str)>) {
        for (id, content) in entries {
            self.add(id, content);
        }
    }

    /// Remove chunks from the statistics, decrementing document frequencies
    /// so a deleted document stops influencing IDF. Unknown ids are ignored.
    /// Returns the number of chunks actually removed.
    pub fn remove(&mut self, ids: &[ChunkId]) -> usize {
        let mut removed = 0;
        for id in ids {
            let Some(entry) = self.docs.remove(id) else {
                continue;
            };
            for term in entry.terms.keys() {
                if let Some(df) = self.doc_freq.get_mut(term) {
                    *df -= 1;
                    if *df == 0 {
                        self.doc_freq.remove(term);
                    }
                }
            }
            self.total_len -= u64::from(entry.len);
            removed += 1;
        }
        if removed > 0 {
            self.generation += 1;
        }
        removed
    }

    fn avgdl(&self) -> f32 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_len as f32 / self.docs.len() as f32
        }
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.docs.len() as f32;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Score chunks against a query, optionally restricted to a candidate
    /// set. Only chunks with a positive score appear in the result; a query
    /// with no terms after tokenization yields an empty map.
    pub fn score(
        &self,
        query: &str,
        candidates: Option<&HashSet<ChunkId>>,
    ) -> FxHashMap<ChunkId, f32> {
        let mut scores = FxHashMap::default();
        let query_terms = self.tokenizer.tokenize(query);
        if query_terms.is_empty() || self.docs.is_empty() {
            return scores;
        }
        let avgdl = self.avgdl();
        let Bm25Params { k1, b } = self.params;

        let mut score_one = |id: ChunkId, entry: &DocEntry| {
            if entry.len == 0 {
                return;
            }
            let mut score = 0.0f32;
            for term in &query_terms {
                let tf = entry.terms.get(term).copied().unwrap_or(0) as f32;
                if tf == 0.0 {
                    continue;
                }
                let idf = self.idf(term);
                let numerator = idf * tf * (k1 + 1.0);
                let denominator = tf + k1 * (1.0 - b + b * (entry.len as f32 / avgdl));
                score += numerator / denominator;
            }
            if score > 0.0 {
                scores.insert(id, score);
            }
        };

        match candidates {
            Some(ids) => {
                for id in ids {
                    if let Some(entry) = self.docs.get(id) {
                        score_one(*id, entry);
                    }
                }
            }
            None => {
                for (id, entry) in &self.docs {
                    score_one(*id, entry);
                }
            }
        }
        scores
    }
}
