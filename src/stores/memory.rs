//! Exact-scan in-memory vector store.
//!
//! Default backend and the test double for every store-facing code path.
//! Search is a brute-force L2 scan over all rows, which is exact and plenty
//! fast for the corpus sizes a single process embeds in memory.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use async_trait::async_trait;

use super::{ChunkRecord, FilterExpr, VectorHit, VectorStore};
use crate::types::{ChunkId, KbError};

struct Row {
    record: ChunkRecord,
    embedding: Vec<f32>,
}

struct Inner {
    rows: FxHashMap<ChunkId, Row>,
    /// Fixed by the first insert; all later embeddings must match.
    dim: Option<usize>,
}

/// In-memory [`VectorStore`] with exact L2 search.
pub struct InMemoryVectorStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                rows: FxHashMap::default(),
                dim: None,
            }),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a lost backend: while set, every operation returns
    /// [`KbError::StoreUnavailable`]. Test hook.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), KbError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(KbError::StoreUnavailable("in-memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, records: Vec<(ChunkRecord, Vec<f32>)>) -> Result<(), KbError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        for (record, embedding) in records {
            match inner.dim {
                None => inner.dim = Some(embedding.len()),
                Some(dim) if dim != embedding.len() => {
                    return Err(KbError::Embedding(format!(
                        "dimension mismatch: store holds {dim}, got {}",
                        embedding.len()
                    )));
                }
                Some(_) => {}
            }
            inner.rows.insert(record.id, Row { record, embedding });
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<VectorHit>, KbError> {
        self.check_available()?;
        let inner = self.inner.read();
        if let Some(dim) = inner.dim {
            if query.len() != dim {
                return Err(KbError::Embedding(format!(
                    "query dimension {} does not match store dimension {dim}",
                    query.len()
                )));
            }
        }
        let mut hits: Vec<VectorHit> = inner
            .rows
            .values()
            .filter(|row| filter.map_or(true, |f| f.matches(&row.record)))
            .map(|row| VectorHit {
                id: row.record.id,
                distance: l2_distance(query, &row.embedding),
                record: row.record.clone(),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn fetch(&self, id: ChunkId) -> Result<Option<ChunkRecord>, KbError> {
        self.check_available()?;
        Ok(self.inner.read().rows.get(&id).map(|row| row.record.clone()))
    }

    async fn fetch_by_path(&self, file_path: &str) -> Result<Vec<ChunkRecord>, KbError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut records: Vec<ChunkRecord> = inner
            .rows
            .values()
            .filter(|row| row.record.file_path == file_path)
            .map(|row| row.record.clone())
            .collect();
        records.sort_by_key(|r| r.chunk_index);
        Ok(records)
    }

    async fn delete_by_path(&self, file_path: &str) -> Result<Vec<ChunkId>, KbError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let doomed: Vec<ChunkId> = inner
            .rows
            .values()
            .filter(|row| row.record.file_path == file_path)
            .map(|row| row.record.id)
            .collect();
        for id in &doomed {
            inner.rows.remove(id);
        }
        Ok(doomed)
    }

    async fn count(&self) -> Result<usize, KbError> {
        self.check_available()?;
        Ok(self.inner.read().rows.len())
    }

    async fn list_paths(&self) -> Result<Vec<String>, KbError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut paths: Vec<String> = inner
            .rows
            .values()
            .map(|row| row.record.file_path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::ChunkType;

    fn record(id: u64, path: &str) -> ChunkRecord {
        ChunkRecord {
            id: ChunkId(id),
            content: format!("chunk {id}"),
            content_type: "text".into(),
            chunk_type: ChunkType::Paragraph,
            level: 2,
            parent_id: None,
            file_path: path.into(),
            chunk_index: id as usize,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn search_orders_by_distance_ascending() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![
                (record(1, "a.md"), vec![0.0, 0.0]),
                (record(2, "a.md"), vec![1.0, 0.0]),
                (record(3, "a.md"), vec![3.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store.search(&[0.9, 0.0], 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, ChunkId(2));
        assert_eq!(hits[1].id, ChunkId(1));
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn filter_restricts_search_and_fetch() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![
                (record(1, "a.md"), vec![0.0]),
                (record(2, "b.md"), vec![0.1]),
            ])
            .await
            .unwrap();

        let filter = FilterExpr::eq("file_path", "b.md");
        let hits = store.search(&[0.0], 10, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, ChunkId(2));

        let rows = store.fetch_by_path("a.md").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, ChunkId(1));
    }

    #[tokio::test]
    async fn insert_is_idempotent_by_id() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![(record(1, "a.md"), vec![0.0])])
            .await
            .unwrap();
        let mut updated = record(1, "a.md");
        updated.content = "rewritten".into();
        store.insert(vec![(updated, vec![0.5])]).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let fetched = store.fetch(ChunkId(1)).await.unwrap().unwrap();
        assert_eq!(fetched.content, "rewritten");
    }

    #[tokio::test]
    async fn dimension_is_fixed_by_first_insert() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![(record(1, "a.md"), vec![0.0, 1.0])])
            .await
            .unwrap();
        let err = store
            .insert(vec![(record(2, "a.md"), vec![0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::Embedding(_)));
    }

    #[tokio::test]
    async fn delete_by_path_reports_removed_ids() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![
                (record(1, "a.md"), vec![0.0]),
                (record(2, "a.md"), vec![0.1]),
                (record(3, "b.md"), vec![0.2]),
            ])
            .await
            .unwrap();

        let mut deleted = store.delete_by_path("a.md").await.unwrap();
        deleted.sort();
        assert_eq!(deleted, vec![ChunkId(1), ChunkId(2)]);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.list_paths().await.unwrap(), vec!["b.md".to_string()]);
    }

    #[tokio::test]
    async fn unavailable_store_errors_every_call() {
        let store = InMemoryVectorStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.search(&[0.0], 1, None).await.unwrap_err(),
            KbError::StoreUnavailable(_)
        ));
        assert!(matches!(
            store.count().await.unwrap_err(),
            KbError::StoreUnavailable(_)
        ));
        store.set_unavailable(false);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
