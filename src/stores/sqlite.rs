//! SQLite-backed vector store using the `sqlite-vec` extension.
//!
//! Rows live in a single `chunks` table with TEXT columns plus the embedding
//! serialized as a JSON array; `vec_f32` parses it on the fly and
//! `vec_distance_L2` ranks candidates inside SQLite. The corpus embedding
//! dimension is pinned in a small `kb_meta` table at first insert.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use tokio_rusqlite::{Connection, OptionalExtension, ffi};

use super::{ChunkRecord, FilterExpr, VectorHit, VectorStore};
use crate::hierarchy::ChunkType;
use crate::types::{ChunkId, KbError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    content TEXT,
    content_type TEXT,
    chunk_type TEXT,
    level TEXT,
    parent_id TEXT,
    file_path TEXT,
    chunk_index TEXT,
    metadata TEXT,
    embedding TEXT
);
CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path);
CREATE TABLE IF NOT EXISTS kb_meta (key TEXT PRIMARY KEY, value TEXT);
";

/// Columns of `chunks` in the order every SELECT in this module uses.
const RECORD_COLUMNS: &str =
    "id, content, content_type, chunk_type, level, parent_id, file_path, chunk_index, metadata";

/// Stored `parent_id` for root chunks, which have no parent.
const NO_PARENT: &str = "-1";

pub struct SqliteVectorStore {
    conn: Connection,
}

impl SqliteVectorStore {
    /// Open (or create) the database at `path`. Failure to open or to load
    /// the vector extension is [`KbError::StoreUnavailable`].
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, KbError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open(path)
            .await
            .map_err(|err| KbError::StoreUnavailable(err.to_string()))?;
        conn.call(|conn| {
            let result = conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0));
            match result {
                Ok(_) => Ok(()),
                Err(err) => Err(tokio_rusqlite::Error::Rusqlite(err)),
            }
        })
        .await
        .map_err(|err| KbError::StoreUnavailable(err.to_string()))?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)
                .map_err(tokio_rusqlite::Error::Rusqlite)
        })
        .await
        .map_err(storage_err)?;
        Ok(Self { conn })
    }

    fn register_sqlite_vec() -> Result<(), KbError> {
        use std::sync::Mutex;

        static INIT: Once = Once::new();
        static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

        INIT.call_once(|| {
            let result = unsafe {
                type SqliteExtensionInit = unsafe extern "C" fn(
                    *mut ffi::sqlite3,
                    *mut *mut c_char,
                    *const ffi::sqlite3_api_routines,
                ) -> i32;

                let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
                let init_fn: SqliteExtensionInit =
                    transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
                let rc = ffi::sqlite3_auto_extension(Some(init_fn));
                if rc != 0 {
                    Err(format!(
                        "failed to register sqlite-vec extension (code {rc})"
                    ))
                } else {
                    Ok(())
                }
            };
            if let Ok(mut slot) = INIT_RESULT.lock() {
                *slot = Some(result);
            }
        });

        match INIT_RESULT.lock() {
            Ok(slot) => match slot.clone() {
                Some(result) => result.map_err(KbError::StoreUnavailable),
                None => Err(KbError::StoreUnavailable(
                    "sqlite-vec registration ran but recorded no result".into(),
                )),
            },
            Err(_) => Err(KbError::StoreUnavailable(
                "sqlite-vec registration state poisoned".into(),
            )),
        }
    }
}

fn storage_err(err: tokio_rusqlite::Error) -> KbError {
    KbError::Storage(err.to_string())
}

/// Map one row in `RECORD_COLUMNS` order. Numeric columns are stored as
/// TEXT; unparseable values degrade to zero rather than failing the row.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let parent_raw: String = row.get(5)?;
    let parent_id = if parent_raw == NO_PARENT {
        None
    } else {
        parent_raw.parse::<u64>().ok().map(ChunkId)
    };
    Ok(ChunkRecord {
        id: ChunkId(row.get::<_, String>(0)?.parse().unwrap_or(0)),
        content: row.get(1)?,
        content_type: row.get(2)?,
        chunk_type: ChunkType::parse(&row.get::<_, String>(3)?).unwrap_or(ChunkType::Paragraph),
        level: row.get::<_, String>(4)?.parse().unwrap_or(0),
        parent_id,
        file_path: row.get(6)?,
        chunk_index: row.get::<_, String>(7)?.parse().unwrap_or(0),
        metadata: row
            .get::<_, String>(8)
            .map(|s| serde_json::from_str(&s).unwrap_or_default())
            .unwrap_or_default(),
    })
}

fn escape_sql_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// Compile a filter to a SQL predicate. Every column is TEXT, so numeric
/// values compare as their decimal rendering. Unknown fields compile to a
/// predicate that matches nothing, mirroring the in-memory evaluator.
fn filter_to_sql(filter: &FilterExpr) -> String {
    match filter {
        FilterExpr::And(exprs) => {
            if exprs.is_empty() {
                "1 = 1".to_string()
            } else {
                let parts: Vec<String> = exprs.iter().map(filter_to_sql).collect();
                format!("({})", parts.join(" AND "))
            }
        }
        FilterExpr::Eq { field, value } => {
            let column = match field.as_str() {
                "file_path" | "chunk_type" | "content_type" | "level" | "parent_id"
                | "chunk_index" => field.as_str(),
                _ => return "0 = 1".to_string(),
            };
            let rendered = match value {
                serde_json::Value::String(s) => escape_sql_literal(s),
                serde_json::Value::Number(n) => escape_sql_literal(&n.to_string()),
                other => escape_sql_literal(&other.to_string()),
            };
            format!("{column} = {rendered}")
        }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn insert(&self, records: Vec<(ChunkRecord, Vec<f32>)>) -> Result<(), KbError> {
        if records.is_empty() {
            return Ok(());
        }
        let dim = records[0].1.len();
        if let Some((record, embedding)) = records.iter().find(|(_, e)| e.len() != dim) {
            return Err(KbError::Embedding(format!(
                "chunk {} has dimension {}, batch leads with {dim}",
                record.id,
                embedding.len()
            )));
        }

        let mismatch = self
            .conn
            .call(move |conn| {
                let stored: Option<String> = conn
                    .query_row("SELECT value FROM kb_meta WHERE key = 'dim'", [], |row| {
                        row.get(0)
                    })
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                match stored.and_then(|s| s.parse::<usize>().ok()) {
                    Some(existing) if existing != dim => return Ok(Some(existing)),
                    Some(_) => {}
                    None => {
                        let dim_s = dim.to_string();
                        conn.execute(
                            "INSERT OR REPLACE INTO kb_meta (key, value) VALUES ('dim', ?)",
                            [&dim_s],
                        )
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    }
                }

                let tx = conn.transaction().map_err(tokio_rusqlite::Error::Rusqlite)?;
                {
                    let mut stmt = tx
                        .prepare(
                            "INSERT OR REPLACE INTO chunks \
                             (id, content, content_type, chunk_type, level, parent_id, \
                              file_path, chunk_index, metadata, embedding) \
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        )
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    for (record, embedding) in &records {
                        let id = record.id.to_string();
                        let chunk_type = record.chunk_type.to_string();
                        let level = record.level.to_string();
                        let parent = record
                            .parent_id
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| NO_PARENT.to_string());
                        let index = record.chunk_index.to_string();
                        let metadata = record.metadata.to_string();
                        let embedding_json =
                            serde_json::to_string(embedding).unwrap_or_else(|_| "[]".into());
                        stmt.execute([
                            &id,
                            &record.content,
                            &record.content_type,
                            &chunk_type,
                            &level,
                            &parent,
                            &record.file_path,
                            &index,
                            &metadata,
                            &embedding_json,
                        ])
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    }
                }
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(None)
            })
            .await
            .map_err(storage_err)?;

        match mismatch {
            Some(existing) => Err(KbError::Embedding(format!(
                "dimension mismatch: store holds {existing}, got {dim}"
            ))),
            None => Ok(()),
        }
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<VectorHit>, KbError> {
        let query_json =
            serde_json::to_string(query).map_err(|err| KbError::Storage(err.to_string()))?;
        let where_clause = filter
            .map(|f| format!("WHERE {}", filter_to_sql(f)))
            .unwrap_or_default();
        let sql = format!(
            "SELECT {RECORD_COLUMNS}, \
             vec_distance_L2(vec_f32(embedding), vec_f32(?)) AS distance \
             FROM chunks {where_clause} \
             ORDER BY distance ASC, CAST(id AS INTEGER) ASC \
             LIMIT {top_k}"
        );

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&query_json], |row| {
                        let record = row_to_record(row)?;
                        let distance: f32 = row.get(9)?;
                        Ok(VectorHit {
                            id: record.id,
                            distance,
                            record,
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;

                let mut hits = Vec::new();
                for row in rows {
                    hits.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(hits)
            })
            .await
            .map_err(storage_err)
    }

    async fn fetch(&self, id: ChunkId) -> Result<Option<ChunkRecord>, KbError> {
        let id_s = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {RECORD_COLUMNS} FROM chunks WHERE id = ?"))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                stmt.query_row([&id_s], row_to_record)
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(storage_err)
    }

    async fn fetch_by_path(&self, file_path: &str) -> Result<Vec<ChunkRecord>, KbError> {
        let path = file_path.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {RECORD_COLUMNS} FROM chunks WHERE file_path = ? \
                         ORDER BY CAST(chunk_index AS INTEGER) ASC"
                    ))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&path], row_to_record)
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(records)
            })
            .await
            .map_err(storage_err)
    }

    async fn delete_by_path(&self, file_path: &str) -> Result<Vec<ChunkId>, KbError> {
        let path = file_path.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT id FROM chunks WHERE file_path = ?")
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&path], |row| row.get::<_, String>(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut ids = Vec::new();
                for row in rows {
                    let raw = row.map_err(tokio_rusqlite::Error::Rusqlite)?;
                    if let Ok(id) = raw.parse::<u64>() {
                        ids.push(ChunkId(id));
                    }
                }
                conn.execute("DELETE FROM chunks WHERE file_path = ?", [&path])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(ids)
            })
            .await
            .map_err(storage_err)
    }

    async fn count(&self) -> Result<usize, KbError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(count as usize)
            })
            .await
            .map_err(storage_err)
    }

    async fn list_paths(&self) -> Result<Vec<String>, KbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT DISTINCT file_path FROM chunks ORDER BY file_path")
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut paths = Vec::new();
                for row in rows {
                    paths.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(paths)
            })
            .await
            .map_err(storage_err)
    }
}
