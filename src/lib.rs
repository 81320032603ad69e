//! ```text
//! Fragments ──► hierarchy::TreeBuilder ──► ChunkTree
//!                                            │
//!                        ┌───────────────────┤
//!                        ▼                   ▼
//!              embeddings::EmbeddingProvider │
//!                        │                   │
//!                        ▼                   ▼
//!              stores::VectorStore   lexical::Bm25Index
//!                        │                   │
//!                        └──► fusion::fuse ◄─┘
//!                                  │
//!                                  ▼
//!                         expand::expand ──► RetrievalResult
//! ```
//!
//! One [`KnowledgeBase`] value ties the pipeline together: documents go in
//! as heading/paragraph fragments, come back out as a ranked list of chunks
//! with their surrounding document structure attached.

pub mod embeddings;
pub mod expand;
pub mod fusion;
pub mod hierarchy;
pub mod knowledge_base;
pub mod lexical;
pub mod stores;
pub mod types;

pub use embeddings::{EmbeddingProvider, MockEmbeddingProvider};
pub use expand::ExpandOptions;
pub use fusion::{FusedHit, FusionConfig};
pub use hierarchy::{Chunk, ChunkTree, ChunkType, Fragment, HeadingHint, TreeBuilder, TreeConfig};
pub use knowledge_base::{IngestSummary, KbStats, KnowledgeBase, QueryRequest, QueryResponse};
pub use lexical::{Bm25Index, Bm25Params, Tokenizer, UnicodeTokenizer};
pub use stores::{
    ChunkRecord, FilterExpr, InMemoryVectorStore, RetrievalResult, SqliteVectorStore, VectorHit,
    VectorStore,
};
pub use types::{CancelToken, ChunkId, ChunkIdGen, KbError};
