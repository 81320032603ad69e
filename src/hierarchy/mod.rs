//! Chunk tree data model.
//!
//! A document decomposes into a rooted tree of [`Chunk`]s held in an arena
//! (a flat map from [`ChunkId`] to chunk). Parent/child relationships are id
//! references, never direct object links, so the structure survives
//! serialization to a vector store and concurrent read access without
//! aliasing concerns.

pub mod builder;

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::types::ChunkId;

pub use builder::{Fragment, HeadingHint, TreeBuilder, TreeConfig, MAX_HEADING_DEPTH};

/// Structural role of a chunk, assigned from source heading depth at
/// creation and immutable thereafter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Document,
    Section,
    Subsection,
    Paragraph,
}

impl ChunkType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkType::Document => "document",
            ChunkType::Section => "section",
            ChunkType::Subsection => "subsection",
            ChunkType::Paragraph => "paragraph",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "document" => Some(ChunkType::Document),
            "section" => Some(ChunkType::Section),
            "subsection" => Some(ChunkType::Subsection),
            "paragraph" => Some(ChunkType::Paragraph),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open string-keyed metadata attached to a chunk.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// The atomic retrievable unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub content: String,
    pub chunk_type: ChunkType,
    /// Depth in the tree; the document root is level 0 and every child is
    /// exactly `parent.level + 1`.
    pub level: u32,
    /// `None` only for the document root.
    pub parent_id: Option<ChunkId>,
    /// Insertion order equals document order. Mutated only by the tree
    /// builder; immutable once the document is finalized.
    pub children_ids: Vec<ChunkId>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A finalized document tree: arena plus root.
///
/// Construction goes through [`TreeBuilder`]; once built, the tree is
/// read-only.
#[derive(Clone, Debug)]
pub struct ChunkTree {
    arena: FxHashMap<ChunkId, Chunk>,
    root: ChunkId,
    order: Vec<ChunkId>,
}

impl ChunkTree {
    pub(crate) fn from_parts(arena: FxHashMap<ChunkId, Chunk>, root: ChunkId, order: Vec<ChunkId>) -> Self {
        Self { arena, root, order }
    }

    pub fn root(&self) -> &Chunk {
        &self.arena[&self.root]
    }

    pub fn root_id(&self) -> ChunkId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.arena.get(&id)
    }

    /// Children of `id` in document order. Missing ids are skipped.
    pub fn children_of(&self, id: ChunkId) -> Vec<&Chunk> {
        self.get(id)
            .map(|chunk| {
                chunk
                    .children_ids
                    .iter()
                    .filter_map(|cid| self.arena.get(cid))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parent_of(&self, id: ChunkId) -> Option<&Chunk> {
        self.get(id)
            .and_then(|chunk| chunk.parent_id)
            .and_then(|pid| self.arena.get(&pid))
    }

    /// Siblings of `id` (same parent, `id` excluded), in document order.
    pub fn siblings_of(&self, id: ChunkId) -> Vec<&Chunk> {
        self.parent_of(id)
            .map(|parent| {
                parent
                    .children_ids
                    .iter()
                    .filter(|cid| **cid != id)
                    .filter_map(|cid| self.arena.get(cid))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ancestors of `id` from its parent up to the root.
    pub fn ancestors_of(&self, id: ChunkId) -> Vec<&Chunk> {
        let mut out = Vec::new();
        let mut cursor = self.parent_of(id);
        while let Some(chunk) = cursor {
            out.push(chunk);
            cursor = chunk.parent_id.and_then(|pid| self.arena.get(&pid));
        }
        out
    }

    /// Pre-order traversal of the tree.
    ///
    /// For a tree produced by [`TreeBuilder`] this equals the original
    /// fragment order, which is what gets indexed and persisted.
    pub fn flatten(&self) -> Vec<&Chunk> {
        let mut out = Vec::with_capacity(self.arena.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some(chunk) = self.arena.get(&id) {
                out.push(chunk);
                // Reverse so the leftmost child is visited first.
                for cid in chunk.children_ids.iter().rev() {
                    stack.push(*cid);
                }
            }
        }
        out
    }

    /// Insertion order recorded during the build. Used to cross-check the
    /// pre-order traversal in tests.
    pub fn insertion_order(&self) -> &[ChunkId] {
        &self.order
    }
}
