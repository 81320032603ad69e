//! Turns an ordered fragment sequence into a validated chunk tree.
//!
//! The builder keeps a stack of "open" ancestor chunks. Headings pop the
//! stack down to their own depth and attach to the new top; paragraphs
//! attach to the deepest open chunk. Malformed heading structure never
//! blocks ingestion: over-deep headings are clamped (with the original depth
//! recorded in metadata) and a synthetic document root is created when the
//! source provides none.

use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use unicode_segmentation::UnicodeSegmentation;

use super::{Chunk, ChunkTree, ChunkType, Metadata};
use crate::types::{ChunkId, ChunkIdGen, KbError};

/// Deepest heading depth a source may claim; anything deeper is clamped.
pub const MAX_HEADING_DEPTH: u8 = 4;

/// Heading-level hint carried by an extracted fragment.
///
/// `Heading(0)` is the document title; increasing values mean deeper
/// sections. `Paragraph` means "plain text, attach to the nearest open
/// section".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadingHint {
    Heading(u8),
    Paragraph,
}

/// One raw text fragment from the document extractor.
#[derive(Clone, Debug)]
pub struct Fragment {
    pub text: String,
    pub hint: HeadingHint,
}

impl Fragment {
    pub fn heading(text: impl Into<String>, depth: u8) -> Self {
        Self {
            text: text.into(),
            hint: HeadingHint::Heading(depth),
        }
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hint: HeadingHint::Paragraph,
        }
    }
}

/// Size bounds for the built chunks.
#[derive(Clone, Debug)]
pub struct TreeConfig {
    /// Paragraphs longer than this (in characters) are split into sibling
    /// chunks at sentence boundaries.
    pub max_chunk_len: usize,
    /// Paragraph fragments shorter than this are dropped. Defaults to 0:
    /// only whitespace-empty fragments are discarded.
    pub min_chunk_len: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_chunk_len: 500,
            min_chunk_len: 0,
        }
    }
}

/// Builds one [`ChunkTree`] per source document.
#[derive(Clone, Debug, Default)]
pub struct TreeBuilder {
    config: TreeConfig,
}

/// Structural rank of an open chunk on the builder stack.
/// Document = 0, Section = 1, Subsection = 2.
fn heading_rank(depth: u8) -> (ChunkType, u8) {
    match depth {
        0 => (ChunkType::Document, 0),
        1 | 2 => (ChunkType::Section, 1),
        _ => (ChunkType::Subsection, 2),
    }
}

impl TreeBuilder {
    pub fn new(config: TreeConfig) -> Self {
        Self { config }
    }

    /// Build a tree from an ordered fragment sequence.
    ///
    /// `name` labels the synthetic root when the source has no level-0
    /// heading. Ids come from the shared generator so concurrent builds
    /// never collide.
    pub fn build(
        &self,
        name: &str,
        fragments: &[Fragment],
        ids: &ChunkIdGen,
    ) -> Result<ChunkTree, KbError> {
        let mut arena: FxHashMap<ChunkId, Chunk> = FxHashMap::default();
        let mut order: Vec<ChunkId> = Vec::new();
        // (id, structural rank) of currently open ancestors, root first.
        let mut stack: Vec<(ChunkId, u8)> = Vec::new();
        let mut root: Option<ChunkId> = None;

        let mut push_chunk = |arena: &mut FxHashMap<ChunkId, Chunk>,
                              order: &mut Vec<ChunkId>,
                              content: String,
                              chunk_type: ChunkType,
                              parent: Option<(ChunkId, u32)>,
                              metadata: Metadata|
         -> ChunkId {
            let id = ids.next_id();
            let (parent_id, level) = match parent {
                Some((pid, plevel)) => (Some(pid), plevel + 1),
                None => (None, 0),
            };
            if let Some(pid) = parent_id {
                if let Some(p) = arena.get_mut(&pid) {
                    p.children_ids.push(id);
                }
            }
            arena.insert(
                id,
                Chunk {
                    id,
                    content,
                    chunk_type,
                    level,
                    parent_id,
                    children_ids: Vec::new(),
                    metadata,
                },
            );
            order.push(id);
            id
        };

        for (ordinal, fragment) in fragments.iter().enumerate() {
            let text = fragment.text.trim();
            if text.is_empty() {
                continue;
            }

            match fragment.hint {
                HeadingHint::Heading(depth) => {
                    let clamped_from = (depth > MAX_HEADING_DEPTH).then_some(depth);
                    let depth = depth.min(MAX_HEADING_DEPTH);
                    if let Some(orig) = clamped_from {
                        warn!(ordinal, from = orig, to = depth, "clamped over-deep heading");
                    }
                    let (mut chunk_type, mut rank) = heading_rank(depth);

                    let mut metadata = Metadata::new();
                    metadata.insert("heading_level".into(), depth.into());
                    if let Some(orig) = clamped_from {
                        metadata.insert("clamped_from".into(), orig.into());
                    }

                    if rank == 0 {
                        if root.is_none() {
                            let id = push_chunk(
                                &mut arena,
                                &mut order,
                                text.to_string(),
                                ChunkType::Document,
                                None,
                                metadata,
                            );
                            root = Some(id);
                            stack.clear();
                            stack.push((id, 0));
                            continue;
                        }
                        // One root per document: later title-level headings
                        // become sections under the existing root.
                        metadata.insert("demoted_from_root".into(), true.into());
                        chunk_type = ChunkType::Section;
                        rank = 1;
                    }

                    while stack.last().is_some_and(|(_, r)| *r >= rank) {
                        stack.pop();
                    }
                    if stack.is_empty() {
                        let rid = Self::ensure_root(
                            name, ids, &mut arena, &mut order, &mut root,
                        );
                        stack.push((rid, 0));
                    }
                    let (pid, _) = *stack.last().ok_or_else(|| {
                        KbError::Structure("ancestor stack empty after root creation".into())
                    })?;
                    let plevel = arena[&pid].level;
                    let id = push_chunk(
                        &mut arena,
                        &mut order,
                        text.to_string(),
                        chunk_type,
                        Some((pid, plevel)),
                        metadata,
                    );
                    stack.push((id, rank));
                }
                HeadingHint::Paragraph => {
                    if text.chars().count() < self.config.min_chunk_len {
                        continue;
                    }
                    if stack.is_empty() {
                        let rid = Self::ensure_root(
                            name, ids, &mut arena, &mut order, &mut root,
                        );
                        stack.push((rid, 0));
                    }
                    let (pid, _) = *stack.last().ok_or_else(|| {
                        KbError::Structure("ancestor stack empty after root creation".into())
                    })?;
                    let plevel = arena[&pid].level;
                    let pieces = split_long_text(text, self.config.max_chunk_len);
                    let split = pieces.len() > 1;
                    for piece in pieces {
                        let mut metadata = Metadata::new();
                        if split {
                            metadata.insert("split_of".into(), ordinal.into());
                        }
                        push_chunk(
                            &mut arena,
                            &mut order,
                            piece,
                            ChunkType::Paragraph,
                            Some((pid, plevel)),
                            metadata,
                        );
                    }
                }
            }
        }

        let root = root.ok_or_else(|| {
            KbError::Structure("document produced no content after trimming".into())
        })?;
        debug!(chunks = arena.len(), "built chunk tree");

        let tree = ChunkTree::from_parts(arena, root, order);
        validate(&tree)?;
        Ok(tree)
    }

    fn ensure_root(
        name: &str,
        ids: &ChunkIdGen,
        arena: &mut FxHashMap<ChunkId, Chunk>,
        order: &mut Vec<ChunkId>,
        root: &mut Option<ChunkId>,
    ) -> ChunkId {
        if let Some(rid) = *root {
            return rid;
        }
        let id = ids.next_id();
        let mut metadata = Metadata::new();
        metadata.insert("synthetic_root".into(), true.into());
        arena.insert(
            id,
            Chunk {
                id,
                content: format!("Document: {name}"),
                chunk_type: ChunkType::Document,
                level: 0,
                parent_id: None,
                children_ids: Vec::new(),
                metadata,
            },
        );
        order.push(id);
        *root = Some(id);
        id
    }
}

/// Split text into pieces no longer than `max` characters, breaking at
/// sentence boundaries and falling back to word boundaries for a single
/// over-long sentence. Never splits mid-word; a single word longer than
/// `max` stays intact.
fn split_long_text(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    if text.chars().count() <= max {
        return vec![text.to_string()];
    }

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    let mut flush = |current: &mut String, current_len: &mut usize, pieces: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            pieces.push(trimmed.to_string());
        }
        current.clear();
        *current_len = 0;
    };

    for sentence in text.unicode_sentences() {
        let sentence_len = sentence.chars().count();
        if sentence_len > max {
            // Oversized sentence: pack word by word.
            for word in sentence.split_word_bounds() {
                let word_len = word.chars().count();
                if current_len + word_len > max && current_len > 0 {
                    flush(&mut current, &mut current_len, &mut pieces);
                }
                current.push_str(word);
                current_len += word_len;
            }
        } else if current_len + sentence_len > max && current_len > 0 {
            flush(&mut current, &mut current_len, &mut pieces);
            current.push_str(sentence);
            current_len = sentence_len;
        } else {
            current.push_str(sentence);
            current_len += sentence_len;
        }
    }
    flush(&mut current, &mut current_len, &mut pieces);

    pieces
}

/// Check the tree invariant: every non-root chunk has a parent exactly one
/// level above it, and every child link points back.
fn validate(tree: &ChunkTree) -> Result<(), KbError> {
    for chunk in tree.flatten() {
        match chunk.parent_id {
            None => {
                if chunk.id != tree.root_id() {
                    return Err(KbError::Structure(format!(
                        "chunk {} has no parent but is not the root",
                        chunk.id
                    )));
                }
            }
            Some(pid) => {
                let parent = tree.get(pid).ok_or_else(|| {
                    KbError::Structure(format!("chunk {} has dangling parent {pid}", chunk.id))
                })?;
                if chunk.level != parent.level + 1 {
                    return Err(KbError::Structure(format!(
                        "chunk {} at level {} under parent at level {}",
                        chunk.id, chunk.level, parent.level
                    )));
                }
                if !parent.children_ids.contains(&chunk.id) {
                    return Err(KbError::Structure(format!(
                        "parent {pid} does not list chunk {} as a child",
                        chunk.id
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkIdGen;

    fn build(fragments: &[Fragment]) -> ChunkTree {
        TreeBuilder::default()
            .build("test-doc", fragments, &ChunkIdGen::new())
            .unwrap()
    }

    #[test]
    fn title_section_paragraph_nesting() {
        // Scenario: a titled document with one section and one paragraph.
        let tree = build(&[
            Fragment::heading("Doc Title", 0),
            Fragment::heading("Intro", 1),
            Fragment::paragraph("This is the intro text."),
        ]);

        assert_eq!(tree.len(), 3);
        let flat = tree.flatten();
        let title = flat[0];
        let intro = flat[1];
        let para = flat[2];
        assert_eq!(title.content, "Doc Title");
        assert_eq!(title.chunk_type, ChunkType::Document);
        assert_eq!(intro.parent_id, Some(title.id));
        assert_eq!(para.parent_id, Some(intro.id));
        assert_eq!(para.chunk_type, ChunkType::Paragraph);
    }

    #[test]
    fn levels_increase_by_one() {
        let tree = build(&[
            Fragment::heading("T", 0),
            Fragment::heading("S", 1),
            Fragment::heading("SS", 3),
            Fragment::paragraph("Deep paragraph."),
        ]);
        for chunk in tree.flatten() {
            if let Some(parent) = tree.parent_of(chunk.id) {
                assert_eq!(chunk.level, parent.level + 1);
            } else {
                assert_eq!(chunk.level, 0);
            }
        }
    }

    #[test]
    fn no_headings_yields_synthetic_root() {
        let tree = build(&[
            Fragment::paragraph("Alpha."),
            Fragment::paragraph("Beta."),
        ]);
        assert_eq!(tree.len(), 3);
        let root = tree.root();
        assert_eq!(root.chunk_type, ChunkType::Document);
        assert_eq!(root.content, "Document: test-doc");
        assert_eq!(root.metadata.get("synthetic_root"), Some(&true.into()));
        assert_eq!(root.children_ids.len(), 2);
    }

    #[test]
    fn empty_fragments_are_dropped() {
        let tree = build(&[
            Fragment::heading("T", 0),
            Fragment::paragraph("   "),
            Fragment::paragraph("\n\t"),
            Fragment::paragraph("Real content."),
        ]);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn all_empty_input_is_a_structure_error() {
        let err = TreeBuilder::default()
            .build("x", &[Fragment::paragraph("  ")], &ChunkIdGen::new())
            .unwrap_err();
        assert!(matches!(err, KbError::Structure(_)));
    }

    #[test]
    fn over_deep_heading_is_clamped_not_rejected() {
        let tree = build(&[
            Fragment::heading("T", 0),
            Fragment::heading("Way too deep", 9),
            Fragment::paragraph("Body."),
        ]);
        let flat = tree.flatten();
        let deep = flat[1];
        assert_eq!(deep.chunk_type, ChunkType::Subsection);
        assert_eq!(deep.metadata.get("clamped_from"), Some(&9u8.into()));
        // Ingestion continued past the malformed heading.
        assert_eq!(flat[2].parent_id, Some(deep.id));
    }

    #[test]
    fn second_title_is_demoted_to_section() {
        let tree = build(&[
            Fragment::heading("First", 0),
            Fragment::heading("Second", 0),
        ]);
        let flat = tree.flatten();
        assert_eq!(flat[0].chunk_type, ChunkType::Document);
        assert_eq!(flat[1].chunk_type, ChunkType::Section);
        assert_eq!(flat[1].parent_id, Some(flat[0].id));
    }

    #[test]
    fn sibling_headings_pop_the_stack() {
        let tree = build(&[
            Fragment::heading("T", 0),
            Fragment::heading("A", 1),
            Fragment::heading("A.1", 3),
            Fragment::heading("B", 1),
            Fragment::paragraph("Under B."),
        ]);
        let flat = tree.flatten();
        let root = flat[0];
        let b = flat
            .iter()
            .find(|c| c.content == "B")
            .expect("section B present");
        assert_eq!(b.parent_id, Some(root.id));
        let under_b = tree.children_of(b.id);
        assert_eq!(under_b.len(), 1);
        assert_eq!(under_b[0].content, "Under B.");
    }

    #[test]
    fn long_paragraph_splits_into_ordered_siblings() {
        let sentences: Vec<String> = (0..8)
            .map(|i| format!("Sentence number {i} has a bit of text in it."))
            .collect();
        let long = sentences.join(" ");
        let tree = TreeBuilder::new(TreeConfig {
            max_chunk_len: 100,
            min_chunk_len: 0,
        })
        .build(
            "doc",
            &[Fragment::heading("T", 0), Fragment::paragraph(&long)],
            &ChunkIdGen::new(),
        )
        .unwrap();

        let root = tree.root();
        let parts = tree.children_of(root.id);
        assert!(parts.len() > 1, "long paragraph should split");
        for part in &parts {
            assert!(part.content.chars().count() <= 100);
            assert_eq!(part.parent_id, Some(root.id));
            assert_eq!(part.level, 1);
            assert!(part.metadata.contains_key("split_of"));
        }
        // Order preserved: reassembling the parts recovers every sentence in
        // the original order.
        let joined = parts
            .iter()
            .map(|p| p.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let mut last = 0;
        for sentence in &sentences {
            let pos = joined.find(sentence.trim()).expect("sentence survives split");
            assert!(pos >= last);
            last = pos;
        }
    }

    #[test]
    fn splitting_never_breaks_words() {
        let word = "unbroken".repeat(4); // 32 chars
        let long = format!("{word} ").repeat(20);
        let pieces = split_long_text(&long, 50);
        for piece in pieces {
            for w in piece.split_whitespace() {
                assert!(w.len() % word.len() == 0 || w == word, "word was split: {w}");
            }
        }
    }

    #[test]
    fn flatten_reconstructs_fragment_order() {
        let fragments = vec![
            Fragment::heading("T", 0),
            Fragment::heading("A", 1),
            Fragment::paragraph("one"),
            Fragment::heading("A.1", 3),
            Fragment::paragraph("two"),
            Fragment::heading("B", 2),
            Fragment::paragraph("three"),
        ];
        let tree = build(&fragments);
        let contents: Vec<&str> = tree.flatten().iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["T", "A", "one", "A.1", "two", "B", "three"]);
    }
}
