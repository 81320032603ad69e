//! Shared identifiers, cancellation, and the crate-wide error taxonomy.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable handle for a chunk, unique within a corpus.
///
/// Ids are assigned at tree-build time and never reused; parent/child links
/// and everything persisted in the vector store refer to chunks through this
/// handle rather than through live references.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChunkId {
    fn from(raw: u64) -> Self {
        ChunkId(raw)
    }
}

/// Allocates chunk ids from a shared atomic counter.
///
/// Documents ingested concurrently draw from the same counter, so each
/// tree-build owns a collision-free slice of the id space without any
/// coordination beyond the `fetch_add`.
#[derive(Clone, Debug, Default)]
pub struct ChunkIdGen {
    next: Arc<AtomicU64>,
}

impl ChunkIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start allocation at `first` instead of zero. Useful when resuming a
    /// corpus whose highest id is already known.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(first)),
        }
    }

    pub fn next_id(&self) -> ChunkId {
        ChunkId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cooperative cancellation flag.
///
/// The query pipeline checks the token between its two sub-searches and again
/// before context expansion; a cancelled query returns [`KbError::Cancelled`]
/// instead of running the remaining stages.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Error taxonomy for ingestion and retrieval.
///
/// Structural anomalies during tree construction are repaired locally
/// (clamping, splitting) wherever possible; `Structure` is reserved for
/// inputs that cannot produce a tree at all. Store and embedding failures
/// abort the single affected operation without touching other documents or
/// the lexical index.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// Malformed document structure during tree construction.
    #[error("document structure: {0}")]
    Structure(String),

    /// The external vector store is unreachable. Surfaced to the caller
    /// without internal retry; retry/backoff policy lives above this crate.
    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    /// The embedding call failed or returned vectors of an unexpected
    /// dimension for this corpus.
    #[error("embedding: {0}")]
    Embedding(String),

    /// The lexical index was mutated while a query against it was in flight.
    #[error("lexical index state: {0}")]
    IndexState(String),

    /// Backend I/O failure that is not a connectivity loss.
    #[error("storage: {0}")]
    Storage(String),

    /// The caller cancelled the query via its [`CancelToken`].
    #[error("query cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_gen_is_monotonic_and_shared() {
        let gen = ChunkIdGen::new();
        let clone = gen.clone();
        let a = gen.next_id();
        let b = clone.next_id();
        let c = gen.next_id();
        assert!(a < b && b < c, "clones must draw from the same counter");
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let observer = token.clone();
        assert!(observer.is_cancelled());
    }
}
