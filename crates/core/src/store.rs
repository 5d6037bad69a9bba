use crate::models::{ChunkRef, SearchCandidate};

/// One hit as reported by an index backend.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub chunk_ref: ChunkRef,
    pub score: f64,
}

impl IndexHit {
    pub fn new(
        source: impl Into<String>,
        page: u32,
        content: impl Into<String>,
        score: f64,
    ) -> Self {
        Self {
            chunk_ref: ChunkRef {
                source: source.into(),
                page,
                content: content.into(),
            },
            score,
        }
    }

    pub fn into_candidate(self) -> SearchCandidate {
        SearchCandidate {
            chunk_ref: self.chunk_ref,
            vector_score: None,
            keyword_score: None,
            combined_rank: self.score,
        }
    }
}

/// A single request combining the vector and keyword halves of a hybrid query.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridRequest {
    pub keyword_text: String,
    /// `None` runs the keyword half only.
    pub vector: Option<Vec<f32>>,
    pub top: usize,
}

/// Backends either fuse scores themselves or hand back both ranked lists.
#[derive(Debug, Clone, PartialEq)]
pub enum HybridHits {
    Fused(Vec<IndexHit>),
    Separate {
        vector: Vec<IndexHit>,
        keyword: Vec<IndexHit>,
    },
}

impl HybridHits {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Fused(hits) => hits.is_empty(),
            Self::Separate { vector, keyword } => vector.is_empty() && keyword.is_empty(),
        }
    }
}

/// Result of an accepted batch upload. Ids listed here were rejected individually.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub failed_ids: Vec<String>,
}
