use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One indexed page of a source document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub source: String,
    pub page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn chunk_ref(&self) -> ChunkRef {
        ChunkRef {
            source: self.source.clone(),
            page: self.page,
            content: self.content.clone(),
        }
    }

    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            source: self.source.clone(),
            page: self.page,
        }
    }
}

/// A `(source, page)` citation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceRef {
    pub source: String,
    pub page: u32,
}

impl SourceRef {
    pub fn new(source: impl Into<String>, page: u32) -> Self {
        Self {
            source: source.into(),
            page,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, page {}", self.source, self.page)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRef {
    pub source: String,
    pub page: u32,
    pub content: String,
}

impl ChunkRef {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef::new(self.source.clone(), self.page)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchCandidate {
    pub chunk_ref: ChunkRef,
    pub vector_score: Option<f64>,
    pub keyword_score: Option<f64>,
    pub combined_rank: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum SearchMode {
    #[default]
    Hybrid,
    KeywordOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum QueryOutcome {
    Answered,
    NoRelevantDocuments,
    GenerationFailed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub question: String,
    pub answer: Option<String>,
    pub sources: Vec<SourceRef>,
    pub context_used: Option<String>,
    pub candidates: Vec<SearchCandidate>,
    pub outcome: QueryOutcome,
    pub truncated: bool,
    pub degraded_to_keyword: bool,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub top_k: usize,
    pub mode: SearchMode,
    pub temperature: f32,
    pub include_context: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub files_found: usize,
    pub files_processed: usize,
    pub skipped_files: Vec<SkippedPdf>,
    pub chunks_processed: usize,
    pub uploaded: usize,
    pub errors: usize,
    pub failed_ids: Vec<String>,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestionSummary {
    pub fn started(files_found: usize) -> Self {
        let now = Utc::now();
        Self {
            files_found,
            files_processed: 0,
            skipped_files: Vec::new(),
            chunks_processed: 0,
            uploaded: 0,
            errors: 0,
            failed_ids: Vec::new(),
            interrupted: false,
            started_at: now,
            finished_at: now,
        }
    }
}
