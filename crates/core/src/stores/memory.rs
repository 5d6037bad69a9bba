use crate::error::SearchError;
use crate::models::Chunk;
use crate::schema::IndexSchema;
use crate::store::{BatchOutcome, HybridHits, HybridRequest, IndexHit};
use crate::traits::SearchIndex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryState {
    schema: Option<IndexSchema>,
    documents: BTreeMap<String, Chunk>,
}

/// Process-local index with cosine vector scoring and BM25 keyword scoring.
///
/// Documents are kept ordered by id, so equal scores always come back in the
/// same order. With a snapshot path, every write is mirrored to a JSON file.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    state: RwLock<MemoryState>,
    snapshot_path: Option<PathBuf>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SearchError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => MemoryState::default(),
            Err(error) => return Err(error.into()),
        };

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, SearchError> {
        self.state
            .read()
            .map_err(|_| SearchError::Request("memory index lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, SearchError> {
        self.state
            .write()
            .map_err(|_| SearchError::Request("memory index lock poisoned".to_string()))
    }

    async fn persist(&self, encoded: Option<Vec<u8>>) -> Result<(), SearchError> {
        if let (Some(path), Some(bytes)) = (&self.snapshot_path, encoded) {
            tokio::fs::write(path, bytes).await?;
        }
        Ok(())
    }

    fn encode(&self, state: &MemoryState) -> Result<Option<Vec<u8>>, SearchError> {
        if self.snapshot_path.is_none() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_vec(state)?))
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn create_or_update_schema(&self, schema: &IndexSchema) -> Result<(), SearchError> {
        let encoded = {
            let mut state = self.write()?;
            if let Some(existing) = &state.schema {
                if existing == schema {
                    return Ok(());
                }
                if existing.vector_dimensions() != schema.vector_dimensions()
                    && !state.documents.is_empty()
                {
                    return Err(SearchError::SchemaConflict {
                        index: schema.name.clone(),
                        details: format!(
                            "vector dimensions {:?} cannot change to {:?} while documents exist",
                            existing.vector_dimensions(),
                            schema.vector_dimensions()
                        ),
                    });
                }
            }
            state.schema = Some(schema.clone());
            self.encode(&state)?
        };
        self.persist(encoded).await
    }

    async fn upsert_batch(&self, documents: &[Chunk]) -> Result<BatchOutcome, SearchError> {
        let (outcome, encoded) = {
            let mut state = self.write()?;
            let dimensions = state
                .schema
                .as_ref()
                .and_then(IndexSchema::vector_dimensions);

            let mut outcome = BatchOutcome::default();
            for document in documents {
                let valid = match (&document.embedding, dimensions) {
                    (Some(vector), Some(expected)) => vector.len() == expected,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if valid {
                    state.documents.insert(document.id.clone(), document.clone());
                } else {
                    outcome.failed_ids.push(document.id.clone());
                }
            }
            (outcome, self.encode(&state)?)
        };
        self.persist(encoded).await?;
        Ok(outcome)
    }

    async fn hybrid_query(&self, request: &HybridRequest) -> Result<HybridHits, SearchError> {
        let state = self.read()?;
        let documents: Vec<&Chunk> = state.documents.values().collect();

        let vector = match &request.vector {
            Some(query_vector) => rank(
                documents
                    .iter()
                    .filter_map(|doc| {
                        let embedding = doc.embedding.as_deref()?;
                        Some((*doc, cosine_similarity(query_vector, embedding)))
                    })
                    .collect(),
                request.top,
            ),
            None => Vec::new(),
        };

        let keyword = rank(
            bm25_scores(&documents, &request.keyword_text)
                .into_iter()
                .filter(|(_, score)| *score > 0.0)
                .collect(),
            request.top,
        );

        debug!(
            vector_hits = vector.len(),
            keyword_hits = keyword.len(),
            "memory index query"
        );
        Ok(HybridHits::Separate { vector, keyword })
    }

    async fn delete_source(&self, source: &str) -> Result<usize, SearchError> {
        let (removed, encoded) = {
            let mut state = self.write()?;
            let before = state.documents.len();
            state.documents.retain(|_, doc| doc.source != source);
            let removed = before - state.documents.len();
            (removed, self.encode(&state)?)
        };
        self.persist(encoded).await?;
        Ok(removed)
    }

    async fn document_count(&self) -> Result<usize, SearchError> {
        Ok(self.read()?.documents.len())
    }
}

fn rank(mut scored: Vec<(&Chunk, f64)>, top: usize) -> Vec<IndexHit> {
    // Stable sort keeps id order among equal scores.
    scored.sort_by(|left, right| right.1.total_cmp(&left.1));
    scored
        .into_iter()
        .take(top)
        .map(|(doc, score)| IndexHit::new(doc.source.clone(), doc.page, doc.content.clone(), score))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn bm25_scores<'a>(documents: &[&'a Chunk], query: &str) -> Vec<(&'a Chunk, f64)> {
    let mut terms = tokenize(query);
    terms.sort();
    terms.dedup();
    if terms.is_empty() || documents.is_empty() {
        return Vec::new();
    }

    let tokenized: Vec<Vec<String>> = documents.iter().map(|doc| tokenize(&doc.content)).collect();
    let total = documents.len() as f64;
    let average_length =
        tokenized.iter().map(Vec::len).sum::<usize>() as f64 / total;

    let document_frequency: HashMap<&str, usize> = terms
        .iter()
        .map(|term| {
            let df = tokenized
                .iter()
                .filter(|tokens| tokens.iter().any(|token| token == term))
                .count();
            (term.as_str(), df)
        })
        .collect();

    documents
        .iter()
        .zip(&tokenized)
        .map(|(doc, tokens)| {
            let length_ratio = if average_length > 0.0 {
                tokens.len() as f64 / average_length
            } else {
                0.0
            };
            let score = terms
                .iter()
                .map(|term| {
                    let tf = tokens.iter().filter(|token| *token == term).count() as f64;
                    if tf == 0.0 {
                        return 0.0;
                    }
                    let df = document_frequency.get(term.as_str()).copied().unwrap_or(0) as f64;
                    let idf = (1.0 + ((total - df + 0.5) / (df + 0.5)).max(0.0)).ln();
                    idf * (tf * (BM25_K1 + 1.0))
                        / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * length_ratio))
                })
                .sum::<f64>();
            (*doc, score)
        })
        .collect()
}
