use crate::config::RagConfig;
use crate::embeddings::Embedder;
use crate::error::{ConfigError, RagError};
use crate::models::{SearchCandidate, SearchMode};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::{HybridHits, HybridRequest, IndexHit};
use crate::traits::{EmbeddingProvider, SearchIndex};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info};

/// How separately scored vector and keyword lists become one ranking.
///
/// Reciprocal rank fusion adds `weight / (k + rank)` for every list a chunk appears
/// in (rank is 1-based). The weighted sum divides each list's scores by that list's
/// best score and adds `weight * normalized`. Backends that fuse scores themselves
/// bypass both.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FusionStrategy {
    ReciprocalRank {
        k: f64,
        vector_weight: f64,
        keyword_weight: f64,
    },
    WeightedSum {
        vector_weight: f64,
        keyword_weight: f64,
    },
}

impl Default for FusionStrategy {
    fn default() -> Self {
        Self::ReciprocalRank {
            k: 60.0,
            vector_weight: 0.5,
            keyword_weight: 0.5,
        }
    }
}

impl FusionStrategy {
    fn weights(&self) -> (f64, f64) {
        match *self {
            Self::ReciprocalRank {
                vector_weight,
                keyword_weight,
                ..
            }
            | Self::WeightedSum {
                vector_weight,
                keyword_weight,
            } => (vector_weight, keyword_weight),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (vector_weight, keyword_weight) = self.weights();
        if vector_weight < 0.0 || keyword_weight < 0.0 || vector_weight + keyword_weight <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "fusion",
                reason: "weights must be non-negative and not both zero".to_string(),
            });
        }
        if let Self::ReciprocalRank { k, .. } = self {
            if *k <= 0.0 {
                return Err(ConfigError::Invalid {
                    field: "fusion.k",
                    reason: "must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

pub struct HybridRetriever<'a, S: ?Sized, P: ?Sized> {
    index: &'a S,
    embedder: &'a Embedder<'a, P>,
    fusion: FusionStrategy,
    over_fetch_factor: usize,
    retry: RetryPolicy,
}

impl<'a, S, P> HybridRetriever<'a, S, P>
where
    S: SearchIndex + ?Sized,
    P: EmbeddingProvider + ?Sized,
{
    pub fn new(index: &'a S, embedder: &'a Embedder<'a, P>, config: &RagConfig) -> Self {
        Self {
            index,
            embedder,
            fusion: config.fusion,
            over_fetch_factor: config.over_fetch_factor.max(1),
            retry: config.retry,
        }
    }

    /// Ranked, deduplicated candidates for `query_text`, at most `top_k` of them.
    pub async fn search(
        &self,
        query_text: &str,
        top_k: usize,
        mode: SearchMode,
    ) -> Result<Vec<SearchCandidate>, RagError> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(RagError::InvalidQuery("query is empty".to_string()));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = match mode {
            SearchMode::Hybrid => Some(self.embedder.embed(query_text).await?),
            SearchMode::KeywordOnly => None,
        };

        let request = HybridRequest {
            keyword_text: self.embedder.prepare_input(query_text).to_string(),
            vector,
            top: top_k.saturating_mul(self.over_fetch_factor),
        };

        let hits = retry_with_backoff(&self.retry, "hybrid_query", || {
            self.index.hybrid_query(&request)
        })
        .await
        .map_err(|exhausted| RagError::RetrievalUnavailable(exhausted.last))?;

        let mut candidates = merge_hits(hits, &self.fusion);
        candidates.truncate(top_k);

        info!(
            backend = self.index.backend(),
            ?mode,
            candidates = candidates.len(),
            "retrieval finished"
        );
        Ok(candidates)
    }
}

/// Orders by `combined_rank` descending, then source name, then page.
pub fn sort_candidates(candidates: &mut [SearchCandidate]) {
    candidates.sort_by(|left, right| {
        right
            .combined_rank
            .total_cmp(&left.combined_rank)
            .then_with(|| left.chunk_ref.source.cmp(&right.chunk_ref.source))
            .then_with(|| left.chunk_ref.page.cmp(&right.chunk_ref.page))
    });
}

pub fn merge_hits(hits: HybridHits, fusion: &FusionStrategy) -> Vec<SearchCandidate> {
    match hits {
        HybridHits::Fused(hits) => {
            let mut candidates: Vec<SearchCandidate> =
                hits.into_iter().map(IndexHit::into_candidate).collect();
            sort_candidates(&mut candidates);
            let mut seen = std::collections::HashSet::new();
            candidates.retain(|candidate| seen.insert(candidate.chunk_ref.source_ref()));
            candidates
        }
        HybridHits::Separate { vector, keyword } => {
            let mut scored = HashMap::<(String, u32), SearchCandidate>::new();
            let (vector_weight, keyword_weight) = fusion.weights();
            apply_list(&mut scored, vector, vector_weight, fusion, HitList::Vector);
            apply_list(&mut scored, keyword, keyword_weight, fusion, HitList::Keyword);

            let mut candidates: Vec<SearchCandidate> = scored.into_values().collect();
            sort_candidates(&mut candidates);
            debug!(merged = candidates.len(), "fused separate hit lists");
            candidates
        }
    }
}

#[derive(Clone, Copy)]
enum HitList {
    Vector,
    Keyword,
}

fn apply_list(
    target: &mut HashMap<(String, u32), SearchCandidate>,
    mut hits: Vec<IndexHit>,
    weight: f64,
    fusion: &FusionStrategy,
    list: HitList,
) {
    hits.sort_by(|left, right| right.score.partial_cmp(&left.score).unwrap_or(Ordering::Equal));
    let best = hits.iter().map(|hit| hit.score).fold(0.0_f64, f64::max);

    let mut position = 0usize;
    for hit in hits {
        let key = (hit.chunk_ref.source.clone(), hit.chunk_ref.page);
        let entry = target.entry(key).or_insert_with(|| SearchCandidate {
            chunk_ref: hit.chunk_ref.clone(),
            vector_score: None,
            keyword_score: None,
            combined_rank: 0.0,
        });

        let slot = match list {
            HitList::Vector => &mut entry.vector_score,
            HitList::Keyword => &mut entry.keyword_score,
        };
        // A repeated chunk within one list only counts at its best position.
        if slot.is_some() {
            continue;
        }
        *slot = Some(hit.score);
        position += 1;

        entry.combined_rank += match *fusion {
            FusionStrategy::ReciprocalRank { k, .. } => weight / (k + position as f64),
            FusionStrategy::WeightedSum { .. } => {
                if best > 0.0 {
                    weight * hit.score / best
                } else {
                    0.0
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::SearchError;
    use crate::models::Chunk;
    use crate::schema::IndexSchema;
    use crate::store::BatchOutcome;
    use crate::stores::InMemoryIndex;
    use async_trait::async_trait;
    use std::time::Duration;

    fn hit(source: &str, page: u32, score: f64) -> IndexHit {
        IndexHit::new(source, page, format!("{source} p{page}"), score)
    }

    fn config() -> RagConfig {
        RagConfig {
            index_name: "manuals".to_string(),
            embedding_model: "char-trigram".to_string(),
            generation_model: "stub".to_string(),
            embedding_dimensions: 64,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..RagConfig::default()
        }
    }

    #[test]
    fn rrf_rewards_chunks_found_by_both_halves() {
        let hits = HybridHits::Separate {
            vector: vec![hit("a.pdf", 1, 0.9), hit("b.pdf", 2, 0.8)],
            keyword: vec![hit("b.pdf", 2, 7.0), hit("c.pdf", 3, 5.0)],
        };

        let merged = merge_hits(hits, &FusionStrategy::default());

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].chunk_ref.source, "b.pdf");
        assert_eq!(merged[0].vector_score, Some(0.8));
        assert_eq!(merged[0].keyword_score, Some(7.0));
        // a.pdf leads one list, c.pdf trails the other.
        assert_eq!(merged[1].chunk_ref.source, "a.pdf");
        assert_eq!(merged[2].chunk_ref.source, "c.pdf");
    }

    #[test]
    fn ties_break_on_source_then_page() {
        let hits = HybridHits::Fused(vec![
            hit("b.pdf", 1, 0.5),
            hit("a.pdf", 9, 0.5),
            hit("a.pdf", 2, 0.5),
        ]);

        let merged = merge_hits(hits, &FusionStrategy::default());
        let order: Vec<(String, u32)> = merged
            .iter()
            .map(|c| (c.chunk_ref.source.clone(), c.chunk_ref.page))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a.pdf".to_string(), 2),
                ("a.pdf".to_string(), 9),
                ("b.pdf".to_string(), 1)
            ]
        );
    }

    #[test]
    fn fused_duplicates_keep_the_best_hit() {
        let hits = HybridHits::Fused(vec![hit("a.pdf", 1, 0.2), hit("a.pdf", 1, 0.7)]);
        let merged = merge_hits(hits, &FusionStrategy::default());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].combined_rank, 0.7);
    }

    #[test]
    fn weighted_sum_normalizes_each_list() {
        let fusion = FusionStrategy::WeightedSum {
            vector_weight: 0.7,
            keyword_weight: 0.3,
        };
        let hits = HybridHits::Separate {
            vector: vec![hit("a.pdf", 1, 0.5)],
            keyword: vec![hit("b.pdf", 1, 12.0), hit("a.pdf", 1, 6.0)],
        };

        let merged = merge_hits(hits, &fusion);

        assert_eq!(merged[0].chunk_ref.source, "a.pdf");
        assert!((merged[0].combined_rank - (0.7 + 0.15)).abs() < 1e-9);
        assert!((merged[1].combined_rank - 0.3).abs() < 1e-9);
    }

    #[test]
    fn negative_weights_are_invalid() {
        let fusion = FusionStrategy::WeightedSum {
            vector_weight: -1.0,
            keyword_weight: 0.3,
        };
        assert!(fusion.validate().is_err());
        assert!(FusionStrategy::default().validate().is_ok());
    }

    async fn seeded_index(provider: &CharacterNgramEmbedder) -> InMemoryIndex {
        let index = InMemoryIndex::new();
        let documents: Vec<Chunk> = [
            ("Manual.pdf", 1, "Unpacking the router and safety notes"),
            ("Manual.pdf", 2, "Network settings: set the IP address and gateway"),
            ("Guide.pdf", 4, "Firmware update over the network interface"),
            ("Guide.pdf", 7, "Battery care and storage temperature"),
        ]
        .into_iter()
        .map(|(source, page, content)| Chunk {
            id: crate::chunking::chunk_id(source, page),
            content: content.to_string(),
            source: source.to_string(),
            page,
            embedding: Some(provider.embed_text(content)),
        })
        .collect();
        index
            .create_or_update_schema(&IndexSchema::for_chunks("manuals", 64))
            .await
            .expect("schema");
        index.upsert_batch(&documents).await.expect("upload");
        index
    }

    #[tokio::test]
    async fn identical_queries_return_identical_order() {
        let provider = CharacterNgramEmbedder::new(64);
        let config = config();
        let embedder = Embedder::new(&provider, &config);
        let index = seeded_index(&provider).await;
        let retriever = HybridRetriever::new(&index, &embedder, &config);

        let first = retriever
            .search("network settings", 3, SearchMode::Hybrid)
            .await
            .expect("search");
        let second = retriever
            .search("network settings", 3, SearchMode::Hybrid)
            .await
            .expect("search");

        assert_eq!(first, second);
        assert!(first.len() <= 3);
        assert_eq!(first[0].chunk_ref.page, 2);
        assert!(first
            .windows(2)
            .all(|pair| pair[0].combined_rank >= pair[1].combined_rank));
    }

    #[tokio::test]
    async fn keyword_only_mode_skips_vectors() {
        let provider = CharacterNgramEmbedder::new(64);
        let config = config();
        let embedder = Embedder::new(&provider, &config);
        let index = seeded_index(&provider).await;
        let retriever = HybridRetriever::new(&index, &embedder, &config);

        let hits = retriever
            .search("battery", 5, SearchMode::KeywordOnly)
            .await
            .expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_ref.source, "Guide.pdf");
        assert_eq!(hits[0].vector_score, None);
        assert!(hits[0].keyword_score.is_some());
    }

    #[tokio::test]
    async fn empty_index_is_not_an_error() {
        let provider = CharacterNgramEmbedder::new(64);
        let config = config();
        let embedder = Embedder::new(&provider, &config);
        let index = InMemoryIndex::new();
        let retriever = HybridRetriever::new(&index, &embedder, &config);

        let hits = retriever
            .search("anything", 5, SearchMode::Hybrid)
            .await
            .expect("search");
        assert!(hits.is_empty());
    }

    struct UnreachableIndex;

    #[async_trait]
    impl SearchIndex for UnreachableIndex {
        fn backend(&self) -> &str {
            "unreachable"
        }

        async fn create_or_update_schema(&self, _schema: &IndexSchema) -> Result<(), SearchError> {
            Ok(())
        }

        async fn upsert_batch(&self, _documents: &[Chunk]) -> Result<BatchOutcome, SearchError> {
            Ok(BatchOutcome::default())
        }

        async fn hybrid_query(&self, _request: &HybridRequest) -> Result<HybridHits, SearchError> {
            Err(SearchError::Throttled {
                backend: "unreachable".to_string(),
                details: "503".to_string(),
            })
        }

        async fn delete_source(&self, _source: &str) -> Result<usize, SearchError> {
            Ok(0)
        }

        async fn document_count(&self) -> Result<usize, SearchError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn unreachable_index_surfaces_retrieval_unavailable() {
        let provider = CharacterNgramEmbedder::new(64);
        let config = config();
        let embedder = Embedder::new(&provider, &config);
        let retriever = HybridRetriever::new(&UnreachableIndex, &embedder, &config);

        let result = retriever.search("network", 5, SearchMode::Hybrid).await;
        assert!(matches!(result, Err(RagError::RetrievalUnavailable(_))));
    }

    #[tokio::test]
    async fn blank_queries_are_rejected() {
        let provider = CharacterNgramEmbedder::new(64);
        let config = config();
        let embedder = Embedder::new(&provider, &config);
        let index = InMemoryIndex::new();
        let retriever = HybridRetriever::new(&index, &embedder, &config);

        let result = retriever.search("   ", 5, SearchMode::Hybrid).await;
        assert!(matches!(result, Err(RagError::InvalidQuery(_))));
    }
}
