use crate::config::RagConfig;
use crate::context::ContextAssembler;
use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::models::{QueryOptions, QueryOutcome, QueryResult, SearchCandidate, SearchMode};
use crate::retriever::HybridRetriever;
use crate::synthesizer::AnswerSynthesizer;
use crate::traits::{EmbeddingProvider, GenerationProvider, SearchIndex};
use tracing::{info, warn};

/// Answers questions from the indexed manuals: retrieve, assemble, generate.
pub struct QueryEngine<'a, S: ?Sized, P: ?Sized, G: ?Sized> {
    retriever: HybridRetriever<'a, S, P>,
    assembler: ContextAssembler,
    synthesizer: AnswerSynthesizer<'a, G>,
    keyword_fallback: bool,
}

impl<'a, S, P, G> QueryEngine<'a, S, P, G>
where
    S: SearchIndex + ?Sized,
    P: EmbeddingProvider + ?Sized,
    G: GenerationProvider + ?Sized,
{
    pub fn new(
        index: &'a S,
        embedder: &'a Embedder<'a, P>,
        generator: &'a G,
        config: &RagConfig,
    ) -> Self {
        Self {
            retriever: HybridRetriever::new(index, embedder, config),
            assembler: ContextAssembler::new(config.context_budget_chars),
            synthesizer: AnswerSynthesizer::new(generator, config),
            keyword_fallback: config.keyword_fallback,
        }
    }

    /// Ranked candidates without generating an answer.
    pub async fn search(
        &self,
        query_text: &str,
        options: &QueryOptions,
    ) -> Result<(Vec<SearchCandidate>, bool), RagError> {
        match self
            .retriever
            .search(query_text, options.top_k, options.mode)
            .await
        {
            Ok(candidates) => Ok((candidates, false)),
            Err(error) if self.can_fall_back(&error, options.mode) => {
                warn!(%error, "hybrid retrieval failed, retrying with keywords only");
                let candidates = self
                    .retriever
                    .search(query_text, options.top_k, SearchMode::KeywordOnly)
                    .await?;
                Ok((candidates, true))
            }
            Err(error) => Err(error),
        }
    }

    fn can_fall_back(&self, error: &RagError, mode: SearchMode) -> bool {
        self.keyword_fallback
            && mode == SearchMode::Hybrid
            && matches!(
                error,
                RagError::EmbeddingUnavailable { .. } | RagError::RetrievalUnavailable(_)
            )
    }

    /// Returns `Err` only for an empty question or when retrieval itself fails.
    /// A failed generation step still yields the retrieved sources.
    pub async fn answer_question(
        &self,
        question: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult, RagError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::InvalidQuery("question is empty".to_string()));
        }

        let (candidates, degraded_to_keyword) = self.search(question, options).await?;
        let mut result = QueryResult {
            question: question.to_string(),
            answer: None,
            sources: Vec::new(),
            context_used: None,
            candidates,
            outcome: QueryOutcome::NoRelevantDocuments,
            truncated: false,
            degraded_to_keyword,
        };

        let context = self.assembler.assemble(&result.candidates);
        if context.is_empty() {
            if result.candidates.is_empty() {
                info!(question, "no relevant documents");
            } else {
                warn!(
                    candidates = result.candidates.len(),
                    budget_chars = self.assembler.budget_chars(),
                    "retrieved pages exceed the context budget"
                );
            }
            return Ok(result);
        }

        result.sources = context.sources.clone();
        if options.include_context {
            result.context_used = Some(context.text.clone());
        }

        match self
            .synthesizer
            .generate(question, &context.text, options.temperature)
            .await
        {
            Ok(completion) => {
                result.answer = Some(completion.text);
                result.truncated = completion.truncated;
                result.outcome = QueryOutcome::Answered;
            }
            Err(error @ RagError::GenerationUnavailable { .. }) => {
                warn!(%error, "answer generation failed, returning sources only");
                result.outcome = QueryOutcome::GenerationFailed {
                    reason: error.to_string(),
                };
            }
            Err(error) => return Err(error),
        }

        info!(
            sources = result.sources.len(),
            degraded_to_keyword = result.degraded_to_keyword,
            truncated = result.truncated,
            "question answered"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::chunk_id;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::ProviderError;
    use crate::models::{Chunk, SourceRef};
    use crate::retry::RetryPolicy;
    use crate::schema::IndexSchema;
    use crate::stores::InMemoryIndex;
    use crate::traits::{Completion, CompletionRequest};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    const DIMENSIONS: usize = 64;

    struct ScriptedGenerator {
        reply: Result<Completion, ProviderError>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn answering(text: &str) -> Self {
            Self {
                reply: Ok(Completion {
                    text: text.to_string(),
                    truncated: false,
                }),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(ProviderError::Transient("503 Service Unavailable".to_string())),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedGenerator {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: &CompletionRequest<'_>,
        ) -> Result<Completion, ProviderError> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(request.user_prompt.to_string());
            }
            self.reply.clone()
        }
    }

    struct OfflineEmbedder;

    #[async_trait]
    impl EmbeddingProvider for OfflineEmbedder {
        fn model(&self) -> &str {
            "offline"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Transient("connection refused".to_string()))
        }
    }

    fn config() -> RagConfig {
        RagConfig {
            index_name: "manuals".to_string(),
            embedding_model: "char-trigram".to_string(),
            generation_model: "scripted".to_string(),
            embedding_dimensions: DIMENSIONS,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..RagConfig::default()
        }
    }

    async fn seeded_index(pages: &[(&str, u32, &str)]) -> InMemoryIndex {
        let index = InMemoryIndex::new();
        let provider = CharacterNgramEmbedder::new(DIMENSIONS);
        let chunks: Vec<Chunk> = pages
            .iter()
            .map(|(source, page, content)| Chunk {
                id: chunk_id(source, *page),
                content: content.to_string(),
                source: source.to_string(),
                page: *page,
                embedding: Some(provider.embed_text(content)),
            })
            .collect();
        index
            .create_or_update_schema(&IndexSchema::for_chunks("manuals", DIMENSIONS))
            .await
            .expect("schema");
        index.upsert_batch(&chunks).await.expect("upsert");
        index
    }

    #[tokio::test]
    async fn single_match_is_cited_in_context_and_sources() -> Result<(), RagError> {
        let index = seeded_index(&[(
            "Manual.pdf",
            5,
            "Network settings: open the admin panel and choose Network.",
        )])
        .await;
        let provider = CharacterNgramEmbedder::new(DIMENSIONS);
        let generator = ScriptedGenerator::answering("Open the admin panel [Manual.pdf, page 5].");
        let config = config();
        let embedder = Embedder::new(&provider, &config);
        let engine = QueryEngine::new(&index, &embedder, &generator, &config);
        let options = QueryOptions {
            top_k: 5,
            include_context: true,
            ..config.query_options()
        };

        let result = engine
            .answer_question("How do I change network settings?", &options)
            .await?;

        assert_eq!(result.outcome, QueryOutcome::Answered);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.sources, vec![SourceRef::new("Manual.pdf", 5)]);
        assert!(result
            .context_used
            .as_deref()
            .is_some_and(|context| context.contains("[Manual.pdf, page 5]")));
        assert!(generator.prompts()[0].contains("[Manual.pdf, page 5]"));
        assert!(!result.degraded_to_keyword);
        Ok(())
    }

    #[tokio::test]
    async fn empty_index_reports_no_relevant_documents() -> Result<(), RagError> {
        let index = InMemoryIndex::new();
        let provider = CharacterNgramEmbedder::new(DIMENSIONS);
        let generator = ScriptedGenerator::answering("unused");
        let config = config();
        let embedder = Embedder::new(&provider, &config);
        let engine = QueryEngine::new(&index, &embedder, &generator, &config);

        let result = engine
            .answer_question("anything at all", &config.query_options())
            .await?;

        assert_eq!(result.outcome, QueryOutcome::NoRelevantDocuments);
        assert!(result.answer.is_none());
        assert!(result.sources.is_empty());
        assert!(generator.prompts().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn generation_failure_still_returns_sources() -> Result<(), RagError> {
        let index = seeded_index(&[("Guide.pdf", 2, "Reset the printer by holding power.")]).await;
        let provider = CharacterNgramEmbedder::new(DIMENSIONS);
        let generator = ScriptedGenerator::failing();
        let config = config();
        let embedder = Embedder::new(&provider, &config);
        let engine = QueryEngine::new(&index, &embedder, &generator, &config);

        let result = engine
            .answer_question("how to reset the printer", &config.query_options())
            .await?;

        assert!(matches!(
            result.outcome,
            QueryOutcome::GenerationFailed { .. }
        ));
        assert!(result.answer.is_none());
        assert_eq!(result.sources, vec![SourceRef::new("Guide.pdf", 2)]);
        assert_eq!(result.candidates.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_embedder_degrades_to_keyword_search() -> Result<(), RagError> {
        let page = "Replace the toner cartridge carefully.";
        let index = seeded_index(&[("Guide.pdf", 4, page)]).await;
        let generator = ScriptedGenerator::answering("Replace it [Guide.pdf, page 4].");
        let config = config();
        let embedder = Embedder::new(&OfflineEmbedder, &config);
        let engine = QueryEngine::new(&index, &embedder, &generator, &config);

        let result = engine
            .answer_question("toner cartridge", &config.query_options())
            .await?;

        assert!(result.degraded_to_keyword);
        assert_eq!(result.outcome, QueryOutcome::Answered);
        assert_eq!(result.sources, vec![SourceRef::new("Guide.pdf", 4)]);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_fallback_surfaces_the_embedding_error() {
        let index = seeded_index(&[("Guide.pdf", 4, "Replace the toner cartridge.")]).await;
        let generator = ScriptedGenerator::answering("unused");
        let config = RagConfig {
            keyword_fallback: false,
            ..config()
        };
        let embedder = Embedder::new(&OfflineEmbedder, &config);
        let engine = QueryEngine::new(&index, &embedder, &generator, &config);

        let result = engine
            .answer_question("toner cartridge", &config.query_options())
            .await;

        assert!(matches!(
            result,
            Err(RagError::EmbeddingUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn sources_match_exactly_what_the_context_holds() -> Result<(), RagError> {
        // Equal-length pages render to 35-char blocks: two fit in 100 chars, three do not.
        let index = seeded_index(&[
            ("A.pdf", 1, "printer guide alpha"),
            ("B.pdf", 1, "printer guide bravo"),
            ("C.pdf", 1, "printer guide gamma"),
        ])
        .await;
        let provider = CharacterNgramEmbedder::new(DIMENSIONS);
        let generator = ScriptedGenerator::answering("See [A.pdf, page 1].");
        let config = RagConfig {
            context_budget_chars: 100,
            ..config()
        };
        let embedder = Embedder::new(&provider, &config);
        let engine = QueryEngine::new(&index, &embedder, &generator, &config);
        let options = QueryOptions {
            include_context: true,
            ..config.query_options()
        };

        let result = engine.answer_question("printer guide", &options).await?;
        let context = result.context_used.clone().unwrap_or_default();
        let tags: Vec<&str> = context
            .split("\n\n")
            .filter_map(|block| block.lines().next())
            .collect();
        let cited: Vec<String> = result
            .sources
            .iter()
            .map(|source| format!("[{source}]"))
            .collect();

        assert_eq!(result.outcome, QueryOutcome::Answered);
        assert_eq!(result.candidates.len(), 3);
        assert_eq!(result.sources.len(), 2);
        assert_eq!(tags, cited);
        assert!(context.chars().count() <= 100);

        let dropped = result.candidates[2].chunk_ref.source_ref();
        assert!(!result.sources.contains(&dropped));
        assert!(!context.contains(&format!("[{dropped}]")));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_pages_leave_an_empty_context() -> Result<(), RagError> {
        let long_page = "printer ".repeat(200);
        let index = seeded_index(&[("B.pdf", 1, long_page.as_str())]).await;
        let provider = CharacterNgramEmbedder::new(DIMENSIONS);
        let generator = ScriptedGenerator::answering("unused");
        let config = RagConfig {
            context_budget_chars: 120,
            ..config()
        };
        let embedder = Embedder::new(&provider, &config);
        let engine = QueryEngine::new(&index, &embedder, &generator, &config);

        let result = engine
            .answer_question("printer", &config.query_options())
            .await?;

        assert_eq!(result.outcome, QueryOutcome::NoRelevantDocuments);
        assert_eq!(result.candidates.len(), 1);
        assert!(result.sources.is_empty());
        assert!(generator.prompts().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let index = InMemoryIndex::new();
        let provider = CharacterNgramEmbedder::new(DIMENSIONS);
        let generator = ScriptedGenerator::answering("unused");
        let config = config();
        let embedder = Embedder::new(&provider, &config);
        let engine = QueryEngine::new(&index, &embedder, &generator, &config);

        let result = engine.answer_question("   ", &config.query_options()).await;

        assert!(matches!(result, Err(RagError::InvalidQuery(_))));
    }
}
