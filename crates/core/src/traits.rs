use crate::error::{ProviderError, SearchError};
use crate::models::Chunk;
use crate::schema::IndexSchema;
use crate::store::{BatchOutcome, HybridHits, HybridRequest};
use async_trait::async_trait;

#[async_trait]
pub trait SearchIndex: Send + Sync {
    fn backend(&self) -> &str;

    /// Creating an index that already exists with the same schema must succeed.
    async fn create_or_update_schema(&self, schema: &IndexSchema) -> Result<(), SearchError>;

    /// Upserts by `id`. An `Err` means the whole batch was rejected.
    async fn upsert_batch(&self, documents: &[Chunk]) -> Result<BatchOutcome, SearchError>;

    async fn hybrid_query(&self, request: &HybridRequest) -> Result<HybridHits, SearchError>;

    /// Removes every chunk of one source file, returning how many were deleted.
    async fn delete_source(&self, source: &str) -> Result<usize, SearchError>;

    async fn document_count(&self) -> Result<usize, SearchError>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// The model stopped because it ran out of tokens.
    pub truncated: bool,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError>;
}
