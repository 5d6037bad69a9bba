use crate::config::RagConfig;
use crate::error::{ProviderError, RagError};
use crate::models::Chunk;
use crate::retry::{retry_with_backoff, Exhausted, RetryPolicy};
use crate::traits::EmbeddingProvider;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

/// Width of `text-embedding-ada-002` vectors.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

/// Wraps an [`EmbeddingProvider`] with input truncation, bounded retries and a
/// dimensionality check.
pub struct Embedder<'a, P: ?Sized> {
    provider: &'a P,
    dimensions: usize,
    max_input_chars: usize,
    retry: RetryPolicy,
}

impl<'a, P> Embedder<'a, P>
where
    P: EmbeddingProvider + ?Sized,
{
    pub fn new(provider: &'a P, config: &RagConfig) -> Self {
        Self {
            provider,
            dimensions: config.embedding_dimensions,
            max_input_chars: config.max_embedding_chars,
            retry: config.retry,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn prepare_input<'t>(&self, text: &'t str) -> &'t str {
        truncate_chars(text, self.max_input_chars)
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let input = self.prepare_input(text);
        if input.len() < text.len() {
            debug!(
                original_chars = text.chars().count(),
                kept_chars = self.max_input_chars,
                "truncated embedding input"
            );
        }

        let mut vector = retry_with_backoff(&self.retry, "embed", || self.provider.embed(input))
            .await
            .map_err(|Exhausted { attempts, last }| RagError::EmbeddingUnavailable {
                attempts,
                source: last,
            })?;

        if vector.len() != self.dimensions {
            return Err(RagError::EmbeddingUnavailable {
                attempts: 1,
                source: ProviderError::Fatal(format!(
                    "model {} returned {} dimensions, expected {}",
                    self.provider.model(),
                    vector.len(),
                    self.dimensions
                )),
            });
        }

        normalize(&mut vector);
        Ok(vector)
    }

    /// Embeds every chunk, at most `concurrency` requests in flight.
    ///
    /// Each chunk travels with its own request, so a vector can only ever land on
    /// the chunk whose content produced it.
    pub async fn embed_chunks(&self, chunks: Vec<Chunk>, concurrency: usize) -> EmbeddedChunks {
        let results = stream::iter(chunks.into_iter().map(|mut chunk| async move {
            match self.embed(&chunk.content).await {
                Ok(vector) => {
                    chunk.embedding = Some(vector);
                    Ok(chunk)
                }
                Err(error) => Err((chunk.id, error)),
            }
        }))
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        let mut embedded = EmbeddedChunks::default();
        for result in results {
            match result {
                Ok(chunk) => embedded.ready.push(chunk),
                Err((id, error)) => {
                    warn!(chunk_id = %id, %error, "embedding failed; chunk skipped");
                    embedded.failed.push((id, error));
                }
            }
        }
        embedded
    }
}

#[derive(Debug, Default)]
pub struct EmbeddedChunks {
    pub ready: Vec<Chunk>,
    pub failed: Vec<(String, RagError)>,
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

/// Deterministic offline embedder hashing character trigrams into buckets.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buffer = [0u8; 4];
                for byte in ch.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn model(&self) -> &str {
        "char-trigram"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_text(text))
    }
}
