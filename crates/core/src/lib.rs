pub mod chunking;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod openai;
pub mod pipeline;
pub mod retriever;
pub mod retry;
pub mod schema;
pub mod store;
pub mod stores;
pub mod synthesizer;
pub mod traits;
pub mod writer;

pub use chunking::{build_chunks, chunk_id, sanitize_key, ChunkingOptions};
pub use config::RagConfig;
pub use context::{AssembledContext, ContextAssembler};
pub use embeddings::{CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{ConfigError, IngestError, ProviderError, RagError, SearchError};
pub use extractor::{extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use ingest::{discover_pdf_files, CancellationFlag, Ingestor};
pub use models::{
    Chunk, ChunkRef, IngestionSummary, QueryOptions, QueryOutcome, QueryResult, SearchCandidate,
    SearchMode, SkippedPdf, SourceRef,
};
pub use openai::{ApiFlavor, OpenAiChatProvider, OpenAiClient, OpenAiEmbeddingProvider};
pub use pipeline::QueryEngine;
pub use retriever::{FusionStrategy, HybridRetriever};
pub use retry::RetryPolicy;
pub use schema::IndexSchema;
pub use stores::{AzureSearchStore, InMemoryIndex};
pub use synthesizer::AnswerSynthesizer;
pub use traits::{EmbeddingProvider, GenerationProvider, SearchIndex};
pub use writer::{IndexWriter, UploadReport};
