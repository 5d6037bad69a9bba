use crate::chunking::ChunkingOptions;
use crate::error::ConfigError;
use crate::models::{QueryOptions, SearchMode};
use crate::retriever::FusionStrategy;
use crate::retry::RetryPolicy;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_TEMPERATURE: f32 = 0.3;
pub const DEFAULT_MAX_ANSWER_TOKENS: u32 = 500;
pub const DEFAULT_MAX_EMBEDDING_CHARS: usize = 30_000;
/// Roughly 2000 tokens of context.
pub const DEFAULT_CONTEXT_BUDGET_CHARS: usize = 8_000;

/// Pipeline settings. Build it once, call [`RagConfig::validate`], then share it by reference.
#[derive(Debug, Clone)]
pub struct RagConfig {
    pub index_name: String,
    pub embedding_model: String,
    pub generation_model: String,
    pub embedding_dimensions: usize,
    pub batch_size: usize,
    pub top_k: usize,
    pub temperature: f32,
    pub max_answer_tokens: u32,
    pub max_embedding_chars: usize,
    pub context_budget_chars: usize,
    pub over_fetch_factor: usize,
    pub min_page_chars: usize,
    pub embedding_concurrency: usize,
    pub keyword_fallback: bool,
    pub fusion: FusionStrategy,
    pub retry: RetryPolicy,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            index_name: String::new(),
            embedding_model: String::new(),
            generation_model: String::new(),
            embedding_dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
            batch_size: DEFAULT_BATCH_SIZE,
            top_k: DEFAULT_TOP_K,
            temperature: DEFAULT_TEMPERATURE,
            max_answer_tokens: DEFAULT_MAX_ANSWER_TOKENS,
            max_embedding_chars: DEFAULT_MAX_EMBEDDING_CHARS,
            context_budget_chars: DEFAULT_CONTEXT_BUDGET_CHARS,
            over_fetch_factor: 3,
            min_page_chars: 1,
            embedding_concurrency: 4,
            keyword_fallback: true,
            fusion: FusionStrategy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RagConfig {
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_text("index_name", &self.index_name)?;
        require_text("embedding_model", &self.embedding_model)?;
        require_text("generation_model", &self.generation_model)?;

        if !self
            .index_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ConfigError::Invalid {
                field: "index_name",
                reason: "only lowercase letters, digits and dashes are allowed".to_string(),
            });
        }

        require_positive("embedding_dimensions", self.embedding_dimensions)?;
        require_positive("batch_size", self.batch_size)?;
        require_positive("top_k", self.top_k)?;
        require_positive("max_embedding_chars", self.max_embedding_chars)?;
        require_positive("context_budget_chars", self.context_budget_chars)?;
        require_positive("over_fetch_factor", self.over_fetch_factor)?;
        require_positive("embedding_concurrency", self.embedding_concurrency)?;
        require_positive("max_answer_tokens", self.max_answer_tokens as usize)?;
        require_positive("retry.max_attempts", self.retry.max_attempts as usize)?;

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid {
                field: "temperature",
                reason: format!("{} is outside 0.0..=2.0", self.temperature),
            });
        }

        self.fusion.validate()
    }

    /// Per-question defaults; callers override individual fields.
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            top_k: self.top_k,
            mode: SearchMode::Hybrid,
            temperature: self.temperature,
            include_context: false,
        }
    }

    pub fn chunking_options(&self) -> ChunkingOptions {
        ChunkingOptions {
            min_page_chars: self.min_page_chars,
        }
    }
}

pub fn require_text(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing(field))
    } else {
        Ok(())
    }
}

fn require_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        })
    } else {
        Ok(())
    }
}
