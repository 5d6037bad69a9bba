use crate::config::RagConfig;
use crate::error::RagError;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::traits::{Completion, CompletionRequest, GenerationProvider};
use tracing::info;

pub const SYSTEM_PROMPT: &str = "You are an expert assistant answering questions about product manuals.

Answer the user's question using ONLY the supplied context excerpts.

Rules:
- Do not add facts, numbers or steps that are not present in the context.
- If the context does not contain the answer, reply exactly: \"I don't have enough information to answer that question.\"
- Cite the excerpts you rely on with their tags, e.g. [Manual.pdf, page 5].
- When several excerpts are relevant, combine them into one coherent answer.
- Be concise and precise.";

pub fn user_prompt(question: &str, context: &str) -> String {
    format!(
        "Question: {question}\n\nContext excerpts:\n{context}\n\nAnswer the question using only the context excerpts above."
    )
}

pub struct AnswerSynthesizer<'a, G: ?Sized> {
    provider: &'a G,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl<'a, G> AnswerSynthesizer<'a, G>
where
    G: GenerationProvider + ?Sized,
{
    pub fn new(provider: &'a G, config: &RagConfig) -> Self {
        Self {
            provider,
            max_tokens: config.max_answer_tokens,
            retry: config.retry,
        }
    }

    pub async fn generate(
        &self,
        question: &str,
        context: &str,
        temperature: f32,
    ) -> Result<Completion, RagError> {
        let user_prompt = user_prompt(question, context);
        let request = CompletionRequest {
            system_prompt: SYSTEM_PROMPT,
            user_prompt: &user_prompt,
            temperature,
            max_tokens: self.max_tokens,
        };

        let completion = retry_with_backoff(&self.retry, "generate", || {
            self.provider.complete(&request)
        })
        .await
        .map_err(|exhausted| RagError::GenerationUnavailable {
            attempts: exhausted.attempts,
            source: exhausted.last,
        })?;

        info!(
            model = self.provider.model(),
            answer_chars = completion.text.chars().count(),
            truncated = completion.truncated,
            "answer generated"
        );
        Ok(completion)
    }
}
