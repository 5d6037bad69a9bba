//! OpenAI-compatible HTTP clients for embeddings and chat completions.
//!
//! Works against Azure OpenAI deployments (`api-key` header, deployment URLs,
//! `api-version` query) or the plain OpenAI API (bearer auth, `/v1` paths).

use crate::error::ProviderError;
use crate::traits::{Completion, CompletionRequest, EmbeddingProvider, GenerationProvider};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

pub const DEFAULT_AZURE_API_VERSION: &str = "2024-02-15-preview";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiFlavor {
    Azure { api_version: String },
    OpenAi,
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: Url,
    api_key: String,
    flavor: ApiFlavor,
}

impl OpenAiClient {
    pub fn new(
        endpoint: &str,
        api_key: impl Into<String>,
        flavor: ApiFlavor,
    ) -> Result<Self, ProviderError> {
        let trimmed = endpoint.trim_end_matches('/');
        let base_url = Url::parse(&format!("{trimmed}/")).map_err(|error| {
            ProviderError::Fatal(format!("invalid endpoint {endpoint}: {error}"))
        })?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| ProviderError::Fatal(format!("http client setup failed: {error}")))?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
            flavor,
        })
    }

    fn operation_url(&self, model: &str, operation: &str) -> Result<Url, ProviderError> {
        let url = match &self.flavor {
            ApiFlavor::Azure { api_version } => {
                let mut url = self
                    .base_url
                    .join(&format!("openai/deployments/{model}/{operation}"))
                    .map_err(|error| ProviderError::Fatal(error.to_string()))?;
                url.query_pairs_mut().append_pair("api-version", api_version);
                url
            }
            ApiFlavor::OpenAi => self
                .base_url
                .join(operation)
                .map_err(|error| ProviderError::Fatal(error.to_string()))?,
        };
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.flavor {
            ApiFlavor::Azure { .. } => request.header("api-key", &self.api_key),
            ApiFlavor::OpenAi => request.bearer_auth(&self.api_key),
        }
    }

    async fn post_json<T>(&self, url: Url, body: serde_json::Value) -> Result<T, ProviderError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .authorize(self.http.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|error| ProviderError::from_http(&error))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let details = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &details));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| ProviderError::from_http(&error))
    }
}

pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    details: &str,
) -> ProviderError {
    let details = details.chars().take(300).collect::<String>();
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ProviderError::Transient(format!("{status}: {details}"))
    } else {
        ProviderError::Fatal(format!("{status}: {details}"))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiEmbeddingProvider {
    client: OpenAiClient,
    model: String,
}

impl OpenAiEmbeddingProvider {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = self.client.operation_url(&self.model, "embeddings")?;
        let body = json!({ "model": self.model, "input": [text] });
        let response: EmbeddingResponse = self.client.post_json(url, body).await?;

        response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| ProviderError::Transient("embedding response had no data".to_string()))
    }
}

pub struct OpenAiChatProvider {
    client: OpenAiClient,
    model: String,
}

impl OpenAiChatProvider {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl GenerationProvider for OpenAiChatProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let url = self.client.operation_url(&self.model, "chat/completions")?;
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt},
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response: ChatResponse = self.client.post_json(url, body).await?;
        parse_completion(response)
    }
}

fn parse_completion(response: ChatResponse) -> Result<Completion, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Transient("completion had no choices".to_string()))?;

    let text = choice.message.content.unwrap_or_default().trim().to_string();
    if text.is_empty() {
        return Err(ProviderError::Transient("completion was empty".to_string()));
    }

    Ok(Completion {
        text,
        truncated: choice.finish_reason.as_deref() == Some("length"),
    })
}
