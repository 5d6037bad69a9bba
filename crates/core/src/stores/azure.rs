use crate::error::SearchError;
use crate::models::Chunk;
use crate::schema::{FieldKind, FieldSpec, IndexSchema};
use crate::store::{BatchOutcome, HybridHits, HybridRequest, IndexHit};
use crate::traits::SearchIndex;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_SEARCH_API_VERSION: &str = "2024-07-01";
const BACKEND: &str = "azure-search";
const VECTOR_PROFILE: &str = "vector-profile";
const HNSW_CONFIG: &str = "hnsw-config";
const DELETE_PAGE_SIZE: usize = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Azure AI Search over its REST API. Hybrid queries are fused server-side.
pub struct AzureSearchStore {
    client: Client,
    endpoint: Url,
    api_key: String,
    index_name: String,
    api_version: String,
}

impl AzureSearchStore {
    pub fn new(
        endpoint: &str,
        api_key: impl Into<String>,
        index_name: impl Into<String>,
    ) -> Result<Self, SearchError> {
        let trimmed = endpoint.trim_end_matches('/');
        Ok(Self {
            client: http_client(REQUEST_TIMEOUT)?,
            endpoint: Url::parse(&format!("{trimmed}/"))?,
            api_key: api_key.into(),
            index_name: index_name.into(),
            api_version: DEFAULT_SEARCH_API_VERSION.to_string(),
        })
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Replaces the per-request timeout. A request that runs over it fails with
    /// a retryable [`SearchError::Http`].
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, SearchError> {
        self.client = http_client(timeout)?;
        Ok(self)
    }

    fn url(&self, path: &str) -> Result<Url, SearchError> {
        let mut url = self.endpoint.join(path)?;
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        Ok(url)
    }

    fn docs_url(&self, operation: &str) -> Result<Url, SearchError> {
        self.url(&format!("indexes/{}/docs/{operation}", self.index_name))
    }

    async fn post(&self, url: Url, body: &Value) -> Result<Value, SearchError> {
        let response = self
            .client
            .post(url)
            .header("api-key", &self.api_key)
            .json(body)
            .send()
            .await?;
        parse_json(response).await
    }

    async fn search_ids_for_source(&self, source: &str) -> Result<Vec<String>, SearchError> {
        let body = json!({
            "search": "*",
            "filter": format!("source eq '{}'", source.replace('\'', "''")),
            "select": "id",
            "top": DELETE_PAGE_SIZE,
        });
        let response = self.post(self.docs_url("search")?, &body).await?;
        Ok(response
            .pointer("/value")
            .and_then(Value::as_array)
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| hit.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn http_client(timeout: Duration) -> Result<Client, SearchError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

async fn parse_json(response: Response) -> Result<Value, SearchError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        return Err(SearchError::Throttled {
            backend: BACKEND.to_string(),
            details: status.to_string(),
        });
    }
    // 207 carries per-document results for partially accepted uploads.
    if !status.is_success() {
        let details = response.text().await.unwrap_or_default();
        return Err(SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("{status}: {}", details.chars().take(300).collect::<String>()),
        });
    }
    Ok(response.json().await?)
}

pub fn schema_definition(schema: &IndexSchema) -> Value {
    let fields: Vec<Value> = schema.fields.iter().map(field_definition).collect();
    json!({
        "name": schema.name,
        "fields": fields,
        "vectorSearch": {
            "algorithms": [{
                "name": HNSW_CONFIG,
                "kind": "hnsw",
                "hnswParameters": {
                    "m": schema.hnsw.m,
                    "efConstruction": schema.hnsw.ef_construction,
                    "efSearch": schema.hnsw.ef_search,
                    "metric": "cosine"
                }
            }],
            "profiles": [{
                "name": VECTOR_PROFILE,
                "algorithm": HNSW_CONFIG
            }]
        }
    })
}

fn field_definition(field: &FieldSpec) -> Value {
    match field.kind {
        FieldKind::Key => json!({
            "name": field.name, "type": "Edm.String", "key": true, "filterable": true
        }),
        FieldKind::SearchableText => json!({
            "name": field.name, "type": "Edm.String", "searchable": true,
            "analyzer": "en.microsoft"
        }),
        FieldKind::FilterableString => json!({
            "name": field.name, "type": "Edm.String", "filterable": true, "facetable": true
        }),
        FieldKind::FilterableInt => json!({
            "name": field.name, "type": "Edm.Int32", "filterable": true, "sortable": true
        }),
        FieldKind::Vector { dimensions } => json!({
            "name": field.name, "type": "Collection(Edm.Single)", "searchable": true,
            "dimensions": dimensions, "vectorSearchProfile": VECTOR_PROFILE
        }),
    }
}

pub fn upload_payload(documents: &[Chunk]) -> Value {
    let actions: Vec<Value> = documents
        .iter()
        .map(|doc| {
            json!({
                "@search.action": "mergeOrUpload",
                "id": doc.id,
                "content": doc.content,
                "source": doc.source,
                "page": doc.page,
                "embedding": doc.embedding,
            })
        })
        .collect();
    json!({ "value": actions })
}

pub fn search_payload(request: &HybridRequest) -> Value {
    let mut body = json!({
        "search": request.keyword_text,
        "select": "id,content,source,page",
        "top": request.top,
    });
    if let Some(vector) = &request.vector {
        body["vectorQueries"] = json!([{
            "kind": "vector",
            "vector": vector,
            "k": request.top,
            "fields": "embedding"
        }]);
    }
    body
}

pub fn failed_keys(response: &Value) -> Vec<String> {
    response
        .pointer("/value")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter(|result| !result.get("status").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|result| result.get("key").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_hits(response: &Value) -> Vec<IndexHit> {
    let hits = response
        .pointer("/value")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    hits.iter()
        .map(|raw| {
            let source = raw
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let page = raw
                .get("page")
                .and_then(Value::as_u64)
                .and_then(|page| u32::try_from(page).ok())
                .unwrap_or_default();
            let content = raw
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let score = raw
                .get("@search.score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            IndexHit::new(source, page, content, score)
        })
        .collect()
}

#[async_trait]
impl SearchIndex for AzureSearchStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn create_or_update_schema(&self, schema: &IndexSchema) -> Result<(), SearchError> {
        let response = self
            .client
            .put(self.url(&format!("indexes/{}", schema.name))?)
            .header("api-key", &self.api_key)
            .json(&schema_definition(schema))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(index = %schema.name, %status, "index schema created or updated");
            return Ok(());
        }

        let details = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && details.contains("cannot be changed") {
            return Err(SearchError::SchemaConflict {
                index: schema.name.clone(),
                details,
            });
        }
        Err(SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("{status}: {details}"),
        })
    }

    async fn upsert_batch(&self, documents: &[Chunk]) -> Result<BatchOutcome, SearchError> {
        if documents.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let response = self
            .post(self.docs_url("index")?, &upload_payload(documents))
            .await?;
        let failed_ids = failed_keys(&response);
        if !failed_ids.is_empty() {
            warn!(failed = failed_ids.len(), "azure search rejected documents");
        }
        Ok(BatchOutcome { failed_ids })
    }

    async fn hybrid_query(&self, request: &HybridRequest) -> Result<HybridHits, SearchError> {
        let response = self
            .post(self.docs_url("search")?, &search_payload(request))
            .await?;
        let hits = parse_hits(&response);
        debug!(hits = hits.len(), hybrid = request.vector.is_some(), "azure search query");
        Ok(HybridHits::Fused(hits))
    }

    async fn delete_source(&self, source: &str) -> Result<usize, SearchError> {
        let mut removed = 0;
        loop {
            let ids = self.search_ids_for_source(source).await?;
            if ids.is_empty() {
                return Ok(removed);
            }

            let actions: Vec<Value> = ids
                .iter()
                .map(|id| json!({ "@search.action": "delete", "id": id }))
                .collect();
            let response = self
                .post(self.docs_url("index")?, &json!({ "value": actions }))
                .await?;

            let failed = failed_keys(&response);
            removed += ids.len() - failed.len();
            if !failed.is_empty() || ids.len() < DELETE_PAGE_SIZE {
                return Ok(removed);
            }
        }
    }

    async fn document_count(&self) -> Result<usize, SearchError> {
        let response = self
            .client
            .get(self.docs_url("$count")?)
            .header("api-key", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{status}: {body}"),
            });
        }
        // The count endpoint answers with a bare number, sometimes behind a BOM.
        body.trim_start_matches('\u{feff}')
            .trim()
            .parse::<usize>()
            .map_err(|error| SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("unexpected count body {body:?}: {error}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[tokio::test]
    async fn unresponsive_service_times_out() -> Result<(), Box<dyn std::error::Error>> {
        // The kernel completes the handshake from the backlog; nothing ever answers.
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let endpoint = format!("http://{}", listener.local_addr()?);
        let store = AzureSearchStore::new(&endpoint, "key", "manuals")?
            .with_timeout(Duration::from_millis(200))?;

        let result = store
            .hybrid_query(&HybridRequest {
                keyword_text: "reset".to_string(),
                vector: None,
                top: 5,
            })
            .await;

        match result {
            Err(error @ SearchError::Http(_)) => assert!(error.is_retryable()),
            other => panic!("expected a timeout, got {other:?}"),
        }
        drop(listener);
        Ok(())
    }

    #[test]
    fn schema_uses_cosine_hnsw_and_key_field() {
        let definition = schema_definition(&IndexSchema::for_chunks("manuals", 1536));
        assert_eq!(
            definition.pointer("/vectorSearch/algorithms/0/hnswParameters/metric"),
            Some(&json!("cosine"))
        );
        assert_eq!(
            definition.pointer("/vectorSearch/algorithms/0/hnswParameters/m"),
            Some(&json!(4))
        );
        assert_eq!(definition.pointer("/fields/0/key"), Some(&json!(true)));
        assert_eq!(definition.pointer("/fields/4/dimensions"), Some(&json!(1536)));
    }

    #[test]
    fn uploads_use_merge_or_upload() {
        let payload = upload_payload(&[Chunk {
            id: "Manual_page_5".to_string(),
            content: "network settings".to_string(),
            source: "Manual.pdf".to_string(),
            page: 5,
            embedding: Some(vec![0.1, 0.2]),
        }]);
        assert_eq!(
            payload.pointer("/value/0/@search.action"),
            Some(&json!("mergeOrUpload"))
        );
        assert_eq!(payload.pointer("/value/0/page"), Some(&json!(5)));
    }

    #[test]
    fn keyword_only_search_omits_vector_queries() {
        let keyword_only = search_payload(&HybridRequest {
            keyword_text: "reset".to_string(),
            vector: None,
            top: 15,
        });
        assert!(keyword_only.get("vectorQueries").is_none());

        let hybrid = search_payload(&HybridRequest {
            keyword_text: "reset".to_string(),
            vector: Some(vec![0.5]),
            top: 15,
        });
        assert_eq!(hybrid.pointer("/vectorQueries/0/k"), Some(&json!(15)));
    }

    #[test]
    fn per_document_failures_are_reported_by_key() {
        let response = json!({
            "value": [
                {"key": "a_page_1", "status": true, "statusCode": 201},
                {"key": "a_page_2", "status": false, "statusCode": 400, "errorMessage": "bad"}
            ]
        });
        assert_eq!(failed_keys(&response), vec!["a_page_2".to_string()]);
    }

    #[test]
    fn hits_carry_fused_scores() {
        let response = json!({
            "value": [
                {
                    "@search.score": 0.032,
                    "id": "Manual_page_5",
                    "content": "network settings",
                    "source": "Manual.pdf",
                    "page": 5
                }
            ]
        });
        let hits = parse_hits(&response);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_ref.source, "Manual.pdf");
        assert_eq!(hits[0].chunk_ref.page, 5);
        assert!((hits[0].score - 0.032).abs() < f64::EPSILON);
    }
}
