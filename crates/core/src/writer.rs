use crate::config::RagConfig;
use crate::error::RagError;
use crate::models::Chunk;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::schema::IndexSchema;
use crate::traits::SearchIndex;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    pub uploaded: usize,
    pub failed_ids: Vec<String>,
    pub batches: usize,
    pub failed_batches: usize,
}

impl UploadReport {
    pub fn absorb(&mut self, other: UploadReport) {
        self.uploaded += other.uploaded;
        self.failed_ids.extend(other.failed_ids);
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
    }
}

/// Uploads embedded chunks in fixed-size batches. A rejected batch is recorded and
/// the remaining batches still go out.
pub struct IndexWriter<'a, S: ?Sized> {
    index: &'a S,
    batch_size: usize,
    retry: RetryPolicy,
}

impl<'a, S> IndexWriter<'a, S>
where
    S: SearchIndex + ?Sized,
{
    pub fn new(index: &'a S, config: &RagConfig) -> Self {
        Self {
            index,
            batch_size: config.batch_size.max(1),
            retry: config.retry,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn ensure_schema(&self, schema: &IndexSchema) -> Result<(), RagError> {
        retry_with_backoff(&self.retry, "create_or_update_schema", || {
            self.index.create_or_update_schema(schema)
        })
        .await
        .map_err(|exhausted| RagError::IndexWrite {
            failed_ids: Vec::new(),
            reason: format!("schema setup for {} failed: {}", schema.name, exhausted.last),
        })
    }

    pub async fn upload(&self, chunks: &[Chunk]) -> UploadReport {
        let mut report = UploadReport::default();
        for batch in chunks.chunks(self.batch_size) {
            report.absorb(self.upload_batch(batch).await);
        }
        report
    }

    pub async fn upload_batch(&self, batch: &[Chunk]) -> UploadReport {
        let mut report = UploadReport {
            batches: 1,
            ..UploadReport::default()
        };

        let (ready, missing): (Vec<&Chunk>, Vec<&Chunk>) =
            batch.iter().partition(|chunk| chunk.embedding.is_some());
        report
            .failed_ids
            .extend(missing.iter().map(|chunk| chunk.id.clone()));
        if ready.is_empty() {
            return report;
        }
        let documents: Vec<Chunk> = ready.into_iter().cloned().collect();

        match self.send(&documents).await {
            Ok(rejected) => {
                report.uploaded += documents.len() - rejected.len();
                report.failed_ids.extend(rejected);
            }
            Err(error) => {
                warn!(batch_len = documents.len(), %error, "batch upload failed");
                report.failed_batches += 1;
                report
                    .failed_ids
                    .extend(documents.iter().map(|chunk| chunk.id.clone()));
            }
        }

        info!(
            backend = self.index.backend(),
            uploaded = report.uploaded,
            failed = report.failed_ids.len(),
            "batch processed"
        );
        report
    }

    async fn send(&self, documents: &[Chunk]) -> Result<Vec<String>, RagError> {
        let outcome = retry_with_backoff(&self.retry, "upsert_batch", || {
            self.index.upsert_batch(documents)
        })
        .await
        .map_err(|exhausted| RagError::IndexWrite {
            failed_ids: documents.iter().map(|chunk| chunk.id.clone()).collect(),
            reason: exhausted.last.to_string(),
        })?;
        Ok(outcome.failed_ids)
    }
}
