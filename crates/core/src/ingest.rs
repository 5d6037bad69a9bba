use crate::chunking::{build_chunks, source_name, ChunkingOptions};
use crate::config::RagConfig;
use crate::embeddings::Embedder;
use crate::error::{IngestError, RagError};
use crate::extractor::PdfExtractor;
use crate::models::{Chunk, IngestionSummary, SkippedPdf};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::schema::IndexSchema;
use crate::traits::{EmbeddingProvider, SearchIndex};
use crate::writer::{IndexWriter, UploadReport};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Shared stop signal, checked between files and between upload batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Walks a folder of PDFs and pushes one embedded chunk per page into the index.
pub struct Ingestor<'a, X: ?Sized, S: ?Sized, P: ?Sized> {
    extractor: &'a X,
    index: &'a S,
    embedder: &'a Embedder<'a, P>,
    writer: IndexWriter<'a, S>,
    schema: IndexSchema,
    chunking: ChunkingOptions,
    concurrency: usize,
    retry: RetryPolicy,
}

impl<'a, X, S, P> Ingestor<'a, X, S, P>
where
    X: PdfExtractor + ?Sized,
    S: SearchIndex + ?Sized,
    P: EmbeddingProvider + ?Sized,
{
    pub fn new(
        extractor: &'a X,
        index: &'a S,
        embedder: &'a Embedder<'a, P>,
        config: &RagConfig,
    ) -> Self {
        Self {
            extractor,
            index,
            embedder,
            writer: IndexWriter::new(index, config),
            schema: IndexSchema::for_chunks(config.index_name.clone(), embedder.dimensions()),
            chunking: config.chunking_options(),
            concurrency: config.embedding_concurrency,
            retry: config.retry,
        }
    }

    /// Ingests every PDF under `folder`.
    ///
    /// Per-file and per-batch failures end up in the summary. Only a missing
    /// folder or a failed schema setup abort the run.
    pub async fn ingest_folder(
        &self,
        folder: &Path,
        cancel: &CancellationFlag,
    ) -> Result<IngestionSummary, RagError> {
        if !folder.is_dir() {
            return Err(RagError::Extraction {
                path: folder.to_path_buf(),
                source: IngestError::InvalidArgument(format!(
                    "{} is not a directory",
                    folder.display()
                )),
            });
        }

        self.writer.ensure_schema(&self.schema).await?;

        let files = discover_pdf_files(folder);
        let mut summary = IngestionSummary::started(files.len());
        if files.is_empty() {
            warn!(folder = %folder.display(), "no pdf files found");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }
        info!(folder = %folder.display(), files = files.len(), "ingestion started");

        let batch_size = self.writer.batch_size();
        let mut pending: Vec<Chunk> = Vec::new();

        'files: for path in files {
            if cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }

            self.ingest_file(folder, &path, &mut summary, &mut pending).await;

            while pending.len() >= batch_size {
                if cancel.is_cancelled() {
                    summary.interrupted = true;
                    break 'files;
                }
                let batch: Vec<Chunk> = pending.drain(..batch_size).collect();
                record_upload(&mut summary, self.writer.upload_batch(&batch).await);
            }
        }

        if !pending.is_empty() {
            if summary.interrupted || cancel.is_cancelled() {
                summary.interrupted = true;
                warn!(dropped = pending.len(), "ingestion interrupted before final batch");
            } else {
                record_upload(&mut summary, self.writer.upload(&pending).await);
            }
        }

        summary.finished_at = Utc::now();
        info!(
            files_processed = summary.files_processed,
            skipped = summary.skipped_files.len(),
            chunks = summary.chunks_processed,
            uploaded = summary.uploaded,
            errors = summary.errors,
            interrupted = summary.interrupted,
            "ingestion finished"
        );
        Ok(summary)
    }

    async fn ingest_file(
        &self,
        root: &Path,
        path: &Path,
        summary: &mut IngestionSummary,
        pending: &mut Vec<Chunk>,
    ) {
        let chunks = match self.chunk_file(root, path) {
            Ok(chunks) => chunks,
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping pdf");
                summary.errors += 1;
                summary.skipped_files.push(SkippedPdf {
                    path: path.to_path_buf(),
                    reason: error.to_string(),
                });
                return;
            }
        };

        summary.files_processed += 1;
        summary.chunks_processed += chunks.len();

        let embedded = self.embedder.embed_chunks(chunks, self.concurrency).await;
        summary.errors += embedded.failed.len();
        summary
            .failed_ids
            .extend(embedded.failed.into_iter().map(|(id, _)| id));

        info!(path = %path.display(), chunks = embedded.ready.len(), "pdf chunked");
        pending.extend(embedded.ready);
    }

    fn chunk_file(&self, root: &Path, path: &Path) -> Result<Vec<Chunk>, IngestError> {
        let source = source_name(root, path)?;
        let pages = self.extractor.extract_pages(path)?;
        let chunks = build_chunks(&source, &pages, &self.chunking);
        if chunks.is_empty() {
            return Err(IngestError::NoText(source));
        }
        Ok(chunks)
    }

    /// Removes every chunk of `source` from the index.
    pub async fn purge_source(&self, source: &str) -> Result<usize, RagError> {
        let removed = retry_with_backoff(&self.retry, "delete_source", || {
            self.index.delete_source(source)
        })
        .await
        .map_err(|exhausted| RagError::IndexWrite {
            failed_ids: Vec::new(),
            reason: format!("could not purge {source}: {}", exhausted.last),
        })?;
        info!(source, removed, "source purged");
        Ok(removed)
    }
}

fn record_upload(summary: &mut IngestionSummary, report: UploadReport) {
    summary.uploaded += report.uploaded;
    summary.errors += report.failed_ids.len();
    summary.failed_ids.extend(report.failed_ids);
}
