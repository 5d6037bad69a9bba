use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use manual_rag_core::config::{
    require_text, DEFAULT_BATCH_SIZE, DEFAULT_CONTEXT_BUDGET_CHARS, DEFAULT_TOP_K,
};
use manual_rag_core::openai::DEFAULT_AZURE_API_VERSION;
use manual_rag_core::stores::azure::DEFAULT_SEARCH_API_VERSION;
use manual_rag_core::{
    ApiFlavor, AzureSearchStore, CancellationFlag, CharacterNgramEmbedder, Embedder,
    EmbeddingProvider, HybridRetriever, InMemoryIndex, IngestionSummary, Ingestor, LopdfExtractor,
    OpenAiChatProvider, OpenAiClient, OpenAiEmbeddingProvider, QueryEngine, QueryOptions,
    QueryOutcome, QueryResult, RagConfig, SearchCandidate, SearchIndex, SearchMode,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXCERPT_CHARS: usize = 300;

#[derive(Parser)]
#[command(name = "manual-rag", version, about = "Question answering over PDF manuals")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Where chunks are indexed.
    #[arg(long, value_enum, env = "RAG_BACKEND", default_value = "azure")]
    backend: Backend,

    /// Which model produces embeddings.
    #[arg(long, value_enum, env = "RAG_EMBEDDER", default_value = "openai")]
    embedder: EmbedderKind,

    /// Azure AI Search endpoint
    #[arg(long, env = "SEARCH_ENDPOINT")]
    search_endpoint: Option<String>,

    /// Azure AI Search admin key
    #[arg(long, env = "SEARCH_KEY", hide_env_values = true)]
    search_key: Option<String>,

    /// Azure AI Search api-version
    #[arg(long, env = "SEARCH_API_VERSION", default_value = DEFAULT_SEARCH_API_VERSION)]
    search_api_version: String,

    /// Search index name
    #[arg(long, env = "INDEX_NAME", default_value = "manuals")]
    index_name: String,

    /// Snapshot file for the in-memory backend
    #[arg(long, env = "MEMORY_INDEX_PATH", default_value = "manual-index.json")]
    memory_index_path: PathBuf,

    /// OpenAI or Azure OpenAI endpoint
    #[arg(long, env = "OPENAI_ENDPOINT")]
    openai_endpoint: Option<String>,

    /// OpenAI or Azure OpenAI key
    #[arg(long, env = "OPENAI_KEY", hide_env_values = true)]
    openai_key: Option<String>,

    /// Request shape of the model endpoint.
    #[arg(long, value_enum, env = "OPENAI_FLAVOR", default_value = "azure")]
    openai_flavor: Flavor,

    /// Azure OpenAI api-version
    #[arg(long, env = "OPENAI_API_VERSION", default_value = DEFAULT_AZURE_API_VERSION)]
    openai_api_version: String,

    /// Embedding model or deployment name
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-ada-002")]
    embedding_model: String,

    /// Chat model or deployment name
    #[arg(long, env = "CHAT_MODEL", default_value = "gpt-4")]
    chat_model: String,

    /// Width of the embedding vectors
    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Chunks per upload batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Characters of retrieved text sent to the model
    #[arg(long, env = "CONTEXT_BUDGET_CHARS", default_value_t = DEFAULT_CONTEXT_BUDGET_CHARS)]
    context_budget_chars: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Azure,
    Memory,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    Openai,
    Ngram,
}

#[derive(Clone, Copy, ValueEnum)]
enum Flavor {
    Azure,
    Openai,
}

#[derive(Subcommand)]
enum Command {
    /// Index every PDF under a folder, one chunk per page.
    Ingest {
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: PathBuf,
    },
    /// Answer a question from the indexed manuals. Without a question, starts a prompt loop.
    Ask {
        /// Single question; omit it for an interactive prompt.
        #[arg(long)]
        question: Option<String>,
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
        /// Skip the embedding call and rank by keywords only.
        #[arg(long, default_value_t = false)]
        keyword_only: bool,
        /// Print the context sent to the model.
        #[arg(long, default_value_t = false)]
        show_context: bool,
        #[arg(long)]
        temperature: Option<f32>,
    },
    /// Show ranked pages for a query without generating an answer.
    Search {
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
        #[arg(long, default_value_t = false)]
        keyword_only: bool,
    },
    /// Remove every chunk of one source file from the index.
    Purge {
        /// Source as stored: the path below the ingest folder, e.g. printer/Manual.pdf
        #[arg(long)]
        source: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = RagConfig {
        index_name: cli.index_name.clone(),
        embedding_model: cli.embedding_model.clone(),
        generation_model: cli.chat_model.clone(),
        embedding_dimensions: cli.embedding_dimensions,
        batch_size: cli.batch_size,
        context_budget_chars: cli.context_budget_chars,
        ..RagConfig::default()
    }
    .validated()?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        backend = cli.backend.name(),
        "manual-rag boot"
    );

    let index = open_index(&cli).await?;
    let provider = embedding_provider(&cli, &config)?;
    let embedder = Embedder::new(provider.as_ref(), &config);

    match &cli.command {
        Command::Ingest { folder } => {
            let cancel = CancellationFlag::new();
            let signal_flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current batch");
                    signal_flag.cancel();
                }
            });

            let extractor = LopdfExtractor;
            let ingestor = Ingestor::new(&extractor, index.as_ref(), &embedder, &config);
            let summary = ingestor.ingest_folder(folder, &cancel).await?;
            print_summary(&summary);
        }
        Command::Ask {
            question,
            top_k,
            keyword_only,
            show_context,
            temperature,
        } => {
            let generator = OpenAiChatProvider::new(openai_client(&cli)?, &cli.chat_model);
            let engine = QueryEngine::new(index.as_ref(), &embedder, &generator, &config);
            let options = QueryOptions {
                top_k: *top_k,
                mode: search_mode(*keyword_only),
                temperature: temperature.unwrap_or(config.temperature),
                include_context: *show_context,
            };

            match question {
                Some(question) => {
                    let result = engine.answer_question(question, &options).await?;
                    print_result(&result);
                }
                None => {
                    let mut lines = BufReader::new(tokio::io::stdin()).lines();
                    loop {
                        print!("\nQuestion: ");
                        std::io::stdout().flush()?;
                        let Some(line) = lines.next_line().await? else {
                            break;
                        };
                        let line = line.trim();
                        if matches!(line.to_ascii_lowercase().as_str(), "quit" | "exit" | "q") {
                            break;
                        }
                        if line.is_empty() {
                            continue;
                        }
                        match engine.answer_question(line, &options).await {
                            Ok(result) => print_result(&result),
                            Err(error) => println!("Error: {error}"),
                        }
                    }
                }
            }
        }
        Command::Search {
            query,
            top_k,
            keyword_only,
        } => {
            let retriever = HybridRetriever::new(index.as_ref(), &embedder, &config);
            let candidates = retriever
                .search(query, *top_k, search_mode(*keyword_only))
                .await?;
            if candidates.is_empty() {
                println!("No relevant documents found.");
            }
            for candidate in &candidates {
                print_candidate(candidate);
            }
        }
        Command::Purge { source } => {
            let extractor = LopdfExtractor;
            let ingestor = Ingestor::new(&extractor, index.as_ref(), &embedder, &config);
            let removed = ingestor.purge_source(source).await?;
            println!("removed {removed} chunk(s) of {source}");
        }
    }

    Ok(())
}

impl Backend {
    fn name(self) -> &'static str {
        match self {
            Self::Azure => "azure",
            Self::Memory => "memory",
        }
    }
}

fn search_mode(keyword_only: bool) -> SearchMode {
    if keyword_only {
        SearchMode::KeywordOnly
    } else {
        SearchMode::Hybrid
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> anyhow::Result<&'a str> {
    let value = value.as_deref().unwrap_or_default();
    require_text(name, value)?;
    Ok(value)
}

async fn open_index(cli: &Cli) -> anyhow::Result<Box<dyn SearchIndex>> {
    match cli.backend {
        Backend::Azure => {
            let endpoint = required(&cli.search_endpoint, "SEARCH_ENDPOINT")?;
            let key = required(&cli.search_key, "SEARCH_KEY")?;
            let store = AzureSearchStore::new(endpoint, key, cli.index_name.as_str())?
                .with_api_version(cli.search_api_version.as_str());
            Ok(Box::new(store))
        }
        Backend::Memory => {
            let store = InMemoryIndex::open(cli.memory_index_path.clone())
                .await
                .with_context(|| {
                    format!("loading index snapshot {}", cli.memory_index_path.display())
                })?;
            Ok(Box::new(store))
        }
    }
}

fn openai_client(cli: &Cli) -> anyhow::Result<OpenAiClient> {
    let endpoint = required(&cli.openai_endpoint, "OPENAI_ENDPOINT")?;
    let key = required(&cli.openai_key, "OPENAI_KEY")?;
    let flavor = match cli.openai_flavor {
        Flavor::Azure => ApiFlavor::Azure {
            api_version: cli.openai_api_version.clone(),
        },
        Flavor::Openai => ApiFlavor::OpenAi,
    };
    Ok(OpenAiClient::new(endpoint, key, flavor)?)
}

fn embedding_provider(
    cli: &Cli,
    config: &RagConfig,
) -> anyhow::Result<Box<dyn EmbeddingProvider>> {
    match cli.embedder {
        EmbedderKind::Openai => Ok(Box::new(OpenAiEmbeddingProvider::new(
            openai_client(cli)?,
            &config.embedding_model,
        ))),
        EmbedderKind::Ngram => Ok(Box::new(CharacterNgramEmbedder::new(
            config.embedding_dimensions,
        ))),
    }
}

fn print_summary(summary: &IngestionSummary) {
    for skipped in &summary.skipped_files {
        println!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    println!(
        "files found: {}, processed: {}, skipped: {}",
        summary.files_found,
        summary.files_processed,
        summary.skipped_files.len()
    );
    println!(
        "chunks: {}, uploaded: {}, errors: {}",
        summary.chunks_processed, summary.uploaded, summary.errors
    );
    if summary.interrupted {
        println!("ingestion was interrupted; rerun to index the remaining files");
    }
    println!(
        "finished at {} ({}s)",
        summary.finished_at.to_rfc3339(),
        (summary.finished_at - summary.started_at).num_seconds()
    );
}

fn print_result(result: &QueryResult) {
    if result.degraded_to_keyword {
        println!("(vector search unavailable, results ranked by keywords only)");
    }
    if let Some(context) = &result.context_used {
        println!("--- context ---\n{context}\n---------------");
    }

    match &result.outcome {
        QueryOutcome::Answered => {
            println!("\n{}", result.answer.as_deref().unwrap_or_default());
            if result.truncated {
                println!("(answer truncated at the token limit)");
            }
        }
        QueryOutcome::NoRelevantDocuments if !result.candidates.is_empty() => {
            println!(
                "Retrieved {} page(s), but none fits the context budget; \
                 raise --context-budget-chars.",
                result.candidates.len()
            );
            return;
        }
        QueryOutcome::NoRelevantDocuments => {
            println!("No relevant documents found.");
            return;
        }
        QueryOutcome::GenerationFailed { reason } => {
            println!("Answer generation failed, showing retrieved excerpts ({reason})");
            for candidate in &result.candidates {
                print_candidate(candidate);
            }
        }
    }

    println!("\nSources:");
    for source in &result.sources {
        println!("  - {source}");
    }
}

fn print_candidate(candidate: &SearchCandidate) {
    let chunk = &candidate.chunk_ref;
    let excerpt: String = chunk.content.chars().take(EXCERPT_CHARS).collect();
    println!(
        "[{}, page {}] rank={:.4} vector={} keyword={}",
        chunk.source,
        chunk.page,
        candidate.combined_rank,
        format_score(candidate.vector_score),
        format_score(candidate.keyword_score)
    );
    println!("  {}", excerpt.replace('\n', " "));
}

fn format_score(score: Option<f64>) -> String {
    score.map_or_else(|| "-".to_string(), |score| format!("{score:.4}"))
}
