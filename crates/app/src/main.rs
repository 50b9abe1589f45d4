use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use contract_search_core::{
    discover_pdf_files, CharacterNgramEmbedder, ClearAllConfirmation, ContractLocks,
    ContractMetadata, CustomerCategoryLookup, DocumentLifecycle, ElasticsearchStore, Embedder, FallbackPdfExtractor,
    HttpEmbedder, HybridSearchEngine, LlmMetadataExtractor, PageIndexer, SearchFilters,
    SearchQuery, ServiceConfig, DEFAULT_EMBEDDING_DIMENSIONS,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const HTTP_EMBEDDING_DIMENSIONS: usize = 1024;

#[derive(Parser)]
#[command(name = "contract-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Elasticsearch base URL
    #[arg(long, env = "CONTRACT_SEARCH_ES_URL", default_value = "http://localhost:9200")]
    es_url: String,

    /// Prefix of the `{prefix}_documents` and `{prefix}_pages` indices
    #[arg(long, env = "CONTRACT_SEARCH_INDEX_PREFIX", default_value = "contracts")]
    index_prefix: String,

    /// OpenAI-compatible embeddings endpoint; the local n-gram embedder is used when unset
    #[arg(long, env = "CONTRACT_EMBEDDING_URL")]
    embedding_url: Option<String>,

    #[arg(long, env = "CONTRACT_EMBEDDING_MODEL", default_value = "bge-m3")]
    embedding_model: String,

    /// Vector size; defaults to 1024 for a remote embedder and 384 for the local one
    #[arg(long, env = "CONTRACT_EMBEDDING_DIMS")]
    embedding_dims: Option<usize>,

    /// Bearer token for the embedding and LLM endpoints
    #[arg(long, env = "CONTRACT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// OpenAI-compatible chat completions endpoint used for metadata extraction
    #[arg(long, env = "CONTRACT_LLM_URL")]
    llm_url: Option<String>,

    #[arg(long, env = "CONTRACT_LLM_MODEL", default_value = "qwen-plus")]
    llm_model: String,

    /// JSON file mapping customer names to categories
    #[arg(long, env = "CONTRACT_CATEGORY_MAP")]
    category_map: Option<PathBuf>,

    /// TOML file with `[indexer]` and `[ranking]` tables
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the document and page indices if they are missing.
    Init,
    /// Ingest one PDF or every PDF below a folder.
    Ingest {
        #[arg(long, conflicts_with = "folder", required_unless_present = "folder")]
        file: Option<PathBuf>,
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Run metadata extraction before marking documents completed.
        #[arg(long, default_value_t = false)]
        extract_metadata: bool,
    },
    /// Show the processing status of one contract.
    Status { name: String },
    /// Re-run metadata extraction for an indexed contract.
    ExtractMetadata { name: String },
    /// Store hand-edited metadata from a JSON file for an indexed contract.
    SaveMetadata {
        name: String,
        /// JSON object with `ContractMetadata` fields; missing fields are cleared.
        #[arg(long)]
        file: PathBuf,
    },
    /// Hybrid lexical, vector and metadata search.
    Search(SearchArgs),
    /// List every contract, newest upload first.
    List,
    /// Print the indexed pages of one contract.
    Pages { name: String },
    /// Delete one contract and its pages.
    Delete { name: String },
    /// Delete every contract. Requires the confirmation phrase.
    ClearAll {
        #[arg(long)]
        confirm: String,
    },
    /// Report, and optionally fail, documents stuck in a non-terminal state.
    Stale {
        /// Overrides `indexer.stale_after`.
        #[arg(long)]
        max_age_secs: Option<u64>,
        #[arg(long, default_value_t = false)]
        fail: bool,
    },
}

#[derive(Args)]
struct SearchArgs {
    #[arg(long, default_value = "")]
    query: String,
    #[arg(long, default_value = "10")]
    top_k: usize,
    #[arg(long)]
    amount_min: Option<f64>,
    #[arg(long)]
    amount_max: Option<f64>,
    /// Inclusive lower signing date (YYYY-MM-DD).
    #[arg(long)]
    date_start: Option<NaiveDate>,
    #[arg(long)]
    date_end: Option<NaiveDate>,
    #[arg(long, default_value_t = false)]
    explain: bool,
}

/// Page listing without the embedding vectors.
#[derive(Serialize)]
struct PageView {
    page_id: u32,
    char_count: usize,
    text: String,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ServiceConfig> {
    let Some(path) = path else {
        return Ok(ServiceConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_embedder(cli: &Cli) -> Arc<dyn Embedder> {
    match &cli.embedding_url {
        Some(url) => Arc::new(HttpEmbedder::new(
            url.clone(),
            cli.embedding_model.clone(),
            cli.api_key.clone(),
            cli.embedding_dims.unwrap_or(HTTP_EMBEDDING_DIMENSIONS),
        )),
        None => Arc::new(CharacterNgramEmbedder {
            dimensions: cli.embedding_dims.unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS),
        }),
    }
}

async fn ingest_file(indexer: &PageIndexer, path: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file_name = path.to_string_lossy();
    let report = indexer
        .ingest_and_wait(&file_name, bytes)
        .await
        .with_context(|| format!("ingesting {}", path.display()))?;
    print_json(&report)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    let embedder = build_embedder(&cli);
    let store = Arc::new(ElasticsearchStore::new(
        cli.es_url.clone(),
        &cli.index_prefix,
        embedder.dimensions(),
    ));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        documents = store.documents_index(),
        pages = store.pages_index(),
        "contract-search boot"
    );

    if let Command::Ingest { extract_metadata: true, .. } = &cli.command {
        config.indexer.extract_metadata_on_ingest = true;
    }

    let locks = ContractLocks::new();
    let mut indexer = PageIndexer::new(
        store.clone(),
        embedder.clone(),
        Arc::new(FallbackPdfExtractor::from_env()),
        config.indexer.clone(),
    )
    .with_locks(locks.clone());

    if let Some(url) = &cli.llm_url {
        indexer = indexer.with_metadata_extractor(Arc::new(LlmMetadataExtractor::new(
            url.clone(),
            cli.llm_model.clone(),
            cli.api_key.clone(),
            config.indexer.retry.clone(),
        )));
    } else if config.indexer.extract_metadata_on_ingest {
        warn!("metadata extraction requested but no LLM endpoint configured; skipping it");
    }
    if let Some(path) = &cli.category_map {
        indexer = indexer.with_category_lookup(Arc::new(CustomerCategoryLookup::new(path.clone())));
    }

    let lifecycle = DocumentLifecycle::new(store.clone(), locks, &config.indexer);

    match cli.command {
        Command::Init => {
            store.ensure_indices().await.context("creating indices")?;
            println!(
                "indices ready: {} {}",
                store.documents_index(),
                store.pages_index()
            );
        }
        Command::Ingest { file, folder, .. } => {
            if let Some(file) = file {
                ingest_file(&indexer, &file).await?;
            } else if let Some(folder) = folder {
                let files = discover_pdf_files(&folder);
                info!(folder = %folder.display(), files = files.len(), "ingesting folder");

                let mut failed = 0usize;
                for path in &files {
                    if let Err(error) = ingest_file(&indexer, path).await {
                        failed += 1;
                        warn!(path = %path.display(), error = %format!("{error:#}"), "skipped pdf");
                    }
                }
                println!("{} of {} files ingested", files.len() - failed, files.len());
            }
        }
        Command::Status { name } => {
            print_json(&lifecycle.get_status(&name).await?)?;
        }
        Command::ExtractMetadata { name } => {
            let result = indexer
                .extract_metadata(&name)
                .await
                .with_context(|| format!("extracting metadata for {name}"))?;
            print_json(&result)?;
        }
        Command::SaveMetadata { name, file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let edited: ContractMetadata = serde_json::from_str(&raw)
                .with_context(|| format!("parsing metadata in {}", file.display()))?;
            let result = indexer
                .save_metadata(&name, edited)
                .await
                .with_context(|| format!("saving metadata for {name}"))?;
            print_json(&result)?;
        }
        Command::Search(args) => {
            let engine = HybridSearchEngine::new(store.clone(), embedder, config.ranking.clone());
            let mut query = SearchQuery::new(args.query, args.top_k).with_filters(SearchFilters {
                amount_min: args.amount_min,
                amount_max: args.amount_max,
                date_start: args.date_start,
                date_end: args.date_end,
            });
            query.explain = args.explain;

            let result = engine.search(&query).await.context("search failed")?;
            print_json(&result)?;
        }
        Command::List => {
            print_json(&lifecycle.list().await?)?;
        }
        Command::Pages { name } => {
            let pages: Vec<PageView> = lifecycle
                .get_pages(&name)
                .await?
                .into_iter()
                .map(|page| PageView {
                    page_id: page.page_id,
                    char_count: page.char_count,
                    text: page.text,
                })
                .collect();
            print_json(&pages)?;
        }
        Command::Delete { name } => {
            print_json(&lifecycle.delete(&name).await?)?;
        }
        Command::ClearAll { confirm } => {
            let confirmation = ClearAllConfirmation::parse(&confirm)?;
            print_json(&lifecycle.clear_all(&confirmation).await?)?;
        }
        Command::Stale { max_age_secs, fail } => {
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or(config.indexer.stale_after);
            if fail {
                print_json(&lifecycle.fail_stale(max_age).await?)?;
            } else {
                print_json(&lifecycle.find_stale(max_age).await?)?;
            }
        }
    }

    Ok(())
}
