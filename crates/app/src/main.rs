mod server;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use pagechat_core::{
    extract_pages, new_session_id, write_pdf, BundleStatus, BundleWriter, CharacterNgramEmbedder,
    ChatHistoryStore, ChatPipeline, DocumentLibrary, Embedder, EmbeddingBackend, FileReader,
    HttpReranker, IndexStore, IngestionReport, OllamaClient, OpenedIndex, PageSelection,
    PagechatConfig, RerankBackend, RetrievalChain, TermOverlapReranker, TurnRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub type Pipeline = ChatPipeline<OllamaClient, RerankBackend>;

#[derive(Parser)]
#[command(name = "pagechat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Source documents, one subfolder per category
    #[arg(long, env = "PAGECHAT_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    /// Where the index is persisted
    #[arg(long, env = "PAGECHAT_PERSIST_DIR", default_value = "search_index_storage", global = true)]
    persist_dir: PathBuf,

    /// Where per-session result bundles are written
    #[arg(long, env = "PAGECHAT_TMP_DIR", default_value = "tmp", global = true)]
    tmp_dir: PathBuf,

    /// Ollama base URL
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434", global = true)]
    ollama_url: String,

    /// Chat model served by Ollama
    #[arg(long, env = "PAGECHAT_MODEL", default_value = "llama3.2:1b", global = true)]
    model: String,

    /// Embedding model served by Ollama
    #[arg(long, env = "PAGECHAT_EMBED_MODEL", default_value = "nomic-embed-text", global = true)]
    embed_model: String,

    #[arg(long, env = "PAGECHAT_EMBEDDING", value_enum, default_value = "ollama", global = true)]
    embedding: EmbeddingArg,

    /// TEI-compatible reranker; term overlap is used when unset
    #[arg(long, env = "PAGECHAT_RERANK_URL", global = true)]
    rerank_url: Option<String>,

    /// Candidates fetched from the index
    #[arg(long, default_value_t = 5, global = true)]
    top_k: usize,

    /// Candidates kept after reranking
    #[arg(long, default_value_t = 5, global = true)]
    top_n: usize,

    #[arg(long, default_value_t = 0.6, global = true)]
    similarity_cutoff: f32,

    /// Timeout for every model request, in seconds
    #[arg(long, env = "PAGECHAT_REQUEST_TIMEOUT", default_value_t = 60, global = true)]
    request_timeout: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbeddingArg {
    Ollama,
    CharTrigram,
}

#[derive(Subcommand)]
enum Command {
    /// Build the index from the data folder, or load it if already built.
    Ingest,
    /// Ask one question and stream the answer.
    Ask {
        /// Session id used for the result bundle; generated when omitted.
        /// History is kept in memory, so separate runs do not share turns.
        #[arg(long)]
        session: Option<String>,
        question: String,
    },
    /// Interactive chat on stdin.
    Chat {
        #[arg(long)]
        session: Option<String>,
    },
    /// Copy pages of a PDF into a new PDF, all at the size of the first.
    Extract {
        #[arg(long)]
        source: PathBuf,
        /// Zero-based page indices, comma separated.
        #[arg(long, value_delimiter = ',', required = true)]
        pages: Vec<u32>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Serve the chat API over HTTP.
    Serve {
        #[arg(long, env = "PAGECHAT_BIND", default_value = "127.0.0.1:8000")]
        bind: String,
        /// Sessions idle for longer than this are forgotten, in seconds
        #[arg(long, default_value_t = 3_600)]
        session_ttl: u64,
    },
}

impl Cli {
    fn config(&self) -> PagechatConfig {
        let mut config = PagechatConfig::default();
        config.storage.data_dir = self.data_dir.clone();
        config.storage.persist_dir = self.persist_dir.clone();
        config.storage.tmp_dir = self.tmp_dir.clone();
        config.ollama.base_url = self.ollama_url.clone();
        config.ollama.model = self.model.clone();
        config.ollama.embed_model = self.embed_model.clone();
        config.ollama.request_timeout_secs = self.request_timeout;
        config.embedding = match self.embedding {
            EmbeddingArg::Ollama => EmbeddingBackend::Ollama,
            EmbeddingArg::CharTrigram => EmbeddingBackend::CharTrigram,
        };
        config.rerank.endpoint = self.rerank_url.clone();
        config.retrieval.top_k = self.top_k;
        config.retrieval.top_n = self.top_n;
        config.retrieval.similarity_cutoff = self.similarity_cutoff;
        if let Command::Serve { session_ttl, .. } = &self.command {
            config.session_idle_ttl_secs = *session_ttl;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    config.validate().context("invalid configuration")?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pagechat boot"
    );

    match cli.command {
        Command::Ingest => {
            let ollama = OllamaClient::new(&config.ollama)?;
            let opened = open_index(&config, &ollama).await?;
            match opened.report {
                Some(report) => print_report(&report),
                None => println!(
                    "index loaded from {} ({} passages)",
                    config.storage.persist_dir.display(),
                    opened.store.len()
                ),
            }
        }
        Command::Ask { session, question } => {
            let pipeline = build_pipeline(&config).await?;
            let session_id = session.unwrap_or_else(new_session_id);
            stream_turn(&pipeline, TurnRequest::new(session_id, question)).await?;
        }
        Command::Chat { session } => {
            let pipeline = build_pipeline(&config).await?;
            let session_id = session.unwrap_or_else(new_session_id);
            run_chat(&pipeline, &session_id).await?;
        }
        Command::Extract { source, pages, out } => {
            let mut selection = PageSelection::new();
            for page in pages {
                selection.add(&source, page);
            }
            let mut document = extract_pages(&selection);
            let count = document.get_pages().len();
            write_pdf(&mut document, &out)?;
            println!("{count} page(s) written to {}", out.display());
        }
        Command::Serve { bind, .. } => {
            let pipeline = build_pipeline(&config).await?;
            let library = DocumentLibrary::new(&config.storage.data_dir);
            let ttl = Duration::from_secs(config.session_idle_ttl_secs);
            server::run_server(pipeline, library, &bind, ttl).await?;
        }
    }

    Ok(())
}

async fn open_index(config: &PagechatConfig, ollama: &OllamaClient) -> anyhow::Result<OpenedIndex> {
    let embedder: Arc<dyn Embedder> = match config.embedding {
        EmbeddingBackend::Ollama => Arc::new(ollama.clone()),
        EmbeddingBackend::CharTrigram => Arc::new(CharacterNgramEmbedder::default()),
    };

    IndexStore::load_or_create(
        &config.storage.data_dir,
        &config.storage.persist_dir,
        embedder,
        Arc::new(FileReader),
        config.chunking,
    )
    .await
    .with_context(|| format!("failed to open index at {}", config.storage.persist_dir.display()))
}

async fn build_pipeline(config: &PagechatConfig) -> anyhow::Result<Pipeline> {
    let ollama = OllamaClient::new(&config.ollama)?;
    if !ollama.health_check().await {
        warn!(url = %config.ollama.base_url, "ollama is not reachable; turns will fail until it is");
    }

    let opened = open_index(config, &ollama).await?;
    if let Some(report) = &opened.report {
        print_report(report);
    }

    let reranker = match &config.rerank.endpoint {
        Some(endpoint) => RerankBackend::Http(HttpReranker::new(
            endpoint,
            Duration::from_secs(config.ollama.request_timeout_secs),
        )?),
        None => RerankBackend::TermOverlap(TermOverlapReranker),
    };

    Ok(ChatPipeline::new(
        Arc::new(opened.store),
        Arc::new(ChatHistoryStore::new()),
        ollama,
        reranker,
        RetrievalChain::from(config.retrieval),
        Arc::new(BundleWriter::new(&config.storage.tmp_dir)),
    ))
}

fn print_report(report: &IngestionReport) {
    for skipped in &report.skipped_files {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped document");
    }
    println!(
        "{} file(s), {} page(s), {} passage(s) indexed; {} skipped",
        report.indexed_files,
        report.indexed_pages,
        report.passages,
        report.skipped_files.len()
    );
}

async fn stream_turn(pipeline: &Pipeline, request: TurnRequest) -> anyhow::Result<()> {
    let mut outcome = pipeline.start_turn(request).await?;
    let mut stdout = tokio::io::stdout();
    let mut reply = String::new();

    while let Some(fragment) = outcome.answer.next_fragment().await {
        let fragment = fragment?;
        stdout.write_all(fragment.as_bytes()).await?;
        stdout.flush().await?;
        reply.push_str(&fragment);
    }
    stdout.write_all(b"\n").await?;
    pipeline.record_reply(&outcome.session_id, reply);

    for hit in &outcome.passages {
        let line = format!(
            "  source={} page={} score={:.3}\n",
            hit.passage.source_path, hit.passage.page_index, hit.score
        );
        stdout.write_all(line.as_bytes()).await?;
    }
    stdout.flush().await?;

    match outcome.bundle.await {
        Ok(Ok(BundleStatus::Written { pages })) => info!(
            pages,
            path = %pipeline.bundles().bundle_path(&outcome.session_id).display(),
            "result bundle ready"
        ),
        Ok(Ok(BundleStatus::Superseded)) => {}
        Ok(Err(error)) => warn!(%error, "result bundle not written"),
        Err(error) => warn!(%error, "bundle task failed"),
    }
    Ok(())
}

async fn run_chat(pipeline: &Pipeline, session_id: &str) -> anyhow::Result<()> {
    println!("session {session_id}; type 'exit' to leave");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }

        if let Err(error) = stream_turn(pipeline, TurnRequest::new(session_id, question)).await {
            warn!(%error, "turn failed");
            println!("error: {error}");
        }
    }
    Ok(())
}
