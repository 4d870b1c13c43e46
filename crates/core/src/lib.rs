pub mod chunking;
pub mod condense;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod history;
pub mod index;
pub mod ingest;
pub mod library;
pub mod models;
pub mod ollama;
pub mod orchestrator;
pub mod pdf_bundle;
pub mod rerank;
pub mod retrieval;
pub mod stream;
pub mod synthesize;
pub mod traits;

pub use chunking::{chunk_by_paragraph, normalize_whitespace, split_page, ChunkingConfig};
pub use condense::condense;
pub use config::{
    EmbeddingBackend, OllamaConfig, PagechatConfig, RerankConfig, RetrievalConfig, StorageConfig,
};
pub use embeddings::{cosine_similarity, CharacterNgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{
    BundleError, ConfigError, IndexError, IngestError, LibraryError, ModelError, PipelineError,
};
pub use extractor::{FileReader, PageReader, SourceKind};
pub use history::{new_session_id, ChatHistoryStore};
pub use index::{IndexManifest, IndexSnapshot, IndexStore, InsertOutcome, OpenedIndex};
pub use ingest::{IngestionReport, SkippedFile};
pub use library::DocumentLibrary;
pub use models::{ChatTurn, DocumentPage, PageInput, Passage, Role, ScoredPassage};
pub use ollama::OllamaClient;
pub use orchestrator::{ChatPipeline, CompletedTurn, TurnOutcome, TurnRequest, TurnState};
pub use pdf_bundle::{extract_pages, write_pdf, BundleStatus, BundleWriter, PageSelection};
pub use rerank::{HttpReranker, RerankBackend, TermOverlapReranker};
pub use retrieval::RetrievalChain;
pub use stream::{AnswerStream, StreamState};
pub use synthesize::synthesize;
pub use traits::{Embedder, LanguageModel, Reranker};
