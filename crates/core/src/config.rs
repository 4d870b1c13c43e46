use crate::chunking::ChunkingConfig;
use crate::{ConfigError, ModelError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub persist_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            persist_dir: PathBuf::from("search_index_storage"),
            tmp_dir: PathBuf::from("tmp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub embed_model: String,
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:1b".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingBackend {
    #[default]
    Ollama,
    CharTrigram,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Candidates fetched from the vector index.
    pub top_k: usize,
    /// Candidates kept after reranking.
    pub top_n: usize,
    pub similarity_cutoff: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            top_n: 5,
            similarity_cutoff: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RerankConfig {
    /// TEI-compatible rerank endpoint; the local term-overlap scorer is used
    /// when unset.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagechatConfig {
    pub storage: StorageConfig,
    pub ollama: OllamaConfig,
    pub embedding: EmbeddingBackend,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub chunking: ChunkingConfig,
    pub session_idle_ttl_secs: u64,
}

impl Default for PagechatConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            ollama: OllamaConfig::default(),
            embedding: EmbeddingBackend::default(),
            retrieval: RetrievalConfig::default(),
            rerank: RerankConfig::default(),
            chunking: ChunkingConfig::default(),
            session_idle_ttl_secs: 3_600,
        }
    }
}

impl PagechatConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("ollama", &self.ollama.base_url)?;
        if let Some(endpoint) = &self.rerank.endpoint {
            check_url("rerank", endpoint)?;
        }
        if self.retrieval.top_k == 0 || self.retrieval.top_n == 0 {
            return Err(ConfigError::Retrieval(
                "top_k and top_n must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_cutoff) {
            return Err(ConfigError::Retrieval(format!(
                "similarity cutoff {} is outside 0..=1",
                self.retrieval.similarity_cutoff
            )));
        }
        Ok(())
    }
}

/// Parses a service base URL, appending a trailing slash so that
/// `Url::join` keeps any path prefix.
pub fn parse_base_url(raw: &str) -> Result<Url, ModelError> {
    Ok(with_trailing_slash(raw)?)
}

fn with_trailing_slash(raw: &str) -> Result<Url, url::ParseError> {
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("{trimmed}/"))
    }
}

fn check_url(field: &'static str, raw: &str) -> Result<(), ConfigError> {
    with_trailing_slash(raw)
        .map(|_| ())
        .map_err(|source| ConfigError::InvalidUrl {
            field,
            value: raw.to_string(),
            source,
        })
}
