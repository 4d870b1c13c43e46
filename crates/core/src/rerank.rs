use crate::config::parse_base_url;
use crate::traits::Reranker;
use crate::{ModelError, Passage};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

/// Cross-encoder reranker behind a TEI-style `POST /rerank` endpoint.
#[derive(Debug, Clone)]
pub struct HttpReranker {
    client: Client,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct RerankHit {
    index: usize,
    score: f32,
}

impl HttpReranker {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ModelError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: parse_base_url(base_url)?.join("rerank")?,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, passages: &[Passage]) -> Result<Vec<f32>, ModelError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let texts = passages
            .iter()
            .map(|passage| passage.text.as_str())
            .collect::<Vec<_>>();

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({
                "query": query,
                "texts": texts,
                "raw_scores": false,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ModelError::BackendResponse {
                backend: "reranker".to_string(),
                details: response.status().to_string(),
            });
        }

        let hits: Vec<RerankHit> = response.json().await?;
        scores_in_input_order(&hits, passages.len())
    }
}

fn scores_in_input_order(hits: &[RerankHit], expected: usize) -> Result<Vec<f32>, ModelError> {
    let mut scores = vec![None; expected];
    for hit in hits {
        let slot = scores.get_mut(hit.index).ok_or_else(|| ModelError::BackendResponse {
            backend: "reranker".to_string(),
            details: format!("score for unknown passage index {}", hit.index),
        })?;
        *slot = Some(hit.score);
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(index, score)| {
            score.ok_or_else(|| ModelError::BackendResponse {
                backend: "reranker".to_string(),
                details: format!("missing score for passage {index}"),
            })
        })
        .collect()
}

/// Scores a passage by the share of distinct query terms it contains.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermOverlapReranker;

impl TermOverlapReranker {
    pub fn score_text(&self, query: &str, text: &str) -> f32 {
        let terms = query_terms(query);
        if terms.is_empty() {
            return 0.0;
        }

        let lowered = text.to_lowercase();
        let matched = terms.iter().filter(|term| lowered.contains(term.as_str())).count();
        matched as f32 / terms.len() as f32
    }
}

fn query_terms(query: &str) -> HashSet<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() > 2)
        .collect()
}

#[async_trait]
impl Reranker for TermOverlapReranker {
    async fn score(&self, query: &str, passages: &[Passage]) -> Result<Vec<f32>, ModelError> {
        Ok(passages
            .iter()
            .map(|passage| self.score_text(query, &passage.text))
            .collect())
    }
}

/// The reranker chosen from configuration.
#[derive(Debug, Clone)]
pub enum RerankBackend {
    Http(HttpReranker),
    TermOverlap(TermOverlapReranker),
}

#[async_trait]
impl Reranker for RerankBackend {
    async fn score(&self, query: &str, passages: &[Passage]) -> Result<Vec<f32>, ModelError> {
        match self {
            RerankBackend::Http(reranker) => reranker.score(query, passages).await,
            RerankBackend::TermOverlap(reranker) => reranker.score(query, passages).await,
        }
    }
}
