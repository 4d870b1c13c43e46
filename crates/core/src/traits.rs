use crate::{AnswerStream, ChatTurn, ModelError, Passage};
use async_trait::async_trait;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Name recorded in the index manifest; a persisted index built with a
    /// different model is refused on load.
    fn model_name(&self) -> String;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Single-shot, non-streaming completion.
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;

    async fn stream_chat(&self, messages: &[ChatTurn]) -> Result<AnswerStream, ModelError>;
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns one relevance score per passage, in input order.
    async fn score(&self, query: &str, passages: &[Passage]) -> Result<Vec<f32>, ModelError>;
}
