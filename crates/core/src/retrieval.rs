use crate::config::RetrievalConfig;
use crate::index::IndexStore;
use crate::traits::Reranker;
use crate::{PipelineError, ScoredPassage};
use tracing::debug;

/// Vector search, then rerank, then a relevance cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalChain {
    pub top_k: usize,
    pub top_n: usize,
    pub similarity_cutoff: f32,
}

impl Default for RetrievalChain {
    fn default() -> Self {
        RetrievalConfig::default().into()
    }
}

impl From<RetrievalConfig> for RetrievalChain {
    fn from(config: RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            top_n: config.top_n,
            similarity_cutoff: config.similarity_cutoff,
        }
    }
}

impl RetrievalChain {
    /// Passages relevant to `query`, best first. An empty result is not an
    /// error.
    pub async fn run<R>(
        &self,
        index: &IndexStore,
        reranker: &R,
        query: &str,
    ) -> Result<Vec<ScoredPassage>, PipelineError>
    where
        R: Reranker + ?Sized,
    {
        let candidates = index.retrieve(query, self.top_k).await?;
        if candidates.is_empty() {
            debug!("no candidates from the index");
            return Ok(candidates);
        }

        let passages = candidates
            .iter()
            .map(|candidate| candidate.passage.clone())
            .collect::<Vec<_>>();
        let scores = reranker.score(query, &passages).await?;
        if scores.len() != candidates.len() {
            return Err(PipelineError::InvalidTurn(format!(
                "reranker returned {} scores for {} passages",
                scores.len(),
                candidates.len()
            )));
        }

        let considered = candidates.len();
        let reranked = rerank_candidates(candidates, &scores, self.top_n);
        let kept = apply_cutoff(reranked, self.similarity_cutoff);
        debug!(considered, kept = kept.len(), "retrieval finished");
        Ok(kept)
    }
}

/// Replaces each candidate's score with its rerank score, sorts best first,
/// and keeps at most `top_n`.
pub fn rerank_candidates(
    candidates: Vec<ScoredPassage>,
    scores: &[f32],
    top_n: usize,
) -> Vec<ScoredPassage> {
    let mut reranked = candidates
        .into_iter()
        .zip(scores.iter().copied())
        .map(|(candidate, score)| ScoredPassage {
            passage: candidate.passage,
            score,
        })
        .collect::<Vec<_>>();
    reranked.sort_by(|left, right| right.score.total_cmp(&left.score));
    reranked.truncate(top_n);
    reranked
}

pub fn apply_cutoff(passages: Vec<ScoredPassage>, cutoff: f32) -> Vec<ScoredPassage> {
    passages
        .into_iter()
        .filter(|passage| passage.score >= cutoff)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::extractor::FileReader;
    use crate::rerank::TermOverlapReranker;
    use crate::{ModelError, Passage};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn scored(id: &str, score: f32) -> ScoredPassage {
        ScoredPassage {
            passage: Passage {
                node_id: id.to_string(),
                source_path: "doc.pdf".to_string(),
                page_index: 0,
                chunk_index: 0,
                text: id.to_string(),
            },
            score,
        }
    }

    fn ids(passages: &[ScoredPassage]) -> Vec<&str> {
        passages
            .iter()
            .map(|passage| passage.passage.node_id.as_str())
            .collect()
    }

    #[test]
    fn rerank_is_a_bounded_subset_in_score_order() {
        let candidates = vec![scored("a", 0.9), scored("b", 0.8), scored("c", 0.7)];
        let reranked = rerank_candidates(candidates, &[0.1, 0.95, 0.5], 2);
        assert_eq!(ids(&reranked), vec!["b", "c"]);
        assert_eq!(reranked[0].score, 0.95);
    }

    #[test]
    fn cutoff_is_monotonic() {
        let passages = vec![scored("a", 0.9), scored("b", 0.61), scored("c", 0.59)];
        let loose = apply_cutoff(passages.clone(), 0.5);
        let strict = apply_cutoff(passages.clone(), 0.6);
        let strictest = apply_cutoff(passages, 0.95);

        assert_eq!(ids(&loose), vec!["a", "b", "c"]);
        assert_eq!(ids(&strict), vec!["a", "b"]);
        assert!(strictest.is_empty());
        assert!(strict.iter().all(|kept| loose.contains(kept)));
    }

    struct BrokenReranker;

    #[async_trait]
    impl Reranker for BrokenReranker {
        async fn score(&self, _query: &str, _passages: &[Passage]) -> Result<Vec<f32>, ModelError> {
            Ok(vec![1.0])
        }
    }

    async fn index_with(texts: &[&str]) -> (tempfile::TempDir, IndexStore) {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("notes.txt"), texts.join("\u{000C}")).unwrap();

        let opened = IndexStore::load_or_create(
            &data_dir,
            &dir.path().join("storage"),
            Arc::new(CharacterNgramEmbedder::default()),
            Arc::new(FileReader),
            ChunkingConfig::default(),
        )
        .await
        .unwrap();
        (dir, opened.store)
    }

    #[tokio::test]
    async fn chain_keeps_only_relevant_passages() {
        let (_dir, index) = index_with(&[
            "The pump pressure limit is 40 bar",
            "Cafeteria opening hours",
            "Pump maintenance every six months",
        ])
        .await;
        let chain = RetrievalChain::default();

        let passages = chain
            .run(&index, &TermOverlapReranker, "pump pressure limit")
            .await
            .unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].passage.page_index, 0);
        assert_eq!(passages[0].score, 1.0);
    }

    #[tokio::test]
    async fn empty_index_yields_no_passages() {
        let (_dir, index) = index_with(&[""]).await;
        let passages = RetrievalChain::default()
            .run(&index, &TermOverlapReranker, "anything")
            .await
            .unwrap();
        assert!(passages.is_empty());
    }

    #[tokio::test]
    async fn reranker_must_score_every_candidate() {
        let (_dir, index) = index_with(&["alpha text", "beta text"]).await;
        let result = RetrievalChain::default()
            .run(&index, &BrokenReranker, "alpha")
            .await;
        assert!(matches!(result, Err(PipelineError::InvalidTurn(_))));
    }
}
