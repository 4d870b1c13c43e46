use crate::condense::condense;
use crate::history::ChatHistoryStore;
use crate::index::IndexStore;
use crate::pdf_bundle::{BundleStatus, BundleWriter, PageSelection};
use crate::retrieval::RetrievalChain;
use crate::stream::AnswerStream;
use crate::synthesize::synthesize;
use crate::traits::{LanguageModel, Reranker};
use crate::{BundleError, ChatTurn, PipelineError, ScoredPassage};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TurnState {
    Start,
    Condensed,
    Retrieved,
    Responding,
    Done,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub question: String,
    /// Replaces the stored session history for this turn only.
    pub history: Option<Vec<ChatTurn>>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            question: question.into(),
            history: None,
        }
    }
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub session_id: String,
    pub condensed_query: String,
    pub passages: Vec<ScoredPassage>,
    pub answer: AnswerStream,
    pub bundle: JoinHandle<Result<BundleStatus, BundleError>>,
}

/// A drained turn: the full reply has been recorded in the session.
#[derive(Debug, Clone)]
pub struct CompletedTurn {
    pub condensed_query: String,
    pub passages: Vec<ScoredPassage>,
    pub reply: String,
    pub bundle: Option<BundleStatus>,
}

pub struct ChatPipeline<M, R>
where
    M: LanguageModel,
    R: Reranker,
{
    index: Arc<IndexStore>,
    history: Arc<ChatHistoryStore>,
    model: M,
    reranker: R,
    chain: RetrievalChain,
    bundles: Arc<BundleWriter>,
}

impl<M, R> ChatPipeline<M, R>
where
    M: LanguageModel,
    R: Reranker,
{
    pub fn new(
        index: Arc<IndexStore>,
        history: Arc<ChatHistoryStore>,
        model: M,
        reranker: R,
        chain: RetrievalChain,
        bundles: Arc<BundleWriter>,
    ) -> Self {
        Self {
            index,
            history,
            model,
            reranker,
            chain,
            bundles,
        }
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    pub fn history(&self) -> &Arc<ChatHistoryStore> {
        &self.history
    }

    pub fn bundles(&self) -> &Arc<BundleWriter> {
        &self.bundles
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Runs a turn up to the point where the answer starts streaming. The
    /// user's question is recorded only once the model accepted the request.
    pub async fn start_turn(&self, request: TurnRequest) -> Result<TurnOutcome, PipelineError> {
        let TurnRequest {
            session_id,
            question,
            history,
        } = request;
        if question.trim().is_empty() {
            return Err(PipelineError::InvalidTurn("question is empty".to_string()));
        }

        let mut state = TurnState::Start;
        let history = match history {
            Some(explicit) => explicit,
            None => self.history.history(&session_id),
        };
        info!(session_id = %session_id, history = history.len(), "turn started");

        let condensed_query = condense(&self.model, &question, &history).await?;
        advance(&session_id, &mut state, TurnState::Condensed);

        let passages = self
            .chain
            .run(&self.index, &self.reranker, &condensed_query)
            .await?;
        advance(&session_id, &mut state, TurnState::Retrieved);

        let bundle = self.spawn_bundle(&session_id, &passages);

        let answer = synthesize(&self.model, &question, &passages, &history).await?;
        advance(&session_id, &mut state, TurnState::Responding);
        self.history.append(&session_id, ChatTurn::user(question));

        advance(&session_id, &mut state, TurnState::Done);
        Ok(TurnOutcome {
            session_id,
            condensed_query,
            passages,
            answer,
            bundle,
        })
    }

    /// Records the assistant's reply once the caller has drained the answer.
    pub fn record_reply(&self, session_id: &str, reply: impl Into<String>) {
        self.history.append(session_id, ChatTurn::assistant(reply));
    }

    /// Runs a whole turn without streaming: drains the answer, records it,
    /// and waits for the bundle.
    pub async fn answer(&self, request: TurnRequest) -> Result<CompletedTurn, PipelineError> {
        let outcome = self.start_turn(request).await?;
        let reply = outcome.answer.collect_text().await?;
        self.record_reply(&outcome.session_id, reply.clone());

        let bundle = match outcome.bundle.await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(_)) => None,
            Err(error) => {
                warn!(session_id = %outcome.session_id, %error, "bundle task failed");
                None
            }
        };

        Ok(CompletedTurn {
            condensed_query: outcome.condensed_query,
            passages: outcome.passages,
            reply,
            bundle,
        })
    }

    fn spawn_bundle(
        &self,
        session_id: &str,
        passages: &[ScoredPassage],
    ) -> JoinHandle<Result<BundleStatus, BundleError>> {
        let selection = PageSelection::from_passages(passages.iter().map(|hit| &hit.passage));
        let bundles = Arc::clone(&self.bundles);
        let ticket = bundles.begin(session_id);
        let session_id = session_id.to_string();

        tokio::task::spawn_blocking(move || {
            let result = bundles.write(&session_id, ticket, &selection);
            if let Err(error) = &result {
                warn!(session_id = %session_id, %error, "bundle extraction failed");
            }
            result
        })
    }
}

fn advance(session_id: &str, state: &mut TurnState, next: TurnState) {
    debug_assert!(next > *state, "turn states only move forward");
    debug!(session_id, from = ?*state, to = ?next, "turn transition");
    *state = next;
}
