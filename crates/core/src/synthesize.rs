use crate::stream::AnswerStream;
use crate::traits::LanguageModel;
use crate::{ChatTurn, ModelError, ScoredPassage};
use tracing::debug;

const CONTEXT_HEADER: &str = "Information that might help:\n-----\n";
const CONTEXT_FOOTER: &str =
    "-----\nPlease write a response to the following question, using the above information if relevant:\n";

/// The user message for the answer. Without passages the question is sent
/// unchanged.
pub fn build_context_prompt(question: &str, passages: &[ScoredPassage]) -> String {
    if passages.is_empty() {
        return question.to_string();
    }

    let mut prompt = String::from(CONTEXT_HEADER);
    for passage in passages {
        prompt.push('\n');
        prompt.push_str(&passage.passage.text);
        prompt.push_str("\n\n");
    }
    prompt.push('\n');
    prompt.push_str(CONTEXT_FOOTER);
    prompt.push_str(question);
    prompt.push('\n');
    prompt
}

pub async fn synthesize<M>(
    model: &M,
    question: &str,
    passages: &[ScoredPassage],
    history: &[ChatTurn],
) -> Result<AnswerStream, ModelError>
where
    M: LanguageModel + ?Sized,
{
    let mut messages = history.to_vec();
    messages.push(ChatTurn::user(build_context_prompt(question, passages)));
    debug!(messages = messages.len(), passages = passages.len(), "requesting answer");
    model.stream_chat(&messages).await
}
