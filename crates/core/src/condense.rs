use crate::traits::LanguageModel;
use crate::{ChatTurn, ModelError};
use tracing::debug;

/// One `role: content` line per turn.
pub fn format_history(history: &[ChatTurn]) -> String {
    history
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Each slot is filled exactly once, so braces in user text are left alone.
pub fn condense_prompt(question: &str, history: &[ChatTurn]) -> String {
    format!(
        "Given the chat history:\n'''{}'''\n\nAnd the user asked the following question:{}\nRewrite to a standalone question:\n",
        format_history(history),
        question
    )
}

/// Folds the conversation into the retrieval query. The question itself is
/// always kept verbatim at the end, so a poor summary cannot drop it.
pub async fn condense<M>(model: &M, question: &str, history: &[ChatTurn]) -> Result<String, ModelError>
where
    M: LanguageModel + ?Sized,
{
    if history.is_empty() {
        return Ok(question.to_string());
    }

    let summary = model.complete(&condense_prompt(question, history)).await?;
    debug!(turns = history.len(), summary_chars = summary.len(), "condensed history");
    Ok(format!("Context:\n{summary}\nQuestion: {question}"))
}
