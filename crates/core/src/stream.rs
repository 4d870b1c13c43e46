//! Pull-driven answer stream handed from the synthesizer to the caller.
//!
//! The stream is single-pass. Each poll yields the next text delta from the
//! model. It ends when the model reports completion, or with an error if the
//! upstream call fails or the body ends early. [`AnswerStream::cancel`]
//! drops the underlying request so the model call is released immediately,
//! without waiting for the value to go out of scope.

use crate::ModelError;
use futures_util::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Completed,
    Failed,
    Cancelled,
}

pub struct AnswerStream {
    inner: Option<FragmentStream>,
    state: StreamState,
}

impl AnswerStream {
    pub fn new(inner: FragmentStream) -> Self {
        Self {
            inner: Some(inner),
            state: StreamState::Open,
        }
    }

    /// A stream over already-known fragments that completes normally.
    pub fn from_fragments(fragments: Vec<String>) -> Self {
        Self::new(Box::pin(stream::iter(fragments.into_iter().map(Ok))))
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// True once the model's own stop condition was observed.
    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Completed
    }

    pub async fn next_fragment(&mut self) -> Option<Result<String, ModelError>> {
        self.next().await
    }

    /// Releases the model call. Later polls yield nothing.
    pub fn cancel(&mut self) {
        if self.inner.take().is_some() {
            debug!("answer stream cancelled");
            self.state = StreamState::Cancelled;
        }
    }

    /// Drains the stream and returns the full reply text.
    pub async fn collect_text(mut self) -> Result<String, ModelError> {
        let mut reply = String::new();
        while let Some(fragment) = self.next().await {
            reply.push_str(&fragment?);
        }
        Ok(reply)
    }
}

impl Stream for AnswerStream {
    type Item = Result<String, ModelError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.inner = None;
                this.state = StreamState::Completed;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(error))) => {
                this.inner = None;
                this.state = StreamState::Failed;
                Poll::Ready(Some(Err(error)))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for AnswerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerStream")
            .field("state", &self.state)
            .finish()
    }
}
