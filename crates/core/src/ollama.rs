//! Ollama client used for completions, streamed chat, and embeddings.

use crate::config::{parse_base_url, OllamaConfig};
use crate::stream::{AnswerStream, FragmentStream};
use crate::traits::{Embedder, LanguageModel};
use crate::{ChatTurn, ModelError};
use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const BACKEND: &str = "ollama";

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
    model: String,
    embed_model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunkMessage {
    #[serde(default)]
    content: String,
}

/// One decoded line of a streamed chat response.
#[derive(Debug, PartialEq)]
pub(crate) struct ChatDelta {
    pub content: String,
    pub done: bool,
}

impl OllamaClient {
    /// Connecting and every read between chunks are bounded by the request
    /// timeout. Non-streaming calls are also bounded as a whole; a streamed
    /// answer may take longer in total as long as it keeps arriving.
    pub fn new(config: &OllamaConfig) -> Result<Self, ModelError> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .read_timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: parse_base_url(&config.base_url)?,
            request_timeout,
            model: config.model.clone(),
            embed_model: config.embed_model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn health_check(&self) -> bool {
        let Ok(url) = self.base_url.join("api/tags") else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        total_timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ModelError> {
        let url = self.base_url.join(path)?;
        let mut request = self.client.post(url).json(body);
        if let Some(timeout) = total_timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{path} returned {status}: {body}"),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        debug!(model = %self.model, "requesting completion");
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };
        let response = self
            .post_json("api/generate", &request, Some(self.request_timeout))
            .await?;
        let payload: GenerateResponse = response.json().await?;
        Ok(payload.response)
    }

    async fn stream_chat(&self, messages: &[ChatTurn]) -> Result<AnswerStream, ModelError> {
        info!(model = %self.model, messages = messages.len(), "opening chat stream");
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };
        let response = self.post_json("api/chat", &request, None).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()));
        Ok(AnswerStream::new(chat_deltas(body)))
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    fn model_name(&self) -> String {
        format!("ollama/{}", self.embed_model)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let request = EmbedRequest {
            model: &self.embed_model,
            prompt: text,
        };
        let response = self
            .post_json("api/embeddings", &request, Some(self.request_timeout))
            .await?;
        let payload: EmbedResponse = response.json().await?;
        if payload.embedding.is_empty() {
            return Err(ModelError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("empty embedding from {}", self.embed_model),
            });
        }
        Ok(payload.embedding)
    }
}

/// Splits a byte stream into newline-terminated records. Partial lines are
/// buffered until their terminator arrives.
#[derive(Debug, Default)]
pub(crate) struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
            line.pop();
            lines.push(line);
        }
        lines
    }

    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

pub(crate) fn parse_chat_line(line: &[u8]) -> Result<Option<ChatDelta>, ModelError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let chunk: ChatChunk = serde_json::from_slice(line)?;
    if let Some(error) = chunk.error {
        return Err(ModelError::BackendResponse {
            backend: BACKEND.to_string(),
            details: error,
        });
    }

    Ok(Some(ChatDelta {
        content: chunk.message.map(|message| message.content).unwrap_or_default(),
        done: chunk.done,
    }))
}

struct ChatStreamState<S> {
    body: Pin<Box<S>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<Vec<u8>>,
    exhausted: bool,
    done: bool,
}

/// Turns a streamed `/api/chat` body into text deltas. A body that ends
/// before a `done: true` record yields [`ModelError::Truncated`].
pub(crate) fn chat_deltas<S, E>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<Vec<u8>, E>> + Send + 'static,
    E: Into<ModelError> + Send + 'static,
{
    let state = ChatStreamState {
        body: Box::pin(body),
        decoder: NdjsonDecoder::default(),
        pending: VecDeque::new(),
        exhausted: false,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }

            if let Some(line) = state.pending.pop_front() {
                match parse_chat_line(&line) {
                    Ok(Some(delta)) => {
                        if delta.done {
                            state.done = true;
                        }
                        if !delta.content.is_empty() {
                            return Some((Ok(delta.content), state));
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        state.done = true;
                        return Some((Err(error), state));
                    }
                }
                continue;
            }

            if state.exhausted {
                state.done = true;
                return Some((Err(ModelError::Truncated), state));
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let lines = state.decoder.push(&bytes);
                    state.pending.extend(lines);
                }
                Some(Err(error)) => {
                    state.done = true;
                    return Some((Err(error.into()), state));
                }
                None => {
                    state.exhausted = true;
                    if let Some(rest) = state.decoder.finish() {
                        state.pending.push_back(rest);
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::{chat_deltas, parse_chat_line, ChatDelta, NdjsonDecoder, OllamaClient};
    use crate::config::OllamaConfig;
    use crate::stream::AnswerStream;
    use crate::traits::LanguageModel;
    use crate::{ChatTurn, ModelError};
    use futures_util::stream;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Reads one HTTP request, headers plus a `content-length` body.
    async fn read_request(socket: &mut TcpStream) {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = socket.read(&mut chunk).await.unwrap();
            if read == 0 {
                return;
            }
            buffer.extend_from_slice(&chunk[..read]);

            let Some(header_end) = buffer.windows(4).position(|window| window == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&buffer[..header_end]).to_ascii_lowercase();
            let body_len = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buffer.len() >= header_end + 4 + body_len {
                return;
            }
        }
    }

    /// Serves one chunked `/api/chat` response, pausing between lines.
    async fn slow_chat_server(lines: Vec<String>, pause: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            for line in lines {
                tokio::time::sleep(pause).await;
                let payload = format!("{line}\n");
                let frame = format!("{:x}\r\n{payload}\r\n", payload.len());
                socket.write_all(frame.as_bytes()).await.unwrap();
                socket.flush().await.unwrap();
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
            socket.flush().await.unwrap();
        });

        format!("http://{address}")
    }

    fn body(chunks: &[&str]) -> Vec<Result<Vec<u8>, ModelError>> {
        chunks.iter().map(|chunk| Ok(chunk.as_bytes().to_vec())).collect()
    }

    #[test]
    fn decoder_buffers_partial_lines() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(b"{\"a\":").is_empty());
        let lines = decoder.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
        assert_eq!(decoder.finish(), Some(b"{\"c\"".to_vec()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn chat_line_parses_content_and_done() {
        let delta = parse_chat_line(br#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            delta,
            ChatDelta {
                content: "Hi".to_string(),
                done: false
            }
        );
        assert!(parse_chat_line(b"   ").unwrap().is_none());
    }

    #[test]
    fn chat_line_error_field_is_surfaced() {
        let result = parse_chat_line(br#"{"error":"model not found"}"#);
        assert!(matches!(result, Err(ModelError::BackendResponse { .. })));
    }

    #[tokio::test]
    async fn deltas_survive_lines_split_across_chunks() {
        let chunks = body(&[
            "{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"message\":{\"con",
            "tent\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
        ]);
        let mut answer = AnswerStream::new(chat_deltas(stream::iter(chunks)));

        assert_eq!(answer.next_fragment().await.unwrap().unwrap(), "Hel");
        assert_eq!(answer.next_fragment().await.unwrap().unwrap(), "lo");
        assert!(answer.next_fragment().await.is_none());
        assert!(answer.is_finished());
    }

    #[tokio::test]
    async fn final_line_without_newline_is_parsed() {
        let chunks = body(&["{\"message\":{\"content\":\"ok\"},\"done\":true}"]);
        let answer = AnswerStream::new(chat_deltas(stream::iter(chunks)));
        assert_eq!(answer.collect_text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn body_ending_without_done_is_truncation() {
        let chunks = body(&["{\"message\":{\"content\":\"par\"},\"done\":false}\n"]);
        let answer = AnswerStream::new(chat_deltas(stream::iter(chunks)));
        assert!(matches!(answer.collect_text().await, Err(ModelError::Truncated)));
    }

    #[tokio::test]
    async fn slow_but_steady_stream_outlives_the_request_timeout() {
        let lines = ["a", "b", "c"]
            .iter()
            .map(|text| format!("{{\"message\":{{\"content\":\"{text}\"}},\"done\":false}}"))
            .chain(std::iter::once(
                "{\"message\":{\"content\":\"d\"},\"done\":true}".to_string(),
            ))
            .collect::<Vec<_>>();
        let base_url = slow_chat_server(lines, Duration::from_millis(500)).await;

        let client = OllamaClient::new(&OllamaConfig {
            base_url,
            request_timeout_secs: 1,
            ..OllamaConfig::default()
        })
        .unwrap();
        let answer = client.stream_chat(&[ChatTurn::user("hi")]).await.unwrap();
        assert_eq!(answer.collect_text().await.unwrap(), "abcd");
    }
}
