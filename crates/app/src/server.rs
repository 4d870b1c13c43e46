//! HTTP surface for the chat pipeline.
//!
//! `POST /chat` streams the answer as plain text. The assistant's reply is
//! recorded in the session once the body has been fully sent; a client that
//! disconnects early drops the model call and leaves no assistant turn.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use pagechat_core::{
    new_session_id, AnswerStream, BundleError, BundleStatus, ChatTurn, DocumentLibrary, IndexError,
    InsertOutcome, LibraryError, ModelError, PipelineError, TurnRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::Pipeline;

const UPLOAD_LIMIT_BYTES: usize = 256 * 1024 * 1024;
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    library: Arc<DocumentLibrary>,
}

pub async fn run_server(
    pipeline: Pipeline,
    library: DocumentLibrary,
    bind: &str,
    session_ttl: Duration,
) -> anyhow::Result<()> {
    let state = AppState {
        pipeline: Arc::new(pipeline),
        library: Arc::new(library),
    };
    spawn_session_eviction(Arc::clone(&state.pipeline), chrono::Duration::from_std(session_ttl)?);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/chat", post(handle_chat))
        .route("/upload", post(handle_upload))
        .route("/categories", get(handle_categories))
        .route("/pdf/{category}/{file}", get(handle_source_document))
        .route("/results/{session_id}", get(handle_results))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "pagechat listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn spawn_session_eviction(pipeline: Arc<Pipeline>, ttl: chrono::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            ticker.tick().await;
            for session_id in pipeline.history().evict_idle(ttl) {
                pipeline.bundles().forget(&session_id);
            }
        }
    });
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<PipelineError> for AppError {
    fn from(error: PipelineError) -> Self {
        match &error {
            PipelineError::InvalidTurn(_) => bad_request(error.to_string()),
            PipelineError::Model(_) => {
                AppError::new(StatusCode::BAD_GATEWAY, "model_error", error.to_string())
            }
            PipelineError::Index(_) => internal(error.to_string()),
        }
    }
}

impl From<LibraryError> for AppError {
    fn from(error: LibraryError) -> Self {
        match &error {
            LibraryError::InvalidName(_) => bad_request(error.to_string()),
            LibraryError::NotFound(_) => not_found(error.to_string()),
            LibraryError::Io(_) => internal(error.to_string()),
        }
    }
}

// ============ Handlers ============

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    history: Option<Vec<ChatTurn>>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let session_id = request
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_session_id);

    let outcome = state
        .pipeline
        .start_turn(TurnRequest {
            session_id: session_id.clone(),
            question: request.message,
            history: request.history,
        })
        .await?;

    tokio::spawn(log_bundle(session_id.clone(), outcome.bundle));
    let body = reply_body(Arc::clone(&state.pipeline), session_id.clone(), outcome.answer);

    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("x-session-id", session_id)
        .body(Body::from_stream(body))
        .map_err(|error| internal(error.to_string()))
}

async fn log_bundle(session_id: String, bundle: JoinHandle<Result<BundleStatus, BundleError>>) {
    match bundle.await {
        Ok(Ok(BundleStatus::Written { pages })) => {
            info!(session_id = %session_id, pages, "result bundle ready")
        }
        Ok(Ok(BundleStatus::Superseded)) | Ok(Err(_)) => {}
        Err(error) => warn!(session_id = %session_id, %error, "bundle task failed"),
    }
}

struct ReplyState {
    answer: AnswerStream,
    reply: String,
    pipeline: Arc<Pipeline>,
    session_id: String,
    failed: bool,
}

/// Forwards answer fragments to the response body and records the full reply
/// once the model finishes.
fn reply_body(
    pipeline: Arc<Pipeline>,
    session_id: String,
    answer: AnswerStream,
) -> impl Stream<Item = Result<String, ModelError>> + Send + 'static {
    let state = ReplyState {
        answer,
        reply: String::new(),
        pipeline,
        session_id,
        failed: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.failed {
            return None;
        }

        match state.answer.next_fragment().await {
            Some(Ok(fragment)) => {
                state.reply.push_str(&fragment);
                Some((Ok(fragment), state))
            }
            Some(Err(error)) => {
                warn!(session_id = %state.session_id, %error, "answer stream failed");
                state.failed = true;
                Some((Err(error), state))
            }
            None => {
                state.pipeline.record_reply(&state.session_id, state.reply);
                None
            }
        }
    })
}

#[derive(Debug, Serialize)]
struct UploadedFile {
    name: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: &'static str,
    category: String,
    files: Vec<UploadedFile>,
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut category = None;
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| bad_request(format!("invalid multipart body: {error}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "category" => {
                let text = field
                    .text()
                    .await
                    .map_err(|error| bad_request(format!("unreadable category: {error}")))?;
                category = Some(text.trim().to_string());
            }
            "files" | "files[]" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| bad_request("uploaded file has no name"))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|error| bad_request(format!("failed to read {file_name}: {error}")))?;
                uploads.push((file_name, bytes));
            }
            _ => {}
        }
    }

    let category = category.ok_or_else(|| bad_request("category is required"))?;
    if uploads.is_empty() {
        return Err(bad_request("no files were uploaded"));
    }

    let mut files = Vec::with_capacity(uploads.len());
    for (file_name, bytes) in uploads {
        let library = Arc::clone(&state.library);
        let (folder, name) = (category.clone(), file_name.clone());
        let path = tokio::task::spawn_blocking(move || library.save_upload(&folder, &name, &bytes))
            .await
            .map_err(|error| internal(error.to_string()))??;

        let uploaded = match state.pipeline.index().insert_file(&path).await {
            Ok(InsertOutcome::Indexed { pages, .. }) => uploaded(file_name, "indexed", Some(pages), None),
            Ok(InsertOutcome::Replaced { pages, .. }) => uploaded(file_name, "replaced", Some(pages), None),
            Ok(InsertOutcome::Unchanged) => uploaded(file_name, "unchanged", None, None),
            Err(IndexError::Ingest(error)) => {
                warn!(path = %path.display(), %error, "uploaded document could not be indexed");
                uploaded(file_name, "skipped", None, Some(error.to_string()))
            }
            Err(error) => return Err(internal(error.to_string())),
        };
        files.push(uploaded);
    }

    Ok(Json(UploadResponse {
        message: "Files uploaded successfully",
        category,
        files,
    }))
}

fn uploaded(
    name: String,
    status: &'static str,
    pages: Option<usize>,
    detail: Option<String>,
) -> UploadedFile {
    UploadedFile {
        name,
        status,
        pages,
        detail,
    }
}

async fn handle_categories(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let structure = state.library.categories()?;
    Ok(Json(json!({ "directory_structure": structure })))
}

async fn handle_source_document(
    State(state): State<AppState>,
    Path((category, file)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let path = state.library.resolve(&category, &file)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|error| internal(error.to_string()))?;
    Ok(([(header::CONTENT_TYPE, content_type(&file))], bytes).into_response())
}

async fn handle_results(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, AppError> {
    let path = state.pipeline.bundles().bundle_path(&session_id);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "application/pdf")], bytes).into_response()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            Err(not_found(format!("no results for session {session_id}")))
        }
        Err(error) => Err(internal(error.to_string())),
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "model": state.pipeline.model().model(),
        "passages": state.pipeline.index().len(),
        "sessions": state.pipeline.history().session_count(),
    }))
}

fn content_type(file_name: &str) -> &'static str {
    let lowered = file_name.to_ascii_lowercase();
    if lowered.ends_with(".pdf") {
        "application/pdf"
    } else if lowered.ends_with(".md") {
        "text/markdown; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    }
}
