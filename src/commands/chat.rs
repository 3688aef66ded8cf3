use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::OwnedMutexGuard;

use super::{ApiError, AppState};
use crate::audit::actions;
use crate::auth::{Capability, Principal, RequestOrigin};
use crate::db::models::{Feedback, FileReference, LogCategory, LogLevel, Message, MessageFeedback};
use crate::doc_processor::{self, IngestedFile};
use crate::export::{self, ExportFormat};
use crate::llm::{self, Backend, ChatMessage, StreamOptions};
use crate::session::{
    check_temperature, ChatSession, Exchange, ExchangeOutcome, RegenerateHint, SessionEvent,
    SessionState,
};

const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_CLAUDE_MODEL: &str = "claude-3-opus-20240229";
const DEFAULT_TEMPERATURE: f32 = 0.7;

// ── Raw proxy routes ──

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

pub async fn openai_proxy(State(state): State<AppState>, Json(req): Json<ProxyRequest>) -> Response {
    proxy(&state, Backend::OpenAi, DEFAULT_OPENAI_MODEL, req).await
}

pub async fn claude_proxy(State(state): State<AppState>, Json(req): Json<ProxyRequest>) -> Response {
    proxy(&state, Backend::Claude, DEFAULT_CLAUDE_MODEL, req).await
}

/// Stream one completion as plain text. Failures before the first fragment
/// become a 500; later failures abort the body.
async fn proxy(state: &AppState, backend: Backend, default_model: &str, req: ProxyRequest) -> Response {
    if req.messages.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Messages are required" })),
        )
            .into_response();
    }

    let options = StreamOptions {
        model: req.model.unwrap_or_else(|| default_model.to_string()),
        temperature: req.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        system_prompt: req.system_prompt,
    };
    if let Err(e) = llm::pinned_model(backend, &options.model) {
        return ApiError::from(e).into_response();
    }
    let mut stream = state.providers.stream_via(backend, &req.messages, &options);

    let first = match stream.next().await {
        Some(Ok(fragment)) => fragment,
        Some(Err(e)) => {
            tracing::error!("Error in chat proxy: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "There was an error processing your request" })),
            )
                .into_response();
        }
        None => String::new(),
    };

    let body = futures::stream::once(async move { Ok(first) }).chain(stream);
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response()
}

// ── Session ──

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub state: SessionState,
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<Message>,
    pub files: Vec<FileReference>,
    pub pending_files: Vec<String>,
    pub feedback: Vec<MessageFeedback>,
}

impl SessionView {
    pub fn of(session: &ChatSession) -> Self {
        Self {
            state: session.state(),
            model: session.model().to_string(),
            temperature: session.temperature(),
            messages: session.messages().to_vec(),
            files: session.files().to_vec(),
            pending_files: session.pending_files().to_vec(),
            feedback: session.feedback().into_iter().cloned().collect(),
        }
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<SessionView>, ApiError> {
    principal.require(Capability::Chat)?;
    let session = state.session_guard()?;
    Ok(Json(SessionView::of(&session)))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub content: String,
}

pub async fn send_message(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    Json(req): Json<SendRequest>,
) -> Result<Response, ApiError> {
    principal.require(Capability::Chat)?;
    let mut session = state.session_guard()?;
    let exchange = session.begin_send(&req.content)?;

    state.audit.record_with_origin(
        &principal,
        actions::MESSAGE_SENT,
        LogCategory::Chat,
        LogLevel::Info,
        Some(json!({
            "model": session.model(),
            "messageId": exchange.assistant_id(),
            "length": req.content.trim().len(),
        })),
        &origin,
    );
    Ok(stream_exchange(&state, session, exchange))
}

#[derive(Debug, Default, Deserialize)]
pub struct RegenerateRequest {
    pub hint: Option<RegenerateHint>,
}

pub async fn regenerate(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    body: Bytes,
) -> Result<Response, ApiError> {
    principal.require(Capability::Chat)?;
    let hint = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<RegenerateRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))?
            .hint
    };
    let mut session = state.session_guard()?;
    let exchange = session.begin_regenerate(hint.clone())?;

    state.audit.record_with_origin(
        &principal,
        actions::RESPONSE_REGENERATED,
        LogCategory::Chat,
        LogLevel::Info,
        Some(json!({
            "model": session.model(),
            "messageId": exchange.assistant_id(),
            "hint": hint,
        })),
        &origin,
    );
    Ok(stream_exchange(&state, session, exchange))
}

/// Run the exchange on its own task and relay its fragments as the body.
/// The session lock travels with the task, so the session stays busy until
/// the exchange ends even if the client goes away. The body ends only once
/// the lock is free again.
fn stream_exchange(
    state: &AppState,
    mut session: OwnedMutexGuard<ChatSession>,
    exchange: Exchange,
) -> Response {
    let lock = state.session.clone();
    let mut events = session.subscribe();
    let message_id = exchange.assistant_id().to_string();

    tokio::spawn(async move {
        session.run_exchange(exchange).await;
    });

    let target = message_id.clone();
    let body = async_stream::stream! {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Chunk { message_id, delta } if message_id == target => {
                    yield Ok::<_, Infallible>(delta);
                }
                SessionEvent::Finished { message_id, outcome } if message_id == target => {
                    let notice = match outcome {
                        ExchangeOutcome::Failed(reason) => Some(format!("\n\n[Error: {}]", reason)),
                        ExchangeOutcome::TimedOut => Some("\n\n[Error: response timed out]".to_string()),
                        ExchangeOutcome::Completed | ExchangeOutcome::Stopped => None,
                    };
                    drop(lock.lock().await);
                    if let Some(notice) = notice {
                        yield Ok(notice);
                    }
                    break;
                }
                _ => {}
            }
        }
    };

    (
        [
            ("content-type", "text/plain; charset=utf-8".to_string()),
            ("x-message-id", message_id),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

pub async fn stop_stream(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
) -> Result<StatusCode, ApiError> {
    principal.require(Capability::Chat)?;
    state.stop.stop()?;
    state.audit.record_with_origin(
        &principal,
        actions::STREAM_STOPPED,
        LogCategory::Chat,
        LogLevel::Info,
        None,
        &origin,
    );
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub message_id: String,
    pub feedback: Feedback,
    pub reason: Option<String>,
    pub comment: Option<String>,
}

pub async fn set_feedback(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<MessageFeedback>, ApiError> {
    principal.require(Capability::Chat)?;
    let mut session = state.session_guard()?;
    let entry = session
        .set_feedback(&req.message_id, req.feedback, req.reason, req.comment)?
        .clone();

    state.audit.record_with_origin(
        &principal,
        actions::FEEDBACK_SUBMITTED,
        LogCategory::Chat,
        LogLevel::Info,
        Some(json!({
            "messageId": entry.message_id,
            "feedback": entry.feedback,
            "reason": entry.reason,
            "comment": entry.comment,
        })),
        &origin,
    );
    Ok(Json(entry))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub system_prompt_override: Option<String>,
}

pub async fn set_model(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    Json(req): Json<ModelRequest>,
) -> Result<Json<SessionView>, ApiError> {
    principal.require(Capability::Chat)?;
    let mut session = state.session_guard()?;

    let model = req.model.as_deref().map(str::trim);
    if model == Some("") {
        return Err(ApiError::BadRequest("Model cannot be empty".into()));
    }
    if let Some(temperature) = req.temperature {
        check_temperature(temperature)?;
    }

    if let Some(temperature) = req.temperature {
        session.set_temperature(temperature)?;
    }
    if let Some(model) = model {
        session.set_model(model)?;
        state.audit.record_with_origin(
            &principal,
            actions::MODEL_CHANGED,
            LogCategory::Chat,
            LogLevel::Info,
            Some(json!({ "model": model })),
            &origin,
        );
    }
    if req.system_prompt_override.is_some() {
        session.set_system_prompt_override(req.system_prompt_override)?;
    }
    Ok(Json(SessionView::of(&session)))
}

pub async fn upload_file(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestedFile>), ApiError> {
    principal.require(Capability::Chat)?;
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let file_name = header_value("x-file-name");
    if file_name.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing x-file-name header".into()));
    }
    let declared_type = header_value("content-type");

    let limits = state.config.ingest_limits();
    let ingested = match doc_processor::ingest(&body, &declared_type, &file_name, &limits) {
        Ok(ingested) => ingested,
        Err(e) => {
            state.audit.record_with_origin(
                &principal,
                actions::FILE_UPLOADED,
                LogCategory::Chat,
                LogLevel::Warning,
                Some(json!({ "fileName": file_name, "error": e.to_string() })),
                &origin,
            );
            return Err(e.into());
        }
    };

    let mut session = state.session_guard()?;
    session.attach_file(ingested.clone().into_reference());

    state.audit.record_with_origin(
        &principal,
        actions::FILE_UPLOADED,
        LogCategory::Chat,
        LogLevel::Info,
        Some(json!({
            "fileName": ingested.name,
            "kind": ingested.kind,
            "sizeBytes": ingested.size_bytes,
        })),
        &origin,
    );
    Ok((StatusCode::CREATED, Json(ingested)))
}

pub async fn clear_session(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
) -> Result<StatusCode, ApiError> {
    principal.require(Capability::Chat)?;
    let mut session = state.session_guard()?;
    session.clear()?;
    state.audit.record_with_origin(
        &principal,
        actions::CHAT_CLEARED,
        LogCategory::Chat,
        LogLevel::Info,
        None,
        &origin,
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportParams {
    #[serde(default)]
    pub format: ExportFormat,
}

pub async fn export_session(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    principal.require(Capability::Chat)?;
    let messages = state.session_guard()?.messages().to_vec();
    let rendered = export::export(&messages, params.format)?;
    let file_name = params.format.file_name(chrono::Utc::now().date_naive());

    state.audit.record_with_origin(
        &principal,
        actions::CHAT_EXPORTED,
        LogCategory::Chat,
        LogLevel::Info,
        Some(json!({ "fileName": file_name, "messages": messages.len() })),
        &origin,
    );

    Ok((
        [
            ("content-type", params.format.content_type().to_string()),
            (
                "content-disposition",
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        rendered,
    )
        .into_response())
}
