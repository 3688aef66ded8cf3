use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::chat::SessionView;
use super::{ApiError, AppState};
use crate::audit::actions;
use crate::auth::{Capability, Principal, RequestOrigin};
use crate::catalog::{ConversationCatalog, SortOrder};
use crate::db::models::{Conversation, LogCategory, LogLevel};

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub q: Option<String>,
    #[serde(default)]
    pub sort: SortOrder,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    principal.require(Capability::Chat)?;
    let all = state.catalog.list()?;
    Ok(Json(ConversationCatalog::query(
        &all,
        params.q.as_deref(),
        params.sort,
    )))
}

#[derive(Debug, Deserialize)]
pub struct TitleRequest {
    pub title: String,
}

/// Save the current session transcript under a title.
pub async fn save_conversation(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    Json(req): Json<TitleRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    principal.require(Capability::Chat)?;
    let snapshot = state.session_guard()?.snapshot();
    let conversation = state
        .catalog
        .save(&req.title, snapshot.messages, snapshot.files)?;

    state.audit.record_with_origin(
        &principal,
        actions::CONVERSATION_SAVED,
        LogCategory::Chat,
        LogLevel::Info,
        Some(json!({
            "conversationId": conversation.id,
            "title": conversation.title,
            "messages": conversation.messages.len(),
        })),
        &origin,
    );
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    principal.require(Capability::Chat)?;
    Ok(Json(state.catalog.load(&id)?))
}

pub async fn rename_conversation(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    Path(id): Path<String>,
    Json(req): Json<TitleRequest>,
) -> Result<Json<Conversation>, ApiError> {
    principal.require(Capability::Chat)?;
    let conversation = state.catalog.rename(&id, &req.title)?;
    state.audit.record_with_origin(
        &principal,
        actions::CONVERSATION_RENAMED,
        LogCategory::Chat,
        LogLevel::Info,
        Some(json!({ "conversationId": id, "title": conversation.title })),
        &origin,
    );
    Ok(Json(conversation))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    principal.require(Capability::Chat)?;
    state.catalog.delete(&id)?;
    state.audit.record_with_origin(
        &principal,
        actions::CONVERSATION_DELETED,
        LogCategory::Chat,
        LogLevel::Info,
        Some(json!({ "conversationId": id })),
        &origin,
    );
    Ok(StatusCode::NO_CONTENT)
}

/// Replace the session with a saved conversation.
pub async fn load_conversation(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    principal.require(Capability::Chat)?;
    let mut session = state.session_guard()?;
    let conversation = state.catalog.load(&id)?;
    session.load_conversation(conversation)?;

    state.audit.record_with_origin(
        &principal,
        actions::CONVERSATION_LOADED,
        LogCategory::Chat,
        LogLevel::Info,
        Some(json!({ "conversationId": id })),
        &origin,
    );
    Ok(Json(SessionView::of(&session)))
}
