pub mod audit;
pub mod chat;
pub mod conversations;
pub mod settings;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::audit::AuditLog;
use crate::auth::AuthError;
use crate::catalog::{CatalogError, ConversationCatalog};
use crate::config::Config;
use crate::db::Store;
use crate::doc_processor::IngestError;
use crate::export::ExportError;
use crate::llm::{ChatBackend, LlmError, ProviderRouter};
use crate::session::{ChatSession, SessionError, SessionOptions, StopHandle};
use crate::settings::{AppSettings, SettingsError, SettingsService};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub providers: Arc<ProviderRouter>,
    pub session: Arc<Mutex<ChatSession>>,
    pub stop: StopHandle,
    pub catalog: Arc<ConversationCatalog>,
    pub settings: Arc<SettingsService>,
    pub audit: Arc<AuditLog>,
}

impl AppState {
    /// Wire every service onto one store. `backend` drives the session;
    /// `providers` serves the raw proxy routes and the model list.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        providers: Arc<ProviderRouter>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let settings = SettingsService::new(store.clone(), AppSettings::from_config(&config));
        let current = settings.get();
        let session = ChatSession::open(
            store.clone(),
            backend,
            SessionOptions {
                model: current.model,
                temperature: current.temperature,
                system_prompt: current.system_prompt,
                request_timeout: config.request_timeout(),
            },
        );
        let stop = session.stop_handle();

        Self {
            audit: Arc::new(AuditLog::new(store.clone(), config.audit_log_cap)),
            catalog: Arc::new(ConversationCatalog::new(store)),
            settings: Arc::new(settings),
            session: Arc::new(Mutex::new(session)),
            stop,
            providers,
            config: Arc::new(config),
        }
    }

    /// The session, unless an exchange currently holds it.
    pub(crate) fn session_guard(&self) -> Result<OwnedMutexGuard<ChatSession>, ApiError> {
        self.session
            .clone()
            .try_lock_owned()
            .map_err(|_| ApiError::Session(SessionError::AlreadyStreaming))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Provider(#[from] LlmError),
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Session(e) => match e {
                SessionError::AlreadyStreaming
                | SessionError::SwitchWhileStreaming
                | SessionError::NotStreaming => StatusCode::CONFLICT,
                SessionError::UnknownMessage(_) => StatusCode::NOT_FOUND,
                SessionError::EmptyMessage
                | SessionError::NothingToRegenerate
                | SessionError::MissingFeedbackReason
                | SessionError::InvalidTemperature(_) => StatusCode::BAD_REQUEST,
            },
            ApiError::Catalog(e) => match e {
                CatalogError::BlankTitle | CatalogError::EmptyConversation => {
                    StatusCode::BAD_REQUEST
                }
                CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
                CatalogError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Settings(e) => match e {
                SettingsError::Invalid(_) => StatusCode::BAD_REQUEST,
                SettingsError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Ingest(e) => match e {
                IngestError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                IngestError::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                IngestError::ParseError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            },
            ApiError::Export(e) => match e {
                ExportError::NothingToExport => StatusCode::BAD_REQUEST,
                ExportError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Auth(AuthError::Forbidden) => StatusCode::FORBIDDEN,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Provider(LlmError::BackendMismatch { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Provider(_) => StatusCode::BAD_GATEWAY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub fn create_router(state: AppState) -> Router {
    let upload_limit = (state.config.max_upload_bytes as usize).saturating_mul(2);

    Router::new()
        .route("/api/chat", post(chat::openai_proxy))
        .route("/api/claude", post(chat::claude_proxy))
        .route(
            "/api/session",
            get(chat::get_session).delete(chat::clear_session),
        )
        .route("/api/session/messages", post(chat::send_message))
        .route("/api/session/stop", post(chat::stop_stream))
        .route("/api/session/regenerate", post(chat::regenerate))
        .route("/api/session/feedback", put(chat::set_feedback))
        .route("/api/session/model", put(chat::set_model))
        .route(
            "/api/session/files",
            post(chat::upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/session/export", get(chat::export_session))
        .route(
            "/api/conversations",
            get(conversations::list_conversations).post(conversations::save_conversation),
        )
        .route(
            "/api/conversations/{id}",
            get(conversations::get_conversation)
                .patch(conversations::rename_conversation)
                .delete(conversations::delete_conversation),
        )
        .route(
            "/api/conversations/{id}/load",
            post(conversations::load_conversation),
        )
        .route(
            "/api/settings",
            get(settings::get_settings).put(settings::update_settings),
        )
        .route("/api/models", get(settings::get_available_models))
        .route("/api/navigation", get(settings::get_navigation))
        .route(
            "/api/audit-logs",
            get(audit::list_audit_logs).delete(audit::clear_audit_logs),
        )
        .route("/api/analytics", get(audit::get_analytics))
        .route("/health", get(health))
        .with_state(state)
}
