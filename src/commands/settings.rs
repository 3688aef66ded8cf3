use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::json;

use super::{ApiError, AppState};
use crate::audit::actions;
use crate::auth::{NavLink, Principal, RequestOrigin};
use crate::db::models::{LogCategory, LogLevel};
use crate::llm::ModelInfo;
use crate::settings::{AppSettings, SettingsPatch};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    #[serde(flatten)]
    pub settings: AppSettings,
    /// Which provider keys are configured. Keys themselves are never returned.
    pub providers: ProviderStatus,
}

#[derive(Debug, Serialize)]
pub struct ProviderStatus {
    pub openai: bool,
    pub claude: bool,
}

fn provider_status(state: &AppState) -> ProviderStatus {
    ProviderStatus {
        openai: !state.config.openai_api_key.is_empty(),
        claude: !state.config.claude_api_key.is_empty(),
    }
}

pub async fn get_settings(
    State(state): State<AppState>,
    _principal: Principal,
) -> Json<SettingsView> {
    Json(SettingsView {
        settings: state.settings.get(),
        providers: provider_status(&state),
    })
}

/// Persist a settings patch and apply it to the idle session.
pub async fn update_settings(
    State(state): State<AppState>,
    principal: Principal,
    origin: RequestOrigin,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<SettingsView>, ApiError> {
    let mut session = state.session_guard()?;
    let settings = state.settings.update(patch)?;

    session.set_model(settings.model.clone())?;
    session.set_temperature(settings.temperature)?;
    session.set_system_prompt(settings.system_prompt.clone())?;

    state.audit.record_with_origin(
        &principal,
        actions::SETTINGS_UPDATED,
        LogCategory::System,
        LogLevel::Info,
        Some(json!({
            "model": settings.model,
            "temperature": settings.temperature,
            "typingAnimationEnabled": settings.typing_animation_enabled,
        })),
        &origin,
    );
    Ok(Json(SettingsView {
        settings,
        providers: provider_status(&state),
    }))
}

pub async fn get_available_models(State(state): State<AppState>) -> Json<Vec<ModelInfo>> {
    Json(state.providers.available_models())
}

pub async fn get_navigation(principal: Principal) -> Json<Vec<NavLink>> {
    Json(principal.role.navigation())
}
