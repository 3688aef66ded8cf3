//! User preferences persisted under `app-settings`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use crate::db::{keys, JsonStore, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid settings: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub typing_animation_enabled: bool,
    #[validate(length(min = 1))]
    pub model: String,
    #[validate(range(min = 0.0, max = 1.0))]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            typing_animation_enabled: true,
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            system_prompt: None,
        }
    }
}

impl AppSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            model: config.default_model.clone(),
            temperature: config.default_temperature,
            ..Self::default()
        }
    }
}

/// Partial update. Absent fields are left alone; an empty `systemPrompt`
/// clears it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub typing_animation_enabled: Option<bool>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

pub struct SettingsService {
    store: Arc<dyn Store>,
    defaults: AppSettings,
}

impl SettingsService {
    pub fn new(store: Arc<dyn Store>, defaults: AppSettings) -> Self {
        Self { store, defaults }
    }

    /// Stored settings, or the defaults if nothing usable is stored.
    pub fn get(&self) -> AppSettings {
        match self.store.load_json::<AppSettings>(keys::APP_SETTINGS) {
            Ok(Some(settings)) if settings.validate().is_ok() => settings,
            Ok(Some(_)) => {
                tracing::warn!("Stored settings are invalid, using defaults");
                self.defaults.clone()
            }
            Ok(None) => self.defaults.clone(),
            Err(e) => {
                tracing::error!("Error loading settings: {}", e);
                self.defaults.clone()
            }
        }
    }

    pub fn update(&self, patch: SettingsPatch) -> Result<AppSettings, SettingsError> {
        let mut settings = self.get();
        if let Some(enabled) = patch.typing_animation_enabled {
            settings.typing_animation_enabled = enabled;
        }
        if let Some(model) = patch.model {
            settings.model = model.trim().to_string();
        }
        if let Some(temperature) = patch.temperature {
            settings.temperature = temperature;
        }
        if let Some(prompt) = patch.system_prompt {
            let prompt = prompt.trim();
            settings.system_prompt = (!prompt.is_empty()).then(|| prompt.to_string());
        }

        settings.validate()?;
        self.store.save_json(keys::APP_SETTINGS, &settings)?;
        Ok(settings)
    }
}
