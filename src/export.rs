//! Transcript downloads.

use chrono::NaiveDate;
use serde::Deserialize;

use crate::db::models::{Message, Role};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExportError {
    #[error("No messages to export")]
    NothingToExport,
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Text,
    Json,
    Markdown,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Text => "txt",
            ExportFormat::Json => "json",
            ExportFormat::Markdown => "md",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Text => "text/plain; charset=utf-8",
            ExportFormat::Json => "application/json",
            ExportFormat::Markdown => "text/markdown; charset=utf-8",
        }
    }

    /// `chat-export-YYYY-MM-DD.<ext>`
    pub fn file_name(self, date: NaiveDate) -> String {
        format!("chat-export-{}.{}", date.format("%Y-%m-%d"), self.extension())
    }
}

pub fn export(messages: &[Message], format: ExportFormat) -> Result<String, ExportError> {
    if messages.is_empty() {
        return Err(ExportError::NothingToExport);
    }

    let rendered = match format {
        ExportFormat::Text => messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n"),
        ExportFormat::Json => serde_json::to_string_pretty(messages)
            .map_err(|e| ExportError::Serialization(e.to_string()))?,
        ExportFormat::Markdown => messages
            .iter()
            .map(|m| {
                let heading = if m.role == Role::User { "You" } else { "AI" };
                format!("### {}\n\n{}", heading, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
    };
    Ok(rendered)
}
