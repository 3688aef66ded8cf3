//! Saved conversations, stored as one array under the `conversations` key.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::db::models::{Conversation, FileReference, Message};
use crate::db::{keys, JsonStore, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Title cannot be empty")]
    BlankTitle,
    #[error("Cannot save an empty conversation")]
    EmptyConversation,
    #[error("Conversation not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
    Alphabetical,
}

pub struct ConversationCatalog {
    store: Arc<dyn Store>,
}

impl ConversationCatalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// All saved conversations, most recently updated first.
    pub fn list(&self) -> CatalogResult<Vec<Conversation>> {
        let mut conversations = self.read()?;
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    pub fn save(
        &self,
        title: &str,
        messages: Vec<Message>,
        files: Vec<FileReference>,
    ) -> CatalogResult<Conversation> {
        let title = normalize_title(title)?;
        if messages.is_empty() {
            return Err(CatalogError::EmptyConversation);
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            title,
            messages,
            files,
            created_at: now,
            updated_at: now,
        };

        let mut conversations = self.read()?;
        conversations.push(conversation.clone());
        self.write(&conversations)?;
        tracing::info!(id = %conversation.id, "Saved conversation");
        Ok(conversation)
    }

    pub fn rename(&self, id: &str, title: &str) -> CatalogResult<Conversation> {
        let title = normalize_title(title)?;
        let mut conversations = self.read()?;
        let conversation = conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        conversation.title = title;
        conversation.updated_at = Utc::now();
        let renamed = conversation.clone();
        self.write(&conversations)?;
        Ok(renamed)
    }

    pub fn delete(&self, id: &str) -> CatalogResult<()> {
        let mut conversations = self.read()?;
        let before = conversations.len();
        conversations.retain(|c| c.id != id);
        if conversations.len() == before {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        self.write(&conversations)
    }

    pub fn load(&self, id: &str) -> CatalogResult<Conversation> {
        self.read()?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// Case-insensitive title search plus ordering. Does not touch the store.
    pub fn query(
        conversations: &[Conversation],
        search: Option<&str>,
        order: SortOrder,
    ) -> Vec<Conversation> {
        let needle = search
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let mut hits: Vec<Conversation> = conversations
            .iter()
            .filter(|c| {
                needle
                    .as_ref()
                    .map_or(true, |n| c.title.to_lowercase().contains(n))
            })
            .cloned()
            .collect();

        match order {
            SortOrder::NewestFirst => hits.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
            SortOrder::OldestFirst => hits.sort_by(|a, b| a.updated_at.cmp(&b.updated_at)),
            SortOrder::Alphabetical => {
                hits.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
            }
        }
        hits
    }

    fn read(&self) -> CatalogResult<Vec<Conversation>> {
        Ok(self
            .store
            .load_json::<Vec<Conversation>>(keys::CONVERSATIONS)?
            .unwrap_or_default())
    }

    fn write(&self, conversations: &[Conversation]) -> CatalogResult<()> {
        self.store.save_json(keys::CONVERSATIONS, conversations)?;
        Ok(())
    }
}

fn normalize_title(title: &str) -> CatalogResult<String> {
    let title = title.trim();
    if title.is_empty() {
        Err(CatalogError::BlankTitle)
    } else {
        Ok(title.to_string())
    }
}
