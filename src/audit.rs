//! Append-only activity journal, persisted under the `audit-logs` key.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{Principal, RequestOrigin};
use crate::db::models::{LogCategory, LogEntry, LogLevel};
use crate::db::{keys, JsonStore, Store};

pub const DEFAULT_LOG_CAP: usize = 1000;

/// Action names the service records. Reporting keys off these.
pub mod actions {
    pub const MESSAGE_SENT: &str = "Sent chat message";
    pub const RESPONSE_REGENERATED: &str = "Regenerated response";
    pub const STREAM_STOPPED: &str = "Stopped response";
    pub const FEEDBACK_SUBMITTED: &str = "Submitted feedback";
    pub const FILE_UPLOADED: &str = "Uploaded file";
    pub const CHAT_CLEARED: &str = "Cleared chat";
    pub const CHAT_EXPORTED: &str = "Exported chat";
    pub const CONVERSATION_SAVED: &str = "Saved conversation";
    pub const CONVERSATION_RENAMED: &str = "Renamed conversation";
    pub const CONVERSATION_DELETED: &str = "Deleted conversation";
    pub const CONVERSATION_LOADED: &str = "Loaded conversation";
    pub const MODEL_CHANGED: &str = "Changed model";
    pub const SETTINGS_UPDATED: &str = "Updated settings";
}

/// Conjunctive filters for [`AuditLog::query`]. Date bounds are inclusive.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub category: Option<LogCategory>,
    pub level: Option<LogLevel>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.user_id.as_ref().map_or(true, |id| &entry.user_id == id)
            && self.category.map_or(true, |c| entry.category == c)
            && self.level.map_or(true, |l| entry.level == l)
            && self.start_date.map_or(true, |start| entry.timestamp >= start)
            && self.end_date.map_or(true, |end| entry.timestamp <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

pub struct AuditLog {
    store: Arc<dyn Store>,
    entries: Mutex<Vec<LogEntry>>,
    cap: usize,
}

impl AuditLog {
    /// Load any persisted entries. An unreadable journal starts empty.
    pub fn new(store: Arc<dyn Store>, cap: usize) -> Self {
        let entries = match store.load_json::<Vec<LogEntry>>(keys::AUDIT_LOGS) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                tracing::error!("Error loading audit logs: {}", e);
                Vec::new()
            }
        };
        Self {
            store,
            entries: Mutex::new(entries),
            cap: cap.max(1),
        }
    }

    pub fn record(
        &self,
        actor: &Principal,
        action: impl Into<String>,
        category: LogCategory,
        level: LogLevel,
        details: Option<serde_json::Value>,
    ) -> LogEntry {
        self.record_with_origin(actor, action, category, level, details, &RequestOrigin::default())
    }

    pub fn record_with_origin(
        &self,
        actor: &Principal,
        action: impl Into<String>,
        category: LogCategory,
        level: LogLevel,
        details: Option<serde_json::Value>,
        origin: &RequestOrigin,
    ) -> LogEntry {
        let entry = LogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: actor.id.clone(),
            user_name: actor.name.clone(),
            user_email: actor.email.clone(),
            user_role: actor.role,
            action: action.into(),
            category,
            level,
            details,
            ip_address: origin.ip_address.clone(),
            user_agent: origin.user_agent.clone(),
        };
        self.append(entry.clone());
        entry
    }

    /// Append a fully-formed entry, evicting the oldest beyond the cap.
    pub fn append(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Info => {
                tracing::info!(category = ?entry.category, user = %entry.user_id, "{}", entry.action)
            }
            LogLevel::Warning => {
                tracing::warn!(category = ?entry.category, user = %entry.user_id, "{}", entry.action)
            }
            LogLevel::Error => {
                tracing::error!(category = ?entry.category, user = %entry.user_id, "{}", entry.action)
            }
        }

        let mut entries = self.entries.lock();
        entries.push(entry);
        if entries.len() > self.cap {
            let excess = entries.len() - self.cap;
            entries.drain(..excess);
        }
        self.persist(&entries);
    }

    /// Matching entries, newest first. Among equal timestamps the later
    /// append comes first.
    pub fn query(&self, filter: &AuditFilter, page: Option<Page>) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let mut matched: Vec<LogEntry> = entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        drop(entries);

        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        match page {
            Some(Page { offset, limit }) => matched.into_iter().skip(offset).take(limit).collect(),
            None => matched,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.persist(&entries);
    }

    fn persist(&self, entries: &[LogEntry]) {
        if let Err(e) = self.store.save_json(keys::AUDIT_LOGS, entries) {
            tracing::error!("Error saving audit logs: {}", e);
        }
    }
}
