//! The live conversation: message history plus the streaming lifecycle.
//!
//! A session is `Idle` or `Streaming`. `send` and `regenerate` move it to
//! `Streaming`; the exchange returns it to `Idle` when the provider stream
//! completes, is stopped, times out or fails. Only one exchange can be in
//! flight, and a second one is rejected rather than queued.
//!
//! Regenerating does not delete the previous answer. Every assistant turn
//! after the last user message is marked `superseded` and a new assistant
//! message is appended. Superseded turns and error notices stay visible in
//! the transcript but are never sent back to a provider.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::db::models::{Conversation, Feedback, FileReference, Message, MessageFeedback, Role};
use crate::db::{keys, JsonStore, Store};
use crate::llm::{ChatBackend, ChatMessage, StreamOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Streaming,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionError {
    #[error("Message cannot be empty")]
    EmptyMessage,
    #[error("A response is already streaming")]
    AlreadyStreaming,
    #[error("No response is streaming")]
    NotStreaming,
    #[error("The last message is not an assistant response")]
    NothingToRegenerate,
    #[error("Unknown message: {0}")]
    UnknownMessage(String),
    #[error("A reason is required for negative feedback")]
    MissingFeedbackReason,
    #[error("Switch not allowed mid-stream")]
    SwitchWhileStreaming,
    #[error("Temperature must be between 0.0 and 1.0, got {0}")]
    InvalidTemperature(f32),
}

/// Extra instruction for a regenerated answer, sent once as a system directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenerateHint {
    Shorter,
    MoreDetailed,
    Custom(String),
}

impl RegenerateHint {
    pub fn directive(&self) -> String {
        match self {
            RegenerateHint::Shorter => {
                "Provide a shorter, more concise response than your previous answer.".to_string()
            }
            RegenerateHint::MoreDetailed => {
                "Provide a more detailed and thorough response than your previous answer."
                    .to_string()
            }
            RegenerateHint::Custom(text) => text.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ExchangeOutcome {
    Completed,
    Stopped,
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started { message_id: String },
    Chunk { message_id: String, delta: String },
    Finished { message_id: String, outcome: ExchangeOutcome },
}

/// Persisted under `chat-history`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub files: Vec<FileReference>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model: String,
    pub temperature: f32,
    pub system_prompt: Option<String>,
    pub request_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            system_prompt: None,
            request_timeout: None,
        }
    }
}

#[derive(Default)]
struct StreamControl {
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

/// Cancels the in-flight exchange from outside the session borrow.
#[derive(Clone)]
pub struct StopHandle {
    control: Arc<StreamControl>,
}

impl StopHandle {
    pub fn stop(&self) -> Result<(), SessionError> {
        match self.control.cancel.lock().as_ref() {
            Some(tx) => {
                tx.send_replace(true);
                Ok(())
            }
            None => Err(SessionError::NotStreaming),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.control.cancel.lock().is_some()
    }
}

/// A started exchange: the assistant message is in place and the session is
/// `Streaming` until [`ChatSession::run_exchange`] finishes.
#[must_use = "an exchange leaves the session streaming until it is run"]
pub struct Exchange {
    assistant_id: String,
    context: Vec<ChatMessage>,
    options: StreamOptions,
    cancel: watch::Receiver<bool>,
}

impl Exchange {
    pub fn assistant_id(&self) -> &str {
        &self.assistant_id
    }
}

pub struct ChatSession {
    store: Arc<dyn Store>,
    backend: Arc<dyn ChatBackend>,
    messages: Vec<Message>,
    files: Vec<FileReference>,
    pending_files: Vec<String>,
    feedback: HashMap<String, MessageFeedback>,
    model: String,
    temperature: f32,
    system_prompt: Option<String>,
    system_override: Option<String>,
    request_timeout: Option<Duration>,
    control: Arc<StreamControl>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl ChatSession {
    /// Create a session and restore the last `chat-history` snapshot, if any.
    pub fn open(store: Arc<dyn Store>, backend: Arc<dyn ChatBackend>, options: SessionOptions) -> Self {
        let snapshot = match store.load_json::<SessionSnapshot>(keys::CHAT_HISTORY) {
            Ok(snapshot) => snapshot.unwrap_or_default(),
            Err(e) => {
                tracing::error!("Error loading chat history: {}", e);
                SessionSnapshot::default()
            }
        };

        Self {
            store,
            backend,
            messages: snapshot.messages,
            files: snapshot.files,
            pending_files: Vec::new(),
            feedback: HashMap::new(),
            model: options.model,
            temperature: options.temperature.clamp(0.0, 1.0),
            system_prompt: options.system_prompt,
            system_override: None,
            request_timeout: options.request_timeout,
            control: Arc::new(StreamControl::default()),
            subscribers: Vec::new(),
        }
    }

    // ── Accessors ──

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn files(&self) -> &[FileReference] {
        &self.files
    }

    pub fn feedback(&self) -> Vec<&MessageFeedback> {
        self.feedback.values().collect()
    }

    pub fn feedback_for(&self, message_id: &str) -> Option<&MessageFeedback> {
        self.feedback.get(message_id)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn state(&self) -> SessionState {
        if self.is_streaming() {
            SessionState::Streaming
        } else {
            SessionState::Idle
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.control.cancel.lock().is_some()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: self.control.clone(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            messages: self.messages.clone(),
            files: self.files.clone(),
        }
    }

    /// Receive [`SessionEvent`]s for every exchange from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    // ── Settings that cannot change mid-stream ──

    pub fn set_model(&mut self, model: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_idle_for_switch()?;
        self.model = model.into();
        Ok(())
    }

    pub fn set_temperature(&mut self, temperature: f32) -> Result<(), SessionError> {
        self.ensure_idle_for_switch()?;
        self.temperature = check_temperature(temperature)?;
        Ok(())
    }

    pub fn set_system_prompt(&mut self, prompt: Option<String>) -> Result<(), SessionError> {
        self.ensure_idle_for_switch()?;
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        Ok(())
    }

    /// One-shot system directive for the next exchange only.
    pub fn set_system_prompt_override(&mut self, prompt: Option<String>) -> Result<(), SessionError> {
        self.ensure_idle_for_switch()?;
        self.system_override = prompt.filter(|p| !p.trim().is_empty());
        Ok(())
    }

    fn ensure_idle_for_switch(&self) -> Result<(), SessionError> {
        if self.is_streaming() {
            Err(SessionError::SwitchWhileStreaming)
        } else {
            Ok(())
        }
    }

    // ── Exchanges ──

    pub async fn send(&mut self, text: &str) -> Result<ExchangeOutcome, SessionError> {
        let exchange = self.begin_send(text)?;
        Ok(self.run_exchange(exchange).await)
    }

    pub async fn regenerate(
        &mut self,
        hint: Option<RegenerateHint>,
    ) -> Result<ExchangeOutcome, SessionError> {
        let exchange = self.begin_regenerate(hint)?;
        Ok(self.run_exchange(exchange).await)
    }

    /// Validate and append the user turn, then open the assistant turn.
    pub fn begin_send(&mut self, text: &str) -> Result<Exchange, SessionError> {
        if self.is_streaming() {
            return Err(SessionError::AlreadyStreaming);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let content = self.compose_user_turn(text);
        self.messages.push(Message::user(content));
        self.pending_files.clear();
        Ok(self.start_exchange())
    }

    /// Supersede the trailing assistant turn(s) and open a fresh one for the
    /// same user message.
    pub fn begin_regenerate(&mut self, hint: Option<RegenerateHint>) -> Result<Exchange, SessionError> {
        if self.is_streaming() {
            return Err(SessionError::AlreadyStreaming);
        }
        if self.messages.last().map(|m| m.role) != Some(Role::Assistant) {
            return Err(SessionError::NothingToRegenerate);
        }
        let Some(last_user) = self.messages.iter().rposition(|m| m.role == Role::User) else {
            return Err(SessionError::NothingToRegenerate);
        };

        for message in &mut self.messages[last_user + 1..] {
            if message.role == Role::Assistant {
                message.superseded = true;
            }
        }

        if let Some(directive) = hint.map(|h| h.directive()).filter(|d| !d.is_empty()) {
            self.system_override = Some(match self.system_override.take() {
                Some(existing) => format!("{}\n\n{}", existing, directive),
                None => directive,
            });
        }

        Ok(self.start_exchange())
    }

    fn start_exchange(&mut self) -> Exchange {
        let context: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|m| m.is_context())
            .map(|m| ChatMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect();

        let assistant = Message::assistant("").with_model(self.model.clone());
        let assistant_id = assistant.id.clone();
        self.messages.push(assistant);

        let (tx, rx) = watch::channel(false);
        *self.control.cancel.lock() = Some(tx);

        let options = StreamOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            system_prompt: self.effective_system_prompt(),
        };

        self.emit(SessionEvent::Started {
            message_id: assistant_id.clone(),
        });

        Exchange {
            assistant_id,
            context,
            options,
            cancel: rx,
        }
    }

    /// Drive the provider stream into the open assistant message.
    ///
    /// Always leaves the session `Idle`, with the transient override cleared
    /// and the history flushed to the store.
    pub async fn run_exchange(&mut self, exchange: Exchange) -> ExchangeOutcome {
        let Exchange {
            assistant_id,
            context,
            options,
            mut cancel,
        } = exchange;

        tracing::debug!(model = %options.model, turns = context.len(), "starting exchange");
        let mut stream = self.backend.route_and_stream(&context, &options);

        let deadline = self.request_timeout.map(|t| Instant::now() + t);
        let timeout = deadline_elapsed(deadline);
        tokio::pin!(timeout);

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.wait_for(|stopped| *stopped) => break ExchangeOutcome::Stopped,
                _ = &mut timeout => break ExchangeOutcome::TimedOut,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(fragment)) => self.append_fragment(&assistant_id, fragment),
                Some(Err(e)) => {
                    tracing::warn!("Provider stream failed: {}", e);
                    break ExchangeOutcome::Failed(e.to_string());
                }
                None => break ExchangeOutcome::Completed,
            }
        };
        drop(stream);

        match &outcome {
            ExchangeOutcome::Failed(reason) => {
                self.record_failure(&assistant_id, format!("Error: {}", reason))
            }
            ExchangeOutcome::TimedOut => {
                let secs = self.request_timeout.map(|t| t.as_secs_f32()).unwrap_or_default();
                self.record_failure(
                    &assistant_id,
                    format!("Error: the response timed out after {:.1} seconds", secs),
                )
            }
            ExchangeOutcome::Completed | ExchangeOutcome::Stopped => {}
        }

        self.system_override = None;
        *self.control.cancel.lock() = None;
        self.persist();

        tracing::info!(message_id = %assistant_id, outcome = ?outcome, "exchange finished");
        self.emit(SessionEvent::Finished {
            message_id: assistant_id,
            outcome: outcome.clone(),
        });
        outcome
    }

    fn append_fragment(&mut self, assistant_id: &str, fragment: String) {
        if fragment.is_empty() {
            return;
        }
        if let Some(message) = self.messages.iter_mut().rev().find(|m| m.id == assistant_id) {
            message.content.push_str(&fragment);
        }
        self.emit(SessionEvent::Chunk {
            message_id: assistant_id.to_string(),
            delta: fragment,
        });
    }

    /// An empty assistant turn becomes the notice; partial output is kept and
    /// the notice follows it.
    fn record_failure(&mut self, assistant_id: &str, notice: String) {
        let target = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.id == assistant_id && m.content.is_empty());
        match target {
            Some(message) => {
                message.content = notice;
                message.error = true;
            }
            None => {
                let mut message = Message::assistant(notice).with_model(self.model.clone());
                message.error = true;
                self.messages.push(message);
            }
        }
    }

    // ── Feedback, files, history ──

    pub fn set_feedback(
        &mut self,
        message_id: &str,
        feedback: Feedback,
        reason: Option<String>,
        comment: Option<String>,
    ) -> Result<&MessageFeedback, SessionError> {
        if !self.messages.iter().any(|m| m.id == message_id) {
            return Err(SessionError::UnknownMessage(message_id.to_string()));
        }
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        if feedback == Feedback::NotHelpful && reason.is_none() {
            return Err(SessionError::MissingFeedbackReason);
        }

        let entry = MessageFeedback {
            message_id: message_id.to_string(),
            feedback,
            reason,
            comment: comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
        };
        self.feedback.insert(message_id.to_string(), entry);
        Ok(&self.feedback[message_id])
    }

    /// Attach an ingested file. It replaces any file of the same name and is
    /// embedded in the next user turn.
    pub fn attach_file(&mut self, file: FileReference) {
        if !self.pending_files.contains(&file.name) {
            self.pending_files.push(file.name.clone());
        }
        match self.files.iter_mut().find(|f| f.name == file.name) {
            Some(existing) => *existing = file,
            None => self.files.push(file),
        }
        self.persist();
    }

    pub fn pending_files(&self) -> &[String] {
        &self.pending_files
    }

    pub fn clear(&mut self) -> Result<(), SessionError> {
        if self.is_streaming() {
            return Err(SessionError::AlreadyStreaming);
        }
        self.messages.clear();
        self.files.clear();
        self.pending_files.clear();
        self.feedback.clear();
        self.system_override = None;
        if let Err(e) = self.store.delete(keys::CHAT_HISTORY) {
            tracing::error!("Error clearing chat history: {}", e);
        }
        Ok(())
    }

    /// Replace the working copy with a saved conversation.
    pub fn load_conversation(&mut self, conversation: Conversation) -> Result<(), SessionError> {
        if self.is_streaming() {
            return Err(SessionError::AlreadyStreaming);
        }
        self.messages = conversation.messages;
        self.files = conversation.files;
        self.pending_files.clear();
        self.feedback.clear();
        self.system_override = None;
        self.persist();
        Ok(())
    }

    fn compose_user_turn(&self, text: &str) -> String {
        let mut content = text.to_string();
        for name in &self.pending_files {
            if let Some(file) = self.files.iter().find(|f| &f.name == name) {
                content.push_str(&format!("\n\n[File: {}]\n```\n{}\n```", file.name, file.content));
            }
        }
        content
    }

    fn effective_system_prompt(&self) -> Option<String> {
        match (&self.system_prompt, &self.system_override) {
            (Some(base), Some(extra)) => Some(format!("{}\n\n{}", base, extra)),
            (Some(base), None) => Some(base.clone()),
            (None, Some(extra)) => Some(extra.clone()),
            (None, None) => None,
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save_json(keys::CHAT_HISTORY, &self.snapshot()) {
            tracing::error!("Error saving chat history: {}", e);
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Sampling temperatures a session accepts: 0 to 1 inclusive.
pub fn check_temperature(temperature: f32) -> Result<f32, SessionError> {
    if (0.0..=1.0).contains(&temperature) {
        Ok(temperature)
    } else {
        Err(SessionError::InvalidTemperature(temperature))
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
