pub mod claude;
pub mod openai;

use async_stream::try_stream;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

/// Lazy sequence of text fragments produced by a provider.
pub type FragmentStream = BoxStream<'static, Result<String, LlmError>>;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
}

/// Per-call knobs the session hands to the router.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub model: String,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

/// Normalized request handed to a concrete backend.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
}

/// A configured provider endpoint: OpenAI-compatible or Anthropic.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    Claude(claude::ClaudeConfig),
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi(_) => "OpenAI",
            Provider::Claude(_) => "Anthropic",
        }
    }

    pub fn chat_stream(&self, client: &Client, request: &ChatRequest) -> FragmentStream {
        match self {
            Provider::OpenAi(config) => openai::chat_stream(client, config, request),
            Provider::Claude(config) => claude::chat_stream(client, config, request),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("{0} API key not configured")]
    NotConfigured(&'static str),
    #[error("Model '{model}' is not served by {backend}")]
    BackendMismatch { model: String, backend: &'static str },
}

impl Serialize for LlmError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Seam between the session and the network. Tests substitute scripted backends.
pub trait ChatBackend: Send + Sync {
    fn route_and_stream(&self, messages: &[ChatMessage], options: &StreamOptions)
        -> FragmentStream;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    OpenAi,
    Claude,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::OpenAi => "OpenAI",
            Backend::Claude => "Anthropic",
        }
    }
}

/// The backend an explicit `openai/`, `claude/` or `anthropic/` prefix names.
fn prefixed_backend(model: &str) -> Option<Backend> {
    if model.starts_with("claude/") || model.starts_with("anthropic/") {
        Some(Backend::Claude)
    } else if model.starts_with("openai/") {
        Some(Backend::OpenAi)
    } else {
        None
    }
}

/// Model id to send through a fixed backend. A routing prefix naming the
/// other backend is rejected rather than stripped.
pub fn pinned_model(backend: Backend, model: &str) -> Result<&str, LlmError> {
    match prefixed_backend(model) {
        Some(named) if named != backend => Err(LlmError::BackendMismatch {
            model: model.to_string(),
            backend: backend.name(),
        }),
        _ => Ok(resolve_backend(model).1),
    }
}

/// Pick the backend for a model id and strip any routing prefix.
///
/// `claude/…`, `anthropic/…` and bare `claude-…` ids go to Claude, `openai/…`
/// and everything else to OpenAI.
pub fn resolve_backend(model: &str) -> (Backend, &str) {
    if let Some(model_id) = model
        .strip_prefix("claude/")
        .or_else(|| model.strip_prefix("anthropic/"))
    {
        (Backend::Claude, model_id)
    } else if let Some(model_id) = model.strip_prefix("openai/") {
        (Backend::OpenAi, model_id)
    } else if model.starts_with("claude") {
        (Backend::Claude, model)
    } else {
        (Backend::OpenAi, model)
    }
}

/// Selects the streaming endpoint for each call and normalizes the request.
#[derive(Debug, Clone)]
pub struct ProviderRouter {
    client: Client,
    openai: Option<openai::OpenAiConfig>,
    claude: Option<claude::ClaudeConfig>,
    max_tokens: u32,
}

impl ProviderRouter {
    pub fn new(
        openai: Option<openai::OpenAiConfig>,
        claude: Option<claude::ClaudeConfig>,
        max_tokens: u32,
    ) -> Self {
        Self {
            client: Client::new(),
            openai,
            claude,
            max_tokens,
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        let openai = (!config.openai_api_key.is_empty()).then(|| openai::OpenAiConfig {
            api_key: config.openai_api_key.clone(),
            base_url: config.openai_base_url.clone(),
        });
        let claude = (!config.claude_api_key.is_empty()).then(|| claude::ClaudeConfig {
            api_key: config.claude_api_key.clone(),
            base_url: config.claude_base_url.clone(),
        });
        Self::new(openai, claude, config.max_response_tokens)
    }

    pub fn provider_for(&self, model: &str) -> Result<(Provider, String), LlmError> {
        let (backend, model_id) = resolve_backend(model);
        self.provider(backend, model_id)
    }

    fn provider(&self, backend: Backend, model_id: &str) -> Result<(Provider, String), LlmError> {
        match backend {
            Backend::Claude => self
                .claude
                .clone()
                .map(|c| (Provider::Claude(c), model_id.to_string()))
                .ok_or(LlmError::NotConfigured("Claude")),
            Backend::OpenAi => self
                .openai
                .clone()
                .map(|c| (Provider::OpenAi(c), model_id.to_string()))
                .ok_or(LlmError::NotConfigured("OpenAI")),
        }
    }

    pub fn build_request(
        &self,
        messages: &[ChatMessage],
        model_id: String,
        options: &StreamOptions,
    ) -> ChatRequest {
        ChatRequest {
            messages: messages.to_vec(),
            model: model_id,
            temperature: options.temperature.clamp(0.0, 1.0),
            system_prompt: options
                .system_prompt
                .clone()
                .filter(|s| !s.trim().is_empty()),
            max_tokens: self.max_tokens,
        }
    }

    pub fn available_models(&self) -> Vec<ModelInfo> {
        let mut models = Vec::new();

        if self.openai.is_some() {
            models.extend([
                ModelInfo {
                    id: "gpt-3.5-turbo".into(),
                    name: "GPT-3.5 Turbo".into(),
                    provider: "OpenAI".into(),
                },
                ModelInfo {
                    id: "gpt-4".into(),
                    name: "GPT-4".into(),
                    provider: "OpenAI".into(),
                },
                ModelInfo {
                    id: "gpt-4-turbo".into(),
                    name: "GPT-4 Turbo".into(),
                    provider: "OpenAI".into(),
                },
            ]);
        }

        if self.claude.is_some() {
            models.extend([
                ModelInfo {
                    id: "claude-3-opus-20240229".into(),
                    name: "Claude 3 Opus".into(),
                    provider: "Anthropic".into(),
                },
                ModelInfo {
                    id: "claude-3-sonnet-20240229".into(),
                    name: "Claude 3 Sonnet".into(),
                    provider: "Anthropic".into(),
                },
            ]);
        }

        models
    }
}

impl ProviderRouter {
    /// Stream through a fixed backend. Bare model ids are sent as given.
    pub fn stream_via(
        &self,
        backend: Backend,
        messages: &[ChatMessage],
        options: &StreamOptions,
    ) -> FragmentStream {
        let provider = pinned_model(backend, &options.model)
            .and_then(|model_id| self.provider(backend, model_id));
        self.dispatch(provider, messages, options)
    }

    fn dispatch(
        &self,
        provider: Result<(Provider, String), LlmError>,
        messages: &[ChatMessage],
        options: &StreamOptions,
    ) -> FragmentStream {
        match provider {
            Ok((provider, model_id)) => {
                let request = self.build_request(messages, model_id, options);
                tracing::debug!(
                    provider = provider.name(),
                    model = %request.model,
                    messages = request.messages.len(),
                    "dispatching chat stream"
                );
                provider.chat_stream(&self.client, &request)
            }
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

impl ChatBackend for ProviderRouter {
    fn route_and_stream(
        &self,
        messages: &[ChatMessage],
        options: &StreamOptions,
    ) -> FragmentStream {
        self.dispatch(self.provider_for(&options.model), messages, options)
    }
}

/// Split complete lines off the front of an SSE buffer, leaving any partial tail.
pub(crate) fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line = buffer[..pos].trim().to_string();
        buffer.drain(..=pos);
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// What a single SSE line means to the fragment stream.
#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    Delta(String),
    Done,
}

/// Send a streaming request and turn its SSE body into text fragments.
///
/// `parse` maps one complete line to zero or more events. The stream ends on
/// the first [`SseEvent::Done`], when the body closes, or on the first error.
pub(crate) fn sse_fragments<P>(req: RequestBuilder, parse: P) -> FragmentStream
where
    P: Fn(&str) -> Result<Vec<SseEvent>, LlmError> + Send + 'static,
{
    Box::pin(fragments(req, parse))
}

fn fragments<P>(req: RequestBuilder, parse: P) -> impl Stream<Item = Result<String, LlmError>> + Send + 'static
where
    P: Fn(&str) -> Result<Vec<SseEvent>, LlmError> + Send + 'static,
{
    try_stream! {
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            Err::<(), _>(LlmError::Api {
                status,
                message: text,
            })?;
        } else {
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();
            let mut finished = false;

            while !finished {
                let Some(chunk) = stream.next().await else {
                    break;
                };
                let chunk = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                for line in drain_lines(&mut buffer) {
                    for event in parse(&line)? {
                        match event {
                            SseEvent::Delta(text) => yield text,
                            SseEvent::Done => finished = true,
                        }
                    }
                    if finished {
                        break;
                    }
                }
            }
        }
    }
}
