use super::{sse_fragments, ChatRequest, FragmentStream, LlmError, SseEvent};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ClaudeMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ClaudeMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ClaudeStreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ClaudeDelta },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "error")]
    Error { error: ClaudeErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ClaudeDelta {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ClaudeErrorBody {
    message: String,
}

/// Anthropic takes the system prompt as a top-level field and only knows
/// `user` and `assistant` turns.
fn build_request(request: &ChatRequest) -> ClaudeRequest {
    let inline_system = request
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>();

    let system = match (&request.system_prompt, inline_system.is_empty()) {
        (Some(prompt), true) => Some(prompt.clone()),
        (Some(prompt), false) => Some(format!("{}\n\n{}", prompt, inline_system.join("\n\n"))),
        (None, false) => Some(inline_system.join("\n\n")),
        (None, true) => None,
    };

    let messages: Vec<ClaudeMessage> = request
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| ClaudeMessage {
            role: if m.role == "user" { "user" } else { "assistant" }.to_string(),
            content: m.content.clone(),
        })
        .collect();

    ClaudeRequest {
        model: request.model.clone(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        messages,
        stream: true,
        system,
    }
}

fn parse_line(line: &str) -> Result<Option<SseEvent>, LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    match serde_json::from_str::<ClaudeStreamEvent>(data.trim()) {
        Ok(ClaudeStreamEvent::ContentBlockDelta { delta }) => {
            Ok(delta.text.filter(|t| !t.is_empty()).map(SseEvent::Delta))
        }
        Ok(ClaudeStreamEvent::MessageStop {}) => Ok(Some(SseEvent::Done)),
        Ok(ClaudeStreamEvent::Error { error }) => Err(LlmError::Api {
            status: 500,
            message: error.message,
        }),
        Ok(ClaudeStreamEvent::Other) => Ok(None),
        Err(e) => Err(LlmError::Parse(format!("{}: {}", e, data.trim()))),
    }
}

pub fn chat_stream(client: &Client, config: &ClaudeConfig, request: &ChatRequest) -> FragmentStream {
    let body = build_request(request);

    let req = client
        .post(format!("{}/v1/messages", config.base_url))
        .header("Content-Type", "application/json")
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&body);

    sse_fragments(req, |line| Ok(parse_line(line)?.into_iter().collect()))
}
