use super::{sse_fragments, ChatRequest, FragmentStream, LlmError, SseEvent};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

/// The system prompt travels as a leading `system` message.
fn build_request(request: &ChatRequest) -> OpenAiRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system_prompt {
        messages.push(OpenAiMessage {
            role: "system".to_string(),
            content: system.clone(),
        });
    }
    messages.extend(request.messages.iter().map(|m| OpenAiMessage {
        role: m.role.clone(),
        content: m.content.clone(),
    }));

    OpenAiRequest {
        model: request.model.clone(),
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stream: true,
    }
}

/// Interpret one SSE line. A chunk carrying both text and a finish reason
/// yields the text; the finish is picked up from the `[DONE]` sentinel or
/// the end of the body.
fn parse_line(line: &str) -> Result<Vec<SseEvent>, LlmError> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Ok(Vec::new());
    };
    if data == "[DONE]" {
        return Ok(vec![SseEvent::Done]);
    }

    let parsed = serde_json::from_str::<OpenAiStreamResponse>(data)
        .map_err(|e| LlmError::Parse(format!("{}: {}", e, data)))?;
    let Some(choice) = parsed.choices.into_iter().next() else {
        return Ok(Vec::new());
    };
    let mut events = Vec::new();
    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
        events.push(SseEvent::Delta(content));
    }
    if choice.finish_reason.is_some() {
        events.push(SseEvent::Done);
    }
    Ok(events)
}

pub fn chat_stream(client: &Client, config: &OpenAiConfig, request: &ChatRequest) -> FragmentStream {
    let body = build_request(request);

    let mut req = client
        .post(format!("{}/chat/completions", config.base_url))
        .header("Content-Type", "application/json")
        .json(&body);

    if !config.api_key.is_empty() {
        req = req.header("Authorization", format!("Bearer {}", config.api_key));
    }

    sse_fragments(req, parse_line)
}
