use axum::http::StatusCode;
use chat_box_lib::db::MemoryStore;
use chat_box_lib::llm::claude::ClaudeConfig;
use chat_box_lib::llm::openai::OpenAiConfig;
use chat_box_lib::llm::{ChatBackend, ChatMessage, LlmError, ProviderRouter, StreamOptions};
use chat_box_lib::session::{ChatSession, ExchangeOutcome, SessionOptions};
use chat_box_lib::{create_router, AppState, Config};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::{body_text, json_request};

const OPENAI_SSE: &str = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n\
data: [DONE]\n\n";

const CLAUDE_SSE: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Bon\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"jour\"}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

fn sse(body: &'static str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

fn router_for(server: &MockServer) -> ProviderRouter {
    ProviderRouter::new(
        Some(OpenAiConfig {
            api_key: "sk-test".into(),
            base_url: server.uri(),
        }),
        Some(ClaudeConfig {
            api_key: "ant-test".into(),
            base_url: server.uri(),
        }),
        1024,
    )
}

fn user(content: &str) -> Vec<ChatMessage> {
    vec![ChatMessage {
        role: "user".into(),
        content: content.into(),
    }]
}

fn options(model: &str) -> StreamOptions {
    StreamOptions {
        model: model.into(),
        temperature: 0.3,
        system_prompt: Some("Be brief.".into()),
    }
}

#[tokio::test]
async fn test_openai_stream_fragments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4",
            "stream": true,
            "max_tokens": 1024,
            "messages": [
                { "role": "system", "content": "Be brief." },
                { "role": "user", "content": "Hi" }
            ]
        })))
        .respond_with(sse(OPENAI_SSE))
        .expect(1)
        .mount(&server)
        .await;

    let fragments: Vec<String> = router_for(&server)
        .route_and_stream(&user("Hi"), &options("gpt-4"))
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(fragments, vec!["Hel", "lo"]);
}

#[tokio::test]
async fn test_claude_stream_fragments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "ant-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-3-opus-20240229",
            "system": "Be brief.",
            "stream": true
        })))
        .respond_with(sse(CLAUDE_SSE))
        .expect(1)
        .mount(&server)
        .await;

    let fragments: Vec<String> = router_for(&server)
        .route_and_stream(&user("Salut"), &options("claude-3-opus-20240229"))
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(fragments.concat(), "Bonjour");
}

#[tokio::test]
async fn test_provider_error_status_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let items: Vec<_> = router_for(&server)
        .route_and_stream(&user("Hi"), &options("gpt-4"))
        .collect()
        .await;
    assert_eq!(items.len(), 1);
    match &items[0] {
        Err(LlmError::Api { status, message }) => {
            assert_eq!(*status, 401);
            assert_eq!(message, "invalid api key");
        }
        other => panic!("expected API error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_session_over_real_router() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(OPENAI_SSE))
        .mount(&server)
        .await;

    let mut session = ChatSession::open(
        Arc::new(MemoryStore::new()),
        Arc::new(router_for(&server)),
        SessionOptions {
            model: "gpt-4".into(),
            ..SessionOptions::default()
        },
    );
    let outcome = session.send("Hi").await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Completed);
    assert_eq!(session.messages()[1].content, "Hello");
    assert_eq!(session.messages()[1].model.as_deref(), Some("gpt-4"));
}

#[tokio::test]
async fn test_proxy_route_streams_plain_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "gpt-3.5-turbo", "temperature": 0.7 })))
        .respond_with(sse(OPENAI_SSE))
        .expect(1)
        .mount(&server)
        .await;

    let providers = Arc::new(router_for(&server));
    let state = AppState::new(
        Config::default(),
        Arc::new(MemoryStore::new()),
        providers.clone(),
        providers,
    );
    let response = create_router(state)
        .oneshot(json_request(
            "POST",
            "/api/chat",
            "user",
            json!({ "messages": [{ "role": "user", "content": "Hi" }] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "Hello");
}
