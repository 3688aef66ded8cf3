mod api;
mod providers;

use axum::body::{to_bytes, Body};
use axum::http::{Request, Response};
use axum::Router;
use chat_box_lib::llm::{ChatBackend, ChatMessage, FragmentStream, LlmError, StreamOptions};
use chat_box_lib::{create_router, AppState, Config, MemoryStore, ProviderRouter};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tower::ServiceExt;

#[derive(Clone)]
pub enum Step {
    Fragment(&'static str),
    Fail(&'static str),
    Hang,
}

/// Replays one scripted response per call; defaults to a single "ok".
#[derive(Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Vec<Step>>>,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }
}

impl ChatBackend for ScriptedBackend {
    fn route_and_stream(&self, messages: &[ChatMessage], _options: &StreamOptions) -> FragmentStream {
        self.calls.lock().push(messages.to_vec());
        let script = self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![Step::Fragment("ok")]);
        Box::pin(async_stream::stream! {
            for step in script {
                match step {
                    Step::Fragment(text) => {
                        tokio::task::yield_now().await;
                        yield Ok(text.to_string());
                    }
                    Step::Fail(message) => {
                        yield Err(LlmError::Api { status: 500, message: message.to_string() });
                        break;
                    }
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

impl TestApp {
    pub fn new(backend: Arc<ScriptedBackend>) -> Self {
        Self::with_config(backend, Config::default())
    }

    pub fn with_config(backend: Arc<ScriptedBackend>, config: Config) -> Self {
        let state = AppState::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(ProviderRouter::new(None, None, 4096)),
            backend,
        );
        Self {
            router: create_router(state.clone()),
            state,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// A request carrying the forwarded identity headers for `role`.
pub fn request(method: &str, uri: &str, role: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", format!("{}-1", role))
        .header("x-user-name", format!("Test {}", role))
        .header("x-user-email", format!("{}@example.com", role))
        .header("x-user-role", role)
        .header("user-agent", "integration-test")
        .header("x-forwarded-for", "203.0.113.7")
}

pub fn json_request(method: &str, uri: &str, role: &str, body: serde_json::Value) -> Request<Body> {
    request(method, uri, role)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str, role: &str) -> Request<Body> {
    request(method, uri, role).body(Body::empty()).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}
