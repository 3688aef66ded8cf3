use axum::body::Body;
use axum::http::StatusCode;
use chat_box_lib::Config;
use futures::StreamExt;
use serde_json::json;

use super::*;

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(
            axum::http::Request::builder()
                .uri("/api/session")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn test_send_streams_reply_and_updates_session() {
    let app = TestApp::new(ScriptedBackend::new(vec![vec![
        Step::Fragment("Hello"),
        Step::Fragment(" world"),
    ]]));

    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "Hi" })))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-message-id"));
    assert_eq!(body_text(response).await, "Hello world");

    let session = body_json(app.send(empty_request("GET", "/api/session", "user")).await).await;
    assert_eq!(session["state"], "idle");
    let messages = session["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["content"], "Hello world");
}

#[tokio::test]
async fn test_send_validation_and_regenerate_preconditions() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));

    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "   " })))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(empty_request("POST", "/api/session/regenerate", "user"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.send(empty_request("POST", "/api/session/stop", "user")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_regenerate_with_hint_supersedes_previous_answer() {
    let app = TestApp::new(ScriptedBackend::new(vec![
        vec![Step::Fragment("long answer")],
        vec![Step::Fragment("short")],
    ]));

    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "Explain" })))
        .await;
    body_text(response).await;

    let response = app
        .send(json_request(
            "POST",
            "/api/session/regenerate",
            "user",
            json!({ "hint": "shorter" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "short");

    let session = body_json(app.send(empty_request("GET", "/api/session", "user")).await).await;
    let messages = session["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["superseded"], true);
    assert!(messages[2].get("superseded").is_none());
}

#[tokio::test]
async fn test_second_send_while_streaming_conflicts_and_stop_keeps_partial() {
    let app = TestApp::new(ScriptedBackend::new(vec![vec![
        Step::Fragment("partial"),
        Step::Hang,
    ]]));

    let streaming = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "one" })))
        .await;
    assert_eq!(streaming.status(), StatusCode::OK);

    let second = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "two" })))
        .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);

    let mut body = streaming.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert_eq!(&first[..], b"partial");

    let stop = app.send(empty_request("POST", "/api/session/stop", "user")).await;
    assert_eq!(stop.status(), StatusCode::ACCEPTED);
    assert!(body.next().await.is_none());

    let session = body_json(app.send(empty_request("GET", "/api/session", "user")).await).await;
    let messages = session["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["content"], "partial");
}

#[tokio::test]
async fn test_provider_failure_is_reported_in_body_and_history() {
    let app = TestApp::new(ScriptedBackend::new(vec![vec![Step::Fail("upstream down")]]));

    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "Hi" })))
        .await;
    let text = body_text(response).await;
    assert!(text.contains("[Error:"));
    assert!(text.contains("upstream down"));

    let session = body_json(app.send(empty_request("GET", "/api/session", "user")).await).await;
    assert_eq!(session["messages"][1]["error"], true);
}

#[tokio::test]
async fn test_feedback_requires_reason_for_negative() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "Hi" })))
        .await;
    body_text(response).await;

    let session = body_json(app.send(empty_request("GET", "/api/session", "user")).await).await;
    let id = session["messages"][1]["id"].as_str().unwrap().to_string();

    let response = app
        .send(json_request(
            "PUT",
            "/api/session/feedback",
            "user",
            json!({ "messageId": id, "feedback": "not_helpful" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(json_request(
            "PUT",
            "/api/session/feedback",
            "user",
            json!({ "messageId": id, "feedback": "not_helpful", "reason": "incorrect" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["reason"], "incorrect");

    let response = app
        .send(json_request(
            "PUT",
            "/api/session/feedback",
            "user",
            json!({ "messageId": "nope", "feedback": "helpful" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_attaches_file_to_next_message() {
    let backend = ScriptedBackend::new(vec![]);
    let app = TestApp::new(backend.clone());

    let response = app
        .send(
            request("POST", "/api/session/files", "user")
                .header("content-type", "text/plain")
                .header("x-file-name", "notes.txt")
                .body(Body::from("buy milk"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["kind"], "text");

    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "Summarize" })))
        .await;
    body_text(response).await;

    let calls = backend.calls.lock();
    assert!(calls[0][0].content.contains("buy milk"));
}

#[tokio::test]
async fn test_upload_rejections() {
    let config = Config {
        max_upload_bytes: 16,
        ..Config::default()
    };
    let app = TestApp::with_config(ScriptedBackend::new(vec![]), config);

    let response = app
        .send(
            request("POST", "/api/session/files", "user")
                .header("content-type", "image/png")
                .header("x-file-name", "cat.png")
                .body(Body::from(vec![0u8; 8]))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = app
        .send(
            request("POST", "/api/session/files", "user")
                .header("content-type", "text/plain")
                .header("x-file-name", "big.txt")
                .body(Body::from("x".repeat(20)))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = app
        .send(
            request("POST", "/api/session/files", "user")
                .header("content-type", "application/json")
                .header("x-file-name", "bad.json")
                .body(Body::from("{oops"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_conversation_lifecycle() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "Hi" })))
        .await;
    body_text(response).await;

    let response = app
        .send(json_request("POST", "/api/conversations", "user", json!({ "title": "First chat" })))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let saved = body_json(response).await;
    let id = saved["id"].as_str().unwrap().to_string();

    let response = app
        .send(json_request(
            "PATCH",
            &format!("/api/conversations/{}", id),
            "user",
            json!({ "title": "Renamed" }),
        ))
        .await;
    assert_eq!(body_json(response).await["title"], "Renamed");

    let listed = body_json(
        app.send(empty_request("GET", "/api/conversations?q=renam&sort=alphabetical", "user"))
            .await,
    )
    .await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let response = app.send(empty_request("DELETE", "/api/session", "user")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .send(empty_request("POST", &format!("/api/conversations/{}/load", id), "user"))
        .await;
    let session = body_json(response).await;
    assert_eq!(session["messages"], saved["messages"]);

    let response = app
        .send(empty_request("DELETE", &format!("/api/conversations/{}", id), "user"))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app
        .send(empty_request("GET", &format!("/api/conversations/{}", id), "user"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_saving_empty_session_rejected() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(json_request("POST", "/api/conversations", "user", json!({ "title": "Nothing" })))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_export_download() {
    let app = TestApp::new(ScriptedBackend::new(vec![vec![Step::Fragment("4")]]));

    let response = app
        .send(empty_request("GET", "/api/session/export?format=markdown", "user"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "2+2?" })))
        .await;
    body_text(response).await;

    let response = app
        .send(empty_request("GET", "/api/session/export?format=markdown", "user"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response.headers()["content-disposition"].to_str().unwrap().to_string();
    assert!(disposition.contains("chat-export-"));
    assert!(disposition.ends_with(".md\""));
    assert_eq!(body_text(response).await, "### You\n\n2+2?\n\n### AI\n\n4");
}

#[tokio::test]
async fn test_audit_logs_and_analytics_are_role_gated() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "Hi" })))
        .await;
    body_text(response).await;

    let response = app.send(empty_request("GET", "/api/audit-logs", "user")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = app.send(empty_request("GET", "/api/audit-logs", "analyst")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .send(empty_request("GET", "/api/audit-logs?category=chat&limit=10", "admin"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let logs = body_json(response).await;
    let entry = &logs.as_array().unwrap()[0];
    assert_eq!(entry["action"], "Sent chat message");
    assert_eq!(entry["userId"], "user-1");
    assert_eq!(entry["ipAddress"], "203.0.113.7");

    let response = app.send(empty_request("GET", "/api/analytics", "user")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = app.send(empty_request("GET", "/api/analytics", "analyst")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["modelUsage"][0]["model"], "gpt-3.5-turbo");
    assert_eq!(report["modelUsage"][0]["count"], 1);
}

#[tokio::test]
async fn test_navigation_follows_role() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let links = body_json(app.send(empty_request("GET", "/api/navigation", "analyst")).await).await;
    let paths: Vec<&str> = links
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["/", "/analytics"]);
}

#[tokio::test]
async fn test_settings_update_applies_to_session() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));

    let response = app
        .send(json_request("PUT", "/api/settings", "user", json!({ "temperature": 2.0 })))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(json_request(
            "PUT",
            "/api/settings",
            "user",
            json!({ "temperature": 0.2, "model": "gpt-4", "typingAnimationEnabled": false }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let settings = body_json(response).await;
    assert_eq!(settings["typingAnimationEnabled"], false);
    assert_eq!(settings["providers"]["openai"], false);

    let session = body_json(app.send(empty_request("GET", "/api/session", "user")).await).await;
    assert_eq!(session["model"], "gpt-4");
}

#[tokio::test]
async fn test_proxy_rejects_empty_messages() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(json_request("POST", "/api/chat", "user", json!({ "messages": [] })))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Messages are required");
}

#[tokio::test]
async fn test_proxy_without_key_is_server_error() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(json_request(
            "POST",
            "/api/claude",
            "user",
            json!({ "messages": [{ "role": "user", "content": "Hi" }] }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await["error"],
        "There was an error processing your request"
    );
}

#[tokio::test]
async fn test_rejected_model_switch_changes_nothing() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let before = body_json(app.send(empty_request("GET", "/api/session", "user")).await).await;

    let response = app
        .send(json_request(
            "PUT",
            "/api/session/model",
            "user",
            json!({ "temperature": 0.1, "model": "   " }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(json_request(
            "PUT",
            "/api/session/model",
            "user",
            json!({ "temperature": 1.5, "model": "gpt-4" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let after = body_json(app.send(empty_request("GET", "/api/session", "user")).await).await;
    assert_eq!(after["temperature"], before["temperature"]);
    assert_eq!(after["model"], before["model"]);

    let response = app
        .send(json_request(
            "PUT",
            "/api/session/model",
            "user",
            json!({ "temperature": 0.25, "model": " gpt-4 " }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let session = body_json(response).await;
    assert_eq!(session["model"], "gpt-4");
    assert_eq!(session["temperature"], 0.25);
}

#[tokio::test]
async fn test_admin_clears_audit_log() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "Hi" })))
        .await;
    body_text(response).await;
    assert!(!app.state.audit.is_empty());

    let response = app.send(empty_request("DELETE", "/api/audit-logs", "analyst")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(!app.state.audit.is_empty());

    let response = app.send(empty_request("DELETE", "/api/audit-logs", "admin")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let logs = body_json(app.send(empty_request("GET", "/api/audit-logs", "admin")).await).await;
    assert_eq!(logs, json!([]));
}

#[tokio::test]
async fn test_proxy_rejects_model_for_other_backend() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(json_request(
            "POST",
            "/api/claude",
            "user",
            json!({ "model": "openai/gpt-4", "messages": [{ "role": "user", "content": "Hi" }] }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("openai/gpt-4"));
}

#[tokio::test]
async fn test_changed_vote_counts_once_in_analytics() {
    let app = TestApp::new(ScriptedBackend::new(vec![]));
    let response = app
        .send(json_request("POST", "/api/session/messages", "user", json!({ "content": "Hi" })))
        .await;
    body_text(response).await;

    let session = body_json(app.send(empty_request("GET", "/api/session", "user")).await).await;
    let id = session["messages"][1]["id"].as_str().unwrap().to_string();

    for vote in [
        json!({ "messageId": id, "feedback": "helpful" }),
        json!({ "messageId": id, "feedback": "not_helpful", "reason": "incorrect" }),
    ] {
        let response = app
            .send(json_request("PUT", "/api/session/feedback", "user", vote))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let report = body_json(app.send(empty_request("GET", "/api/analytics", "admin")).await).await;
    assert_eq!(report["feedback"]["helpful"], 0);
    assert_eq!(report["feedback"]["notHelpful"], 1);
    assert_eq!(report["feedback"]["reasons"]["incorrect"], 1);
}
