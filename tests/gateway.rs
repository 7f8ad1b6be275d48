//! End-to-end tests for the HTTP surface: a real gateway in front of a
//! fake LLM server, with the real tool-server binary behind the channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cloak::bus::PROMPT_CHANNEL;
use cloak::server::{AppState, router};
use cloak::tool::ToolChannel;
use cloak::Config;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;

const STREAM_BODY: &str =
    "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";

/// Canned OpenAI-compatible server standing in for the local LLM.
#[derive(Clone)]
struct FakeLlm {
    hits: Arc<AtomicUsize>,
    content: Arc<String>,
}

impl FakeLlm {
    fn completion_body(&self) -> Value {
        json!({
            "id": "fake-1",
            "object": "chat.completion",
            "model": "local",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": self.content.as_str() },
                "finish_reason": "stop",
            }],
        })
    }
}

async fn fake_completions(State(fake): State<FakeLlm>, Json(body): Json<Value>) -> Response {
    fake.hits.fetch_add(1, Ordering::SeqCst);

    if body["stream"].as_bool().unwrap_or(false) {
        return ([(header::CONTENT_TYPE, "text/event-stream")], STREAM_BODY).into_response();
    }

    Json(fake.completion_body()).into_response()
}

async fn fake_models() -> Json<Value> {
    Json(json!({ "object": "list", "data": [{ "id": "local" }] }))
}

struct Harness {
    base_url: String,
    fake: FakeLlm,
    state: AppState,
    _data_dir: tempfile::TempDir,
}

/// Boot a fake LLM and a gateway wired to it. `detector_content` is what
/// the fake LLM answers to every (non-streaming) completion, i.e. the
/// detector's raw verdict.
async fn spawn_gateway(detector_content: &str) -> Harness {
    let fake = FakeLlm {
        hits: Arc::new(AtomicUsize::new(0)),
        content: Arc::new(detector_content.to_string()),
    };
    let llm_app = Router::new()
        .route("/v1/chat/completions", post(fake_completions))
        .route("/v1/models", get(fake_models))
        .route("/health", get(|| async { "ok" }))
        .with_state(fake.clone());
    let llm_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let llm_addr = llm_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(llm_listener, llm_app).await.unwrap();
    });

    let data_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.llm.base_url = format!("http://{llm_addr}");
    config.scrub.data_path = data_dir.path().to_path_buf();
    config.scrub.prompt_limit_kb = 1;

    let tools = ToolChannel::new(env!("CARGO_BIN_EXE_cloak"), vec!["tool".into()])
        .with_env("SCRUB_DATA_PATH", data_dir.path().to_str().unwrap());
    let state = AppState::new(config).unwrap().with_tools(Arc::new(tools));

    let app = router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        base_url: format!("http://{addr}"),
        fake,
        state,
        _data_dir: data_dir,
    }
}

fn chat_body(prompt: &str, stream: bool) -> Value {
    json!({
        "model": "test-model",
        "messages": [{ "role": "user", "content": prompt }],
        "stream": stream,
    })
}

fn content_of(completion: &Value) -> &str {
    completion["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
}

const CLEAN_VERDICT: &str = r#"{"needs_sanitization": false, "category": "clean", "summary": "No sensitive data detected.", "items_detected": [], "item_types": []}"#;
const PII_VERDICT: &str = r#"{"needs_sanitization": true, "category": "pii", "summary": "Email found.", "items_detected": ["a@b.com"], "item_types": ["email"]}"#;
const LOG_VERDICT: &str = r#"{"needs_sanitization": true, "category": "log_file", "summary": "Server log.", "items_detected": [], "item_types": ["user", "ip"]}"#;
const EMPTY_TYPES_VERDICT: &str = r#"{"needs_sanitization": true, "category": "pii", "summary": "Something.", "items_detected": [], "item_types": []}"#;

#[tokio::test]
async fn test_clean_prompt_returns_clean_status() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;
    let mut events = harness.state.bus.subscribe(PROMPT_CHANNEL).await;

    let response: Value = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .json(&chat_body("How do I reverse a list?", false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(content_of(&response).starts_with("[CLEAN]"));

    let processing: Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert_eq!(processing["status"], "Processing...");
    assert_eq!(processing["sanitized"], "");

    let done: Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert_eq!(done["status"], "Clean");
    assert_eq!(done["sanitized"], "How do I reverse a list?");
    assert_eq!(done["prompt"], done["sanitized"]);
}

#[tokio::test]
async fn test_sensitive_prompt_is_scrubbed() {
    let harness = spawn_gateway(PII_VERDICT).await;
    let mut events = harness.state.bus.subscribe(PROMPT_CHANNEL).await;

    let response: Value = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .json(&chat_body("contact a@b.com about 10.0.0.1", false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let content = content_of(&response);
    assert!(content.starts_with("[SCRUBBED]"), "got: {content}");
    assert!(content.contains("2 items tokenized"));

    let _processing = events.recv().await.unwrap();
    let result: Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert_eq!(result["type"], "prompt_result");
    assert_eq!(result["sanitized"], "contact [EMAIL_1] about [IP_1]");
    assert_eq!(result["replacement_count"], 2);
    assert_eq!(result["detection"]["category"], "pii");
    // The status line is wire format for the panel, em dash included.
    assert_eq!(result["status"], "Pii — 2 items scrubbed (email: 1, ip: 1)");
    // Raw prompt is preserved for the side-by-side panel.
    assert_eq!(result["prompt"], "contact a@b.com about 10.0.0.1");
}

#[tokio::test]
async fn test_streaming_status_envelope() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .json(&chat_body("hello", true))
        .send()
        .await
        .unwrap();

    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let body = response.text().await.unwrap();
    let frames: Vec<&str> = body.split("\n\n").filter(|f| !f.is_empty()).collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1], "data: [DONE]");

    let chunk: Value =
        serde_json::from_str(frames[0].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(chunk["object"], "chat.completion.chunk");
    assert_eq!(chunk["choices"][0]["delta"]["role"], "assistant");
    assert!(
        chunk["choices"][0]["delta"]["content"]
            .as_str()
            .unwrap()
            .starts_with("[CLEAN]")
    );
}

#[tokio::test]
async fn test_detection_failure_blocks_request() {
    // A thinking model leaking its scratchpad is not valid JSON.
    let harness = spawn_gateway("<think>hmm</think> not json").await;
    let mut events = harness.state.bus.subscribe(PROMPT_CHANNEL).await;

    let response: Value = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .json(&chat_body("secret stuff", false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let content = content_of(&response);
    assert!(content.starts_with("[ERROR] Detection failed:"), "got: {content}");
    assert!(content.ends_with("Content blocked for safety."));

    let _processing = events.recv().await.unwrap();
    let event: Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert!(event["warning"].is_string());
    assert!(event["status"].as_str().unwrap().starts_with("Warning:"));
}

#[tokio::test]
async fn test_empty_item_types_yields_warning_not_scrub() {
    let harness = spawn_gateway(EMPTY_TYPES_VERDICT).await;

    let response: Value = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .json(&chat_body("hmm", false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let content = content_of(&response);
    assert!(content.starts_with("[WARNING]"));
    assert!(content.contains("Detection incomplete — content not scrubbed"));
}

#[tokio::test]
async fn test_oversize_prompt_skips_detection() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;

    let big = "x".repeat(2048);
    let response: Value = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .json(&chat_body(&big, false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let content = content_of(&response);
    assert!(content.starts_with("[ERROR] Content too large (2 KB)"), "got: {content}");
    // No detector call happened.
    assert_eq!(harness.fake.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_mode_toggle_and_passthrough() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;
    let client = reqwest::Client::new();

    let mode: Value = client
        .get(format!("{}/v1/mode", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(mode["scrubbing"], true);

    let mode: Value = client
        .post(format!("{}/v1/mode", harness.base_url))
        .json(&json!({ "scrubbing": false }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(mode["scrubbing"], false);

    // Non-streaming passthrough: downstream JSON comes back verbatim.
    let response: Value = client
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .json(&chat_body("anything", false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response, harness.fake.completion_body());

    // Streaming passthrough: bytes are relayed unmodified.
    let body = client
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .json(&chat_body("anything", true))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, STREAM_BODY);
}

#[tokio::test]
async fn test_models_passthrough() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;

    let models: Value = reqwest::Client::new()
        .get(format!("{}/v1/models", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(models["data"][0]["id"], "local");
}

#[tokio::test]
async fn test_health_reports_services() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;

    let health: Value = reqwest::Client::new()
        .get(format!("{}/health", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // The fake LLM is up; there is no upstream UI in this harness.
    assert_eq!(health["services"]["llm"], "ok");
    assert_eq!(health["services"]["openwebui"], "unavailable");
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_file_upload_scrub_and_download() {
    let harness = spawn_gateway(LOG_VERDICT).await;
    let mut events = harness.state.bus.subscribe(PROMPT_CHANNEL).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(
            b"user=jdoe GET /admin from 192.168.1.9\nuser=jdoe again\n".to_vec(),
        )
        .file_name("server.log")
        .mime_str("text/plain")
        .unwrap(),
    );

    let upload: Value = client
        .post(format!("{}/api/v1/files", harness.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(upload["status"], true);
    assert_eq!(upload["filename"], "server.log");
    // Empty content keeps the UI from running RAG on the raw file.
    assert_eq!(upload["data"]["content"], "");

    let event: Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert_eq!(event["type"], "file_scrubbed");
    let status = event["status"].as_str().unwrap();
    assert!(
        status.starts_with("Log File — 4 items scrubbed in 2 lines"),
        "got: {status}"
    );
    assert!(status.contains("\nDownload: /api/v1/files/download/"));

    let job_id = upload["id"]
        .as_str()
        .unwrap()
        .strip_prefix("cloak-")
        .unwrap()
        .to_string();

    let download = client
        .get(format!(
            "{}/api/v1/files/download/{job_id}",
            harness.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(download.status(), 200);
    let disposition = download.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("scrubbed_server.log"));

    let scrubbed = download.text().await.unwrap();
    assert!(!scrubbed.contains("jdoe"));
    assert!(!scrubbed.contains("192.168.1.9"));
    assert!(scrubbed.contains("[USER_1]"));
}

#[tokio::test]
async fn test_clean_file_synthesizes_success_without_scrub() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;
    let mut events = harness.state.bus.subscribe(PROMPT_CHANNEL).await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"notes about nothing\n".to_vec())
            .file_name("notes.txt")
            .mime_str("text/plain")
            .unwrap(),
    );

    let upload: Value = reqwest::Client::new()
        .post(format!("{}/api/v1/files", harness.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(upload["status"], true);
    assert_eq!(upload["data"]["content"], "");

    let event: Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert_eq!(event["status"], "Clean — no sensitive content detected");

    // Nothing was written to the sandbox.
    assert!(!harness.state.sandbox.root().join("out").exists());
}

#[tokio::test]
async fn test_binary_upload_rejected() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;

    let png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR rest".to_vec();
    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(png)
            .file_name("shot.png")
            .mime_str("image/png")
            .unwrap(),
    );

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/files", harness.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 415);
    let body: Value = response.json().await.unwrap();
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Images are not supported")
    );
}

#[tokio::test]
async fn test_dotfile_upload_rejected() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"SECRET=1\n".to_vec())
            .file_name(".env")
            .mime_str("text/plain")
            .unwrap(),
    );

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/files", harness.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_download_unknown_job_is_404() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;

    let response = reqwest::Client::new()
        .get(format!(
            "{}/api/v1/files/download/deadbeef",
            harness.base_url
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_observer_websocket_receives_events() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;

    let ws_url = format!(
        "ws://{}/ws/prompts",
        harness.base_url.strip_prefix("http://").unwrap()
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await.unwrap();
    // Give the upgrade task a beat to subscribe before publishing.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .json(&chat_body("hello there", false))
        .send()
        .await
        .unwrap();

    let first = socket.next().await.unwrap().unwrap();
    let event: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(event["status"], "Processing...");

    let second = socket.next().await.unwrap().unwrap();
    let event: Value = serde_json::from_str(second.to_text().unwrap()).unwrap();
    assert_eq!(event["status"], "Clean");
    assert_eq!(event["prompt"], "hello there");
}

#[tokio::test]
async fn test_frontend_config_flag() {
    let harness = spawn_gateway(CLEAN_VERDICT).await;

    let config: Value = reqwest::Client::new()
        .get(format!("{}/api/config", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(config["dev_mode"], false);
}
