use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{LlmConfig, UpstreamConfig};
use crate::error::{Error, Result};

const MODELS_TIMEOUT: Duration = Duration::from_secs(10);
const PROXY_TIMEOUT: Duration = Duration::from_secs(120);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Seam between the detector and the downstream LLM, so detection logic
/// can be exercised against canned responses.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Model identifier, used in event metadata.
    fn model(&self) -> &str;

    /// Send a chat completion and return the assistant's text.
    async fn complete(&self, messages: Vec<ChatMessage>, temperature: f64) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

/// Client for the local inference server (llama.cpp-style, OpenAI-compatible).
#[derive(Debug, Clone)]
pub struct LlmClient {
    base_url: String,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            http_client: reqwest::Client::new(),
        }
    }

    /// Pass a chat-completion body through untouched.
    ///
    /// Streaming responses are relayed chunk by chunk as they arrive;
    /// non-streaming responses come back as the downstream JSON verbatim.
    pub async fn proxy_chat(&self, body: Value) -> Result<Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let stream = body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if stream {
            let response = self.http_client.post(&url).json(&body).send().await?;
            let stream = response.bytes_stream();

            return Ok((
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(stream),
            )
                .into_response());
        }

        let response = self
            .http_client
            .post(&url)
            .timeout(PROXY_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let value: Value = response.json().await?;
        Ok(Json(value).into_response())
    }

    /// Proxy the model list so the chat UI can discover available models.
    pub async fn list_models(&self) -> Result<Value> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .timeout(MODELS_TIMEOUT)
            .send()
            .await?;
        Ok(response.json().await?)
    }

    pub async fn healthy(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http_client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl CompletionClient for LlmClient {
    fn model(&self) -> &str {
        "local"
    }

    async fn complete(&self, messages: Vec<ChatMessage>, temperature: f64) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model(),
            "messages": messages,
            "temperature": temperature,
        });

        debug!("Sending completion request to {url}");
        let response = self
            .http_client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Downstream(format!(
                "LLM returned {}",
                response.status()
            )));
        }

        let data: CompletionResponse = response.json().await?;
        data.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| Error::Downstream("No choices in LLM response".into()))
    }
}

/// Client for the chat UI we front. Only used in passthrough mode (file
/// forwarding) and for the health probe.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Forward an upload to the UI's file endpoint and return its JSON
    /// reply unchanged.
    pub async fn forward_file(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<Value> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(content_type)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!("{}/api/v1/files", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;

        Ok(response.json().await?)
    }

    pub async fn healthy(&self) -> bool {
        let url = format!("{}/api/version", self.base_url);
        match self
            .http_client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
