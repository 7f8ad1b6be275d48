use axum::Json;
use axum::http::header;
use axum::response::{IntoResponse, Response};

// Non-streaming response format (compatible with OpenAI)
#[derive(Debug, serde::Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, serde::Serialize)]
pub struct ChatCompletionChoice {
    pub index: usize,
    pub message: ChatCompletionMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    pub content: String,
}

// Streaming response format (compatible with OpenAI)
#[derive(Debug, serde::Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Debug, serde::Serialize)]
pub struct ChatCompletionChunkChoice {
    pub index: usize,
    pub delta: ChatCompletionChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct ChatCompletionChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Synthesize a short status envelope for the chat UI.
///
/// This is what the caller sees instead of model output while scrubbing
/// is enabled: the turn completes, but the content is a `[STATUS]` line.
/// Streaming requests get exactly one SSE chunk followed by `[DONE]`.
pub fn status_response(stream: bool, model: &str, status: &str, message: &str) -> Response {
    let content = format!("[{}] {message}", status.to_uppercase());
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp() as u64;

    if stream {
        let chunk = ChatCompletionChunk {
            id,
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChatCompletionChunkChoice {
                index: 0,
                delta: ChatCompletionChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(content),
                },
                finish_reason: Some("stop".to_string()),
            }],
        };

        let body = match serde_json::to_string(&chunk) {
            Ok(json) => format!("data: {json}\n\ndata: [DONE]\n\n"),
            Err(_) => "data: [DONE]\n\n".to_string(),
        };

        return ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response();
    }

    let response = ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatCompletionMessage {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: Some("stop".to_string()),
        }],
    };

    Json(response).into_response()
}

pub fn error_response(stream: bool, model: &str, message: &str) -> Response {
    status_response(stream, model, "error", message)
}
