use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    UnsupportedMedia(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Detection(String),

    #[error("{0}")]
    Scrub(String),

    #[error("Path escapes sandbox: {0}")]
    Sandbox(String),

    #[error("Downstream error: {0}")]
    Downstream(String),

    #[error("Tool call '{name}' timed out after {secs}s")]
    ToolTimeout { name: String, secs: u64 },

    #[error("Tool protocol error: {0}")]
    ToolProtocol(String),

    #[error("Tool server exited: {0}")]
    ToolExited(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Sandbox(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedMedia(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Detection(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Downstream(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": { "message": self.to_string() } }));
        (status, body).into_response()
    }
}
