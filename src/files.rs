use std::path::Path as FsPath;

use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use log::{error, info};
use serde_json::{Value, json};

use crate::bus::PROMPT_CHANNEL;
use crate::detector::Category;
use crate::error::{Error, Result};
use crate::scrub::patterns::all_item_types;
use crate::server::AppState;

const SNIFF_LEN: usize = 2048;
const DETECT_SAMPLE_LEN: usize = 4096;

const ALLOWED_TYPES: &[&str] = &[
    "text/plain",
    "text/csv",
    "text/log",
    "application/json",
    "application/x-ndjson",
];

const REJECTED_TYPES: &[(&str, &str)] = &[
    (
        "image/",
        "Images are not supported. Please paste text content directly.",
    ),
    ("video/", "Video files are not supported."),
    ("audio/", "Audio files are not supported."),
    (
        "application/pdf",
        "PDF files are not yet supported. Copy and paste the text content instead.",
    ),
    (
        "application/zip",
        "Archive files are not supported. Extract and upload text files.",
    ),
];

/// Intercept a file upload: validate, detect, scrub if sensitive, and
/// synthesize the upload reply the chat UI expects.
pub async fn upload(State(state): State<AppState>, multipart: Multipart) -> Response {
    match intercept_upload(&state, multipart).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn intercept_upload(state: &AppState, mut multipart: Multipart) -> Result<Response> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| Error::Validation(format!("Malformed multipart body: {err}")))?
    {
        if field.name() != Some("file") && field.file_name().is_none() {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field
            .content_type()
            .unwrap_or("text/plain")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| Error::Validation(format!("Failed to read upload: {err}")))?;
        file = Some((filename, content_type, bytes.to_vec()));
        break;
    }

    let Some((raw_filename, content_type, bytes)) = file else {
        return Err(Error::Validation("Missing file field".into()));
    };

    let filename = sanitize_filename(&raw_filename)?;
    let job_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

    // 1. Size, regardless of mode.
    let limit = state.config.scrub.file_limit();
    if bytes.len() > limit {
        let message = format!(
            "File too large ({} KB). Max {} KB.",
            bytes.len() / 1024,
            limit / 1024,
        );
        publish_file_event(state, &filename, &format!("Error: {message}"), "file_event", json!({}))
            .await;
        return Err(Error::PayloadTooLarge(message));
    }

    // 2. MIME, sniffed from leading bytes. Binary formats never pass, in
    // either mode.
    if let Err(message) = check_mime(&bytes[..bytes.len().min(SNIFF_LEN)]) {
        publish_file_event(state, &filename, &format!("Error: {message}"), "file_event", json!({}))
            .await;
        return Err(Error::UnsupportedMedia(message));
    }

    // 3. Scrubbing off: hand text files to the UI for its normal flow.
    if !state.scrubbing_enabled() {
        let reply = state
            .upstream
            .forward_file(&filename, bytes, &content_type)
            .await?;
        return Ok(Json(reply).into_response());
    }

    // 4. Strict UTF-8. Replacement decoding is not acceptable on content
    // that will be released as scrubbed.
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => {
            let message = "File does not appear to be valid text.";
            publish_file_event(
                state,
                &filename,
                &format!("Error: {message}"),
                "file_event",
                json!({}),
            )
            .await;
            return Err(Error::UnsupportedMedia(message.into()));
        }
    };

    // 5. Detect on a leading sample; the whole file gets scrubbed anyway.
    let mut sample_end = text.len().min(DETECT_SAMPLE_LEN);
    while !text.is_char_boundary(sample_end) {
        sample_end -= 1;
    }
    let detection = state.detector.detect(&text[..sample_end], &job_id).await;

    if detection.category == Category::Error {
        let reason = if detection.summary.is_empty() {
            "Detection failed".to_string()
        } else {
            detection.summary.clone()
        };
        publish_file_event(state, &filename, &format!("Error: {reason}"), "file_event", json!({}))
            .await;
        return Err(Error::Detection(format!(
            "{reason}. Upload blocked for safety."
        )));
    }

    if !detection.needs_sanitization {
        publish_file_event(
            state,
            &filename,
            "Clean — no sensitive content detected",
            "file_event",
            json!({}),
        )
        .await;
        return Ok(Json(synthetic_upload_response(&job_id, &filename)).into_response());
    }

    // 6. Save the input under the sandbox and scrub via the tool server.
    let input_name = format!("{job_id}.txt");
    let output_name = format!("{job_id}_{filename}");
    let input_path = state.sandbox.resolve(&input_name, "in")?;
    if let Some(parent) = input_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&input_path, &text).await?;

    let summary = match state
        .tools
        .scrub_log_as_file(&input_name, &output_name, &all_item_types())
        .await
    {
        Ok(summary) => summary,
        Err(err) => {
            error!("File scrub failed: {err}");
            publish_file_event(
                state,
                &filename,
                &format!("Error: {err}"),
                "file_event",
                json!({}),
            )
            .await;
            return Err(Error::Scrub(err.to_string()));
        }
    };

    info!(
        "Scrubbed {} items across {} lines of {filename} (job {job_id})",
        summary.items_scrubbed, summary.lines_processed
    );

    let download_url = format!("/api/v1/files/download/{job_id}");
    let mut status = format!(
        "{} — {} items scrubbed in {} lines",
        detection.category.label(),
        summary.items_scrubbed,
        summary.lines_processed,
    );
    if !summary.summary.is_empty() {
        let breakdown = summary
            .summary
            .iter()
            .map(|(item_type, count)| format!("{item_type}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");
        status.push_str(&format!(" ({breakdown})"));
    }
    status.push_str(&format!("\nDownload: {download_url}"));

    publish_file_event(
        state,
        &filename,
        &status,
        "file_scrubbed",
        json!({
            "job_id": job_id,
            "category": detection.category,
            "summary": summary,
            "download_url": download_url,
        }),
    )
    .await;

    Ok(Json(synthetic_upload_response(&job_id, &filename)).into_response())
}

/// Download a scrubbed file by job id.
///
/// No authentication: the gateway's deployment contract is loopback-only.
pub async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response> {
    let not_found = || Error::NotFound(format!("No scrubbed file found for job {job_id}"));

    let out_dir = state.sandbox.root().join("out");
    let prefix = format!("{job_id}_");

    let mut entries = tokio::fs::read_dir(&out_dir).await.map_err(|_| not_found())?;
    let mut found: Option<(std::path::PathBuf, String)> = None;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(&prefix)
        {
            found = Some((entry.path(), name.to_string()));
            break;
        }
    }

    let (path, name) = found.ok_or_else(not_found)?;
    let original = &name[prefix.len()..];
    let safe_name: String = original
        .chars()
        .filter(|c| !matches!(c, '"' | '\n' | '\r'))
        .collect();

    let bytes = tokio::fs::read(&path).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"scrubbed_{safe_name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// Basename only: no path components, no leading dot.
fn sanitize_filename(name: &str) -> Result<String> {
    let base = FsPath::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if base.is_empty() || base != name || base.starts_with('.') || name.contains('\\') {
        return Err(Error::Validation("Invalid filename".into()));
    }

    Ok(base.to_string())
}

/// Sniff the leading bytes. Formats `infer` cannot identify are treated as
/// text candidates; the strict UTF-8 decode is the final gate.
fn check_mime(sniff: &[u8]) -> std::result::Result<(), String> {
    let Some(kind) = infer::get(sniff) else {
        return Ok(());
    };
    let mime = kind.mime_type();

    for (prefix, message) in REJECTED_TYPES {
        if mime.starts_with(prefix) {
            return Err((*message).to_string());
        }
    }

    if !ALLOWED_TYPES.contains(&mime) && !mime.starts_with("text/") {
        return Err(format!("Unsupported file type: {mime}"));
    }

    Ok(())
}

/// Reply that satisfies the UI's upload contract without triggering
/// retrieval-augmented processing: empty `content` is the opt-out signal.
fn synthetic_upload_response(job_id: &str, filename: &str) -> Value {
    json!({
        "status": true,
        "id": format!("cloak-{job_id}"),
        "filename": filename,
        "data": { "status": "completed", "content": "" },
        "meta": {
            "name": filename,
            "content_type": "text/plain",
            "size": 0,
        },
    })
}

async fn publish_file_event(
    state: &AppState,
    filename: &str,
    status: &str,
    event_type: &str,
    extra: Value,
) {
    let mut payload = json!({
        "prompt": format!("[File Upload: {filename}]"),
        "sanitized": "",
        "status": status,
        "type": event_type,
        "filename": filename,
    });
    if let Some(map) = extra.as_object() {
        for (key, value) in map {
            payload[key] = value.clone();
        }
    }

    state.bus.publish(PROMPT_CHANNEL, &payload).await;
}
