use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use log::{error, warn};
use serde_json::{Value, json};

use crate::bus::PROMPT_CHANNEL;
use crate::chat::{error_response, status_response};
use crate::detector::{Category, Verdict};
use crate::error::Error;
use crate::scrub::patterns::all_item_types;
use crate::server::AppState;

/// Intercept a chat completion: detect, scrub if needed, and answer with a
/// status envelope. With scrubbing disabled this degenerates to a
/// transparent proxy.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    if !state.scrubbing_enabled() {
        return match state.llm.proxy_chat(body).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
    }

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let prompt = last_user_message(&body);
    let session_id = uuid::Uuid::new_v4().to_string();

    // Size ceiling comes first; oversize content never reaches the detector.
    let limit = state.config.scrub.prompt_limit();
    if prompt.len() > limit {
        return error_response(
            stream,
            &model,
            &format!(
                "Content too large ({} KB). Maximum is {} KB. Use file upload for large files.",
                prompt.len() / 1024,
                limit / 1024,
            ),
        );
    }

    // Let the panel show a loader while detection runs.
    state
        .bus
        .publish(
            PROMPT_CHANNEL,
            &json!({ "prompt": prompt, "sanitized": "", "status": "Processing..." }),
        )
        .await;

    let detection = state.detector.detect(&prompt, &session_id).await;

    // Fail-closed: detection errors block the request.
    if detection.category == Category::Error {
        let reason = if detection.summary.is_empty() {
            "Detection failed".to_string()
        } else {
            detection.summary.clone()
        };
        publish_result(&state, &prompt, &detection, &prompt, 0, None, Some(&reason)).await;
        return error_response(
            stream,
            &model,
            &format!("{reason}. Content blocked for safety."),
        );
    }

    if !detection.needs_sanitization {
        publish_result(&state, &prompt, &detection, &prompt, 0, None, None).await;
        return status_response(stream, &model, "clean", "No sensitive content detected.");
    }

    // Flagged but without item types: detection is incomplete, and acting
    // on it would scrub blind. Report instead.
    if detection.item_types().is_empty() {
        warn!("Detection flagged content but returned no item types: {detection:?}");
        let reason = "Detection incomplete: no item types returned";
        publish_result(&state, &prompt, &detection, &prompt, 0, None, Some(reason)).await;
        return status_response(
            stream,
            &model,
            "warning",
            "Detection incomplete — content not scrubbed. Please review.",
        );
    }

    // Detection categorizes; scrubbing is comprehensive. Always run the
    // full union of prompt and log patterns, since log data carries
    // prompt-type items and vice versa.
    let outcome = match state
        .tools
        .scrub_log_as_prompt(&prompt, &all_item_types())
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Scrub failed: {err}");
            let reason = format!("Scrub failed: {err}");
            publish_result(&state, &prompt, &detection, &prompt, 0, None, Some(&reason)).await;
            return error_response(stream, &model, &format!("{reason}. Content blocked for safety."));
        }
    };

    publish_result(
        &state,
        &prompt,
        &detection,
        &outcome.sanitized_text,
        outcome.replacements.len(),
        Some(&outcome.summary),
        None,
    )
    .await;

    status_response(
        stream,
        &model,
        "scrubbed",
        &format!("{} items tokenized.", outcome.replacements.len()),
    )
}

/// Proxy the downstream model list.
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, Error> {
    Ok(Json(state.llm.list_models().await?))
}

/// The prompt is the content of the last user-role message.
fn last_user_message(body: &Value) -> String {
    body.get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
                .next_back()
                .and_then(|m| m.get("content").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string()
        })
        .unwrap_or_default()
}

/// Publish an interception result to the panel. Both original and
/// sanitized text go out for side-by-side comparison; this is a local
/// audit tool, the observer channel never leaves the host.
async fn publish_result(
    state: &AppState,
    original: &str,
    detection: &Verdict,
    sanitized: &str,
    replacement_count: usize,
    summary: Option<&BTreeMap<String, usize>>,
    warning: Option<&str>,
) {
    let status = if let Some(warning) = warning {
        format!("Warning: {warning}")
    } else if detection.category == Category::Error {
        "Error".to_string()
    } else if !detection.needs_sanitization {
        detection.category.label()
    } else {
        let plural = if replacement_count == 1 { "" } else { "s" };
        let mut status = format!(
            "{} — {replacement_count} item{plural} scrubbed",
            detection.category.label()
        );
        if let Some(summary) = summary
            && !summary.is_empty()
        {
            let breakdown = summary
                .iter()
                .map(|(item_type, count)| format!("{item_type}: {count}"))
                .collect::<Vec<_>>()
                .join(", ");
            status.push_str(&format!(" ({breakdown})"));
        }
        status
    };

    let mut payload = json!({
        "prompt": original,
        "sanitized": sanitized,
        "status": status,
        "type": "prompt_result",
        "detection": {
            "category": detection.category,
            "needs_sanitization": detection.needs_sanitization,
        },
        "replacement_count": replacement_count,
        "summary": summary.cloned().unwrap_or_default(),
    });
    if let Some(warning) = warning {
        payload["warning"] = json!(warning);
    }

    state.bus.publish(PROMPT_CHANNEL, &payload).await;
}
