use anyhow::Result;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::protocol::{Incoming, PROTOCOL_VERSION, Response, error_codes};
use crate::config::Config;
use crate::sandbox::PathSandbox;
use crate::scrub::{self, Tokenizer, patterns};

#[derive(Debug, Deserialize)]
struct ScrubTextArgs {
    text: String,
    #[serde(default)]
    item_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ScrubFileArgs {
    input_path: String,
    output_path: String,
    #[serde(default)]
    item_types: Vec<String>,
}

/// Serve the scrubbing tools over stdin/stdout, one JSON document per
/// line. stdout is the wire; nothing else may be written to it.
pub async fn run(config: &Config) -> Result<()> {
    let sandbox = PathSandbox::new(&config.scrub.data_path)?;

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Incoming>(&line) {
            Ok(message) => {
                let Some(id) = message.id.clone() else {
                    // Notification (e.g. notifications/initialized): no reply.
                    continue;
                };
                handle_request(id, &message, &sandbox)
            }
            Err(err) => Response::failure(
                Value::Null,
                error_codes::PARSE_ERROR,
                format!("Parse error: {err}"),
            ),
        };

        let mut frame = response.encode()?;
        frame.push('\n');
        stdout.write_all(frame.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}

fn handle_request(id: Value, message: &Incoming, sandbox: &PathSandbox) -> Response {
    match message.method.as_str() {
        "initialize" => Response::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "cloak-scrub",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/call" => match call_tool(message.params.as_ref(), sandbox) {
            Ok(result) => Response::success(id, wrap_tool_result(&result)),
            Err((code, message)) => Response::failure(id, code, message),
        },
        method => Response::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Unknown method: {method}"),
        ),
    }
}

/// MCP wraps tool results in a content array of text blocks.
fn wrap_tool_result(result: &Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": result.to_string() }]
    })
}

fn call_tool(params: Option<&Value>, sandbox: &PathSandbox) -> Result<Value, (i32, String)> {
    let params = params.ok_or((error_codes::INVALID_PARAMS, "Missing params".to_string()))?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or((error_codes::INVALID_PARAMS, "Missing tool name".to_string()))?;
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let invalid = |err: serde_json::Error| {
        (
            error_codes::INVALID_PARAMS,
            format!("Invalid arguments for '{name}': {err}"),
        )
    };

    match name {
        "scrub_prompt" => {
            let args: ScrubTextArgs = serde_json::from_value(arguments).map_err(invalid)?;
            let outcome = scrub::scrub_text(
                &args.text,
                &args.item_types,
                &patterns::STANDARD,
                &mut Tokenizer::new(),
            );
            serde_json::to_value(outcome).map_err(internal)
        }
        "scrub_log_as_prompt" => {
            let args: ScrubTextArgs = serde_json::from_value(arguments).map_err(invalid)?;
            let outcome = scrub::scrub_text(
                &args.text,
                &args.item_types,
                &patterns::MERGED,
                &mut Tokenizer::new(),
            );
            serde_json::to_value(outcome).map_err(internal)
        }
        "scrub_log_as_file" => {
            let args: ScrubFileArgs = serde_json::from_value(arguments).map_err(invalid)?;
            let summary =
                scrub::scrub_file(sandbox, &args.input_path, &args.output_path, &args.item_types)
                    .map_err(|err| (error_codes::TOOL_ERROR, err.to_string()))?;
            serde_json::to_value(summary).map_err(internal)
        }
        other => Err((
            error_codes::METHOD_NOT_FOUND,
            format!("Unknown tool: {other}"),
        )),
    }
}

fn internal(err: serde_json::Error) -> (i32, String) {
    (error_codes::INTERNAL_ERROR, err.to_string())
}
