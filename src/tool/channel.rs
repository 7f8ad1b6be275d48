use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{info, warn};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::protocol::{Notification, PROTOCOL_VERSION, Request, Response};
use crate::error::{Error, Result};
use crate::scrub::{FileScrubSummary, ScrubOutcome};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    NotStarted,
    Initializing,
    Ready,
    Broken,
}

struct Live {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

struct ChannelState {
    live: Option<Live>,
    session: Session,
    next_id: u64,
}

/// Long-lived channel to the scrubbing tool server.
///
/// Owns the child process exclusively and serializes calls: at most one
/// request is in flight, and frames on the pipe are order-coupled to
/// request ids. All restart logic is internal; callers only see `call`
/// and the typed wrappers.
pub struct ToolChannel {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    call_timeout: Duration,
    inner: Mutex<ChannelState>,
}

impl ToolChannel {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            inner: Mutex::new(ChannelState {
                live: None,
                session: Session::NotStarted,
                next_id: 0,
            }),
        }
    }

    /// Channel that spawns this executable's own `tool` subcommand.
    pub fn for_current_exe() -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe, vec!["tool".into()]))
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Set an extra environment variable on the child, on top of the
    /// inherited process environment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub async fn session(&self) -> Session {
        self.inner.lock().await.session
    }

    /// OS pid of the running child, if any.
    pub async fn child_pid(&self) -> Option<u32> {
        self.inner
            .lock()
            .await
            .live
            .as_ref()
            .and_then(|live| live.child.id())
    }

    pub async fn scrub_prompt(&self, text: &str, item_types: &[String]) -> Result<ScrubOutcome> {
        let value = self
            .call("scrub_prompt", json!({ "text": text, "item_types": item_types }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn scrub_log_as_prompt(
        &self,
        text: &str,
        item_types: &[String],
    ) -> Result<ScrubOutcome> {
        let value = self
            .call(
                "scrub_log_as_prompt",
                json!({ "text": text, "item_types": item_types }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn scrub_log_as_file(
        &self,
        input_path: &str,
        output_path: &str,
        item_types: &[String],
    ) -> Result<FileScrubSummary> {
        let value = self
            .call(
                "scrub_log_as_file",
                json!({
                    "input_path": input_path,
                    "output_path": output_path,
                    "item_types": item_types,
                }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call a tool and return its unwrapped result payload.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        // (Re)spawn if the child exited or was never started.
        let needs_start = match state.live.as_mut() {
            None => true,
            Some(live) => live.child.try_wait()?.is_some(),
        };
        if needs_start {
            self.start(state).await?;
        }

        state.next_id += 1;
        let id = state.next_id;
        let frame = Request::new(
            id,
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .encode()?;

        let live = live_mut(state)?;
        if let Err(err) = write_line(&mut live.stdin, &frame).await {
            // The pipe is gone; presume the child dead. Respawn, redo the
            // handshake, and retry this call once with a fresh id.
            warn!("Tool server write failed ({err}), respawning");
            self.teardown(state).await;
            self.start(state).await?;

            state.next_id += 1;
            let id = state.next_id;
            let frame = Request::new(
                id,
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .encode()?;
            let live = live_mut(state)?;
            write_line(&mut live.stdin, &frame).await?;
            return self.await_response(state, id, name).await;
        }

        self.await_response(state, id, name).await
    }

    async fn await_response(
        &self,
        state: &mut ChannelState,
        id: u64,
        name: &str,
    ) -> Result<Value> {
        let live = live_mut(state)?;

        let line = match timeout(self.call_timeout, live.stdout.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                self.teardown(state).await;
                return Err(Error::ToolExited("stdout closed".into()));
            }
            Ok(Err(err)) => {
                self.teardown(state).await;
                return Err(Error::Io(err));
            }
            Err(_) => {
                // A late response would be mis-read as the next call's
                // reply, so the child must not survive a timeout.
                self.teardown(state).await;
                return Err(Error::ToolTimeout {
                    name: name.to_string(),
                    secs: self.call_timeout.as_secs(),
                });
            }
        };

        let response: Response = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(err) => {
                // An unparseable frame means the stream is desynced.
                self.teardown(state).await;
                return Err(Error::ToolProtocol(format!("Unparseable response: {err}")));
            }
        };

        if response.id.as_ref().and_then(Value::as_u64) != Some(id) {
            // Mismatched frames cannot be recovered without a restart.
            self.teardown(state).await;
            return Err(Error::ToolProtocol(format!(
                "Response id mismatch: expected {id}, got {:?}",
                response.id
            )));
        }

        if let Some(error) = response.error {
            return Err(Error::Scrub(error.message));
        }

        unwrap_result(response.result)
    }

    async fn start(&self, state: &mut ChannelState) -> Result<()> {
        match self.try_start(state).await {
            Ok(()) => Ok(()),
            Err(err) => {
                state.live = None;
                state.session = Session::Broken;
                Err(err)
            }
        }
    }

    async fn try_start(&self, state: &mut ChannelState) -> Result<()> {
        state.session = Session::Initializing;
        info!("Spawning tool server: {}", self.program.display());

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Capturing stderr risks deadlocking on a full pipe.
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ToolExited("no stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ToolExited("no stdout handle".into()))?;

        let mut live = Live {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        // MCP handshake: initialize request, then initialized notification.
        state.next_id += 1;
        let id = state.next_id;
        let frame = Request::new(
            id,
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "cloak", "version": env!("CARGO_PKG_VERSION") },
            })),
        )
        .encode()?;
        write_line(&mut live.stdin, &frame).await?;

        let line = timeout(HANDSHAKE_TIMEOUT, live.stdout.next_line())
            .await
            .map_err(|_| Error::ToolProtocol("initialize timed out".into()))??
            .ok_or_else(|| Error::ToolExited("stdout closed during handshake".into()))?;

        let response: Response = serde_json::from_str(&line)?;
        if let Some(error) = response.error {
            return Err(Error::ToolProtocol(format!(
                "initialize failed: {}",
                error.message
            )));
        }

        let note = Notification::new("notifications/initialized").encode()?;
        write_line(&mut live.stdin, &note).await?;

        state.live = Some(live);
        state.session = Session::Ready;
        Ok(())
    }

    async fn teardown(&self, state: &mut ChannelState) {
        if let Some(mut live) = state.live.take() {
            let _ = live.child.kill().await;
        }
        state.session = Session::Broken;
    }
}

fn live_mut(state: &mut ChannelState) -> Result<&mut Live> {
    state
        .live
        .as_mut()
        .ok_or_else(|| Error::ToolExited("tool server not running".into()))
}

async fn write_line(stdin: &mut ChildStdin, frame: &str) -> std::io::Result<()> {
    stdin.write_all(frame.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Unwrap the MCP-shaped `result.content[0].text` JSON payload when
/// present; otherwise hand back the raw result.
fn unwrap_result(result: Option<Value>) -> Result<Value> {
    let result = result.unwrap_or(Value::Null);

    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|content| content.first())
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|block| block.get("text"))
        .and_then(Value::as_str);

    match text {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Ok(result),
    }
}
